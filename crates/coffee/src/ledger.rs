//! Ledger surface of the Coffee contract: payable append, owner-gated withdraw,
//! count and balance.
//!
//! The pipeline only reads from the ledger. `append` and `withdraw` are
//! fire-and-forget requests: success means the ledger accepted the
//! transaction, and the resulting memo arrives through the event source.

use crate::abi::{
    decode_address_return, decode_u64_return, encode_buy_coffee, encode_no_args, MEMO_COUNT_SIGNATURE,
    OWNER_SIGNATURE, WITHDRAW_SIGNATURE,
};
use crate::entry::{validate_memo, Address, EntryError};
use crate::rpc::RpcClient;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Withdraw attempted by someone other than the owner. Never retried.
    #[error("access denied: 0x{} is not the owner", hex::encode(.caller))]
    AccessDenied { caller: Address },

    #[error("invalid memo: {0}")]
    InvalidEntry(#[from] EntryError),

    #[error("ledger transport: {0:#}")]
    Transport(#[from] anyhow::Error),
}

/// Acknowledgement of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: [u8; 32],
    /// Known only to ledgers that confirm synchronously.
    pub sequence: Option<u64>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a memo with `amount` attached (payable).
    async fn append(
        &self,
        caller: Address,
        author: &str,
        message: &str,
        amount: u128,
    ) -> Result<Submission, LedgerError>;

    /// Move the whole balance to the owner.
    async fn withdraw(&self, caller: Address) -> Result<Submission, LedgerError>;

    /// Number of memos ever appended.
    async fn count(&self) -> Result<u64, LedgerError>;

    /// Withdrawable balance.
    async fn balance(&self) -> Result<u128, LedgerError>;
}

/// The Coffee contract over JSON-RPC. Transactions are sent with
/// `eth_sendTransaction`, so `caller` must be an account the node can sign for
/// (e.g. an Anvil dev account).
#[derive(Debug)]
pub struct RpcLedger {
    rpc: RpcClient,
    contract: Address,
}

impl RpcLedger {
    pub fn new(http_url: impl Into<String>, contract: Address) -> anyhow::Result<Self> {
        Ok(Self {
            rpc: RpcClient::new(http_url)?,
            contract,
        })
    }

    pub async fn owner(&self) -> Result<Address, LedgerError> {
        let ret = self
            .rpc
            .eth_call(&self.contract, &encode_no_args(OWNER_SIGNATURE))
            .await?;
        Ok(decode_address_return(&ret)?)
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn append(
        &self,
        caller: Address,
        author: &str,
        message: &str,
        amount: u128,
    ) -> Result<Submission, LedgerError> {
        validate_memo(author, message)?;
        let tx_hash = self
            .rpc
            .send_transaction(&caller, &self.contract, amount, &encode_buy_coffee(author, message))
            .await?;
        tracing::info!(tx = %hex::encode(tx_hash), author, amount = %amount, "buyCoffee submitted");
        Ok(Submission {
            tx_hash,
            sequence: None,
        })
    }

    async fn withdraw(&self, caller: Address) -> Result<Submission, LedgerError> {
        if self.owner().await? != caller {
            return Err(LedgerError::AccessDenied { caller });
        }
        let tx_hash = self
            .rpc
            .send_transaction(&caller, &self.contract, 0, &encode_no_args(WITHDRAW_SIGNATURE))
            .await?;
        tracing::info!(tx = %hex::encode(tx_hash), "withdrawTips submitted");
        Ok(Submission {
            tx_hash,
            sequence: None,
        })
    }

    async fn count(&self) -> Result<u64, LedgerError> {
        let ret = self
            .rpc
            .eth_call(&self.contract, &encode_no_args(MEMO_COUNT_SIGNATURE))
            .await?;
        Ok(decode_u64_return(&ret)?)
    }

    async fn balance(&self) -> Result<u128, LedgerError> {
        Ok(self.rpc.get_balance(&self.contract).await?)
    }
}
