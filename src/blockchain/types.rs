use ethers::types::{Bytes, H256};

/// Blockchain interaction errors
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Transaction not mined within the polling window: {0:?}")]
    ReceiptTimeout(H256),
}

/// Terminal state of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Mined with a success status
    Confirmed,
    /// Mined but reverted
    Reverted,
    /// Never observed in a mined block
    Dropped,
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Confirmed => write!(f, "confirmed"),
            TxStatus::Reverted => write!(f, "reverted"),
            TxStatus::Dropped => write!(f, "dropped"),
        }
    }
}

/// Result of a clearinghouse feasibility check
#[derive(Debug, Clone)]
pub struct SettleResponse {
    pub success: bool,
    /// Opaque reason data when infeasible
    pub data: Bytes,
}
