//! Clearinghouse contract client.
//!
//! Settlement is a two-step conversation: a `canSettle` view simulation over
//! the candidate group, then the `settle` transaction itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::types::H256;
use tracing::debug;

use crate::blockchain::types::{ChainError, SettleResponse, TxStatus};
use crate::models::LimitOrder;

abigen!(
    IClearingHouse,
    r#"[
        struct Metadata { uint256 genesis; uint256 expiration; bytes32 trackingCode; address referrer; }
        struct Trader { uint256 nonce; uint128 accountId; address signer; }
        struct Trade { uint8 t; uint128 marketId; int128 size; uint256 price; }
        struct Condition { address target; bytes4 selector; bytes data; bytes32 expected; }
        struct Order { Metadata metadata; Trader trader; Trade trade; Condition[] conditions; }
        struct Request { Order[] orders; bytes[] signatures; }
        struct Response { bool success; bytes data; }
        function canSettle(Request calldata request) external view returns (Response memory)
        function settle(Request calldata request) external
    ]"#
);

pub type ChainClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// The settlement surface of the clearinghouse contract.
#[async_trait]
pub trait Clearinghouse: Send + Sync {
    /// Simulate settlement of the group; an unsuccessful response carries
    /// opaque reason data.
    async fn can_settle(&self, orders: &[LimitOrder]) -> Result<SettleResponse, ChainError>;

    /// Submit the settlement transaction and return its hash without waiting
    /// for inclusion.
    async fn settle(&self, orders: &[LimitOrder]) -> Result<H256, ChainError>;

    /// Poll for the transaction receipt until a terminal status or the
    /// polling window runs out.
    async fn wait_for_receipt(&self, tx_hash: H256) -> Result<TxStatus, ChainError>;
}

/// Clearinghouse client backed by a signing RPC connection.
pub struct EthersClearinghouse {
    contract: IClearingHouse<ChainClient>,
    client: Arc<ChainClient>,
    receipt_poll_interval: Duration,
    receipt_poll_attempts: u32,
}

impl EthersClearinghouse {
    pub fn new(
        address: ethers::types::Address,
        client: Arc<ChainClient>,
        receipt_poll_interval: Duration,
        receipt_poll_attempts: u32,
    ) -> Self {
        Self {
            contract: IClearingHouse::new(address, client.clone()),
            client,
            receipt_poll_interval,
            receipt_poll_attempts,
        }
    }

    fn request_for(orders: &[LimitOrder]) -> Request {
        Request {
            orders: orders.iter().map(|o| abi_order(o)).collect(),
            signatures: orders.iter().map(|o| o.signature.clone()).collect(),
        }
    }
}

fn abi_order(resting: &LimitOrder) -> Order {
    let order = &resting.order;
    Order {
        metadata: Metadata {
            genesis: order.metadata.genesis,
            expiration: order.metadata.expiration,
            tracking_code: order.metadata.tracking_code.into(),
            referrer: order.metadata.referrer,
        },
        trader: Trader {
            nonce: order.trader.nonce,
            account_id: order.trader.account_id,
            signer: order.trader.signer,
        },
        trade: Trade {
            t: order.trade.order_type.into(),
            market_id: order.trade.market_id,
            size: order.trade.size,
            price: order.trade.price,
        },
        conditions: order
            .conditions
            .iter()
            .map(|c| Condition {
                target: c.target,
                selector: c.selector,
                data: c.data.clone(),
                expected: c.expected.into(),
            })
            .collect(),
    }
}

#[async_trait]
impl Clearinghouse for EthersClearinghouse {
    async fn can_settle(&self, orders: &[LimitOrder]) -> Result<SettleResponse, ChainError> {
        let request = Self::request_for(orders);
        // The Response struct flattens to a (bool, bytes) tuple in the binding
        let (success, data) = self
            .contract
            .can_settle(request)
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(SettleResponse { success, data })
    }

    async fn settle(&self, orders: &[LimitOrder]) -> Result<H256, ChainError> {
        let request = Self::request_for(orders);
        // The pending transaction borrows the call, so the call must outlive it
        let call = self.contract.settle(request);
        let pending = call
            .send()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        let tx_hash = pending.tx_hash();
        debug!(tx_hash = ?tx_hash, "settlement transaction submitted");
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> Result<TxStatus, ChainError> {
        for _ in 0..self.receipt_poll_attempts {
            let receipt = self
                .client
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| ChainError::Provider(e.to_string()))?;

            if let Some(receipt) = receipt {
                let status = if receipt.status == Some(1u64.into()) {
                    TxStatus::Confirmed
                } else {
                    TxStatus::Reverted
                };
                return Ok(status);
            }

            tokio::time::sleep(self.receipt_poll_interval).await;
        }

        Ok(TxStatus::Dropped)
    }
}
