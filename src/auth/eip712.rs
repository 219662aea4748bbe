//! EIP-712 order signature verification.
//!
//! Orders are signed under the `SyntheticPerpetualFutures` domain. A
//! cancellation is attested by re-signing the same order with the trade
//! size zeroed.

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;

use crate::models::Order;

/// EIP-712 Type Hashes
pub const ORDER_TYPEHASH: &str = "Order(Metadata metadata,Trader trader,Trade trade,Condition[] conditions)Condition(address target,bytes4 selector,bytes data,bytes32 expected)Metadata(uint256 genesis,uint256 expiration,bytes32 trackingCode,address referrer)Trade(uint8 t,uint128 marketId,int128 size,uint256 price)Trader(uint256 nonce,uint128 accountId,address signer)";
pub const METADATA_TYPEHASH: &str =
    "Metadata(uint256 genesis,uint256 expiration,bytes32 trackingCode,address referrer)";
pub const TRADER_TYPEHASH: &str = "Trader(uint256 nonce,uint128 accountId,address signer)";
pub const TRADE_TYPEHASH: &str = "Trade(uint8 t,uint128 marketId,int128 size,uint256 price)";
pub const CONDITION_TYPEHASH: &str =
    "Condition(address target,bytes4 selector,bytes data,bytes32 expected)";

const DOMAIN_NAME: &str = "SyntheticPerpetualFutures";
const DOMAIN_VERSION: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Malformed signature: {0}")]
    Signature(#[from] ethers::types::SignatureError),
}

/// Checks that order and cancellation signatures recover to the declared
/// signer.
#[async_trait]
pub trait OrderVerifier: Send + Sync {
    /// Verify the admission signature over the order as submitted.
    async fn check_order_signature(&self, order: &Order, signature: &Bytes)
        -> Result<bool, AuthError>;

    /// Verify a cancellation attestation: the same order signed with the
    /// trade size zeroed.
    async fn check_delete_signature(&self, order: &Order, signature: &Bytes)
        -> Result<bool, AuthError>;
}

/// Production verifier bound to one chain and clearinghouse deployment.
#[derive(Debug, Clone)]
pub struct Eip712Verifier {
    domain_separator: H256,
}

impl Eip712Verifier {
    pub fn new(chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            domain_separator: compute_domain_separator(chain_id, verifying_contract),
        }
    }

    /// The final EIP-712 digest a trader signs for this order.
    pub fn signing_digest(&self, order: &Order) -> H256 {
        let struct_hash = order_struct_hash(order);

        let mut data = Vec::with_capacity(66);
        data.extend_from_slice(&[0x19, 0x01]);
        data.extend_from_slice(self.domain_separator.as_bytes());
        data.extend_from_slice(struct_hash.as_bytes());

        H256::from(keccak256(&data))
    }

    fn verify(&self, order: &Order, signature: &Bytes) -> Result<bool, AuthError> {
        let digest = self.signing_digest(order);
        let sig = Signature::try_from(signature.as_ref())?;
        let recovered = sig.recover(digest)?;
        Ok(recovered == order.trader.signer)
    }
}

#[async_trait]
impl OrderVerifier for Eip712Verifier {
    async fn check_order_signature(
        &self,
        order: &Order,
        signature: &Bytes,
    ) -> Result<bool, AuthError> {
        self.verify(order, signature)
    }

    async fn check_delete_signature(
        &self,
        order: &Order,
        signature: &Bytes,
    ) -> Result<bool, AuthError> {
        self.verify(&order.zeroed(), signature)
    }
}

/// Compute the struct hash for an order according to EIP-712.
pub fn order_struct_hash(order: &Order) -> H256 {
    let type_hash = keccak256(ORDER_TYPEHASH.as_bytes());

    let metadata_hash = {
        let type_hash = keccak256(METADATA_TYPEHASH.as_bytes());
        keccak256(ethers::abi::encode(&[
            Token::FixedBytes(type_hash.to_vec()),
            Token::Uint(order.metadata.genesis),
            Token::Uint(order.metadata.expiration),
            Token::FixedBytes(order.metadata.tracking_code.as_bytes().to_vec()),
            Token::Address(order.metadata.referrer),
        ]))
    };

    let trader_hash = {
        let type_hash = keccak256(TRADER_TYPEHASH.as_bytes());
        keccak256(ethers::abi::encode(&[
            Token::FixedBytes(type_hash.to_vec()),
            Token::Uint(order.trader.nonce),
            Token::Uint(U256::from(order.trader.account_id)),
            Token::Address(order.trader.signer),
        ]))
    };

    let trade_hash = {
        let type_hash = keccak256(TRADE_TYPEHASH.as_bytes());
        keccak256(ethers::abi::encode(&[
            Token::FixedBytes(type_hash.to_vec()),
            Token::Uint(U256::from(u8::from(order.trade.order_type))),
            Token::Uint(U256::from(order.trade.market_id)),
            Token::Int(ethers::types::I256::from(order.trade.size).into_raw()),
            Token::Uint(order.trade.price),
        ]))
    };

    // Array members hash to the keccak of their concatenated struct hashes
    let conditions_hash = {
        let condition_type_hash = keccak256(CONDITION_TYPEHASH.as_bytes());
        let mut concat = Vec::with_capacity(order.conditions.len() * 32);
        for condition in &order.conditions {
            let hash = keccak256(ethers::abi::encode(&[
                Token::FixedBytes(condition_type_hash.to_vec()),
                Token::Address(condition.target),
                Token::FixedBytes(condition.selector.to_vec()),
                Token::FixedBytes(keccak256(&condition.data).to_vec()),
                Token::FixedBytes(condition.expected.as_bytes().to_vec()),
            ]));
            concat.extend_from_slice(&hash);
        }
        keccak256(&concat)
    };

    let encoded = ethers::abi::encode(&[
        Token::FixedBytes(type_hash.to_vec()),
        Token::FixedBytes(metadata_hash.to_vec()),
        Token::FixedBytes(trader_hash.to_vec()),
        Token::FixedBytes(trade_hash.to_vec()),
        Token::FixedBytes(conditions_hash.to_vec()),
    ]);

    H256::from(keccak256(&encoded))
}

fn compute_domain_separator(chain_id: u64, verifying_contract: Address) -> H256 {
    let type_hash = keccak256(
        "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );

    let encoded = ethers::abi::encode(&[
        Token::FixedBytes(type_hash.to_vec()),
        Token::FixedBytes(keccak256(DOMAIN_NAME.as_bytes()).to_vec()),
        Token::FixedBytes(keccak256(DOMAIN_VERSION.as_bytes()).to_vec()),
        Token::Uint(chain_id.into()),
        Token::Address(verifying_contract),
    ]);

    H256::from(keccak256(&encoded))
}
