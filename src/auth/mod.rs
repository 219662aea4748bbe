pub mod eip712;

pub use eip712::{Eip712Verifier, OrderVerifier};
