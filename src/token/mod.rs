pub mod codec;
pub mod signature;

pub use codec::{PostAuthClaims, PreAuthClaims};
pub use signature::{RejectReason, SignatureValidator, Validation};
