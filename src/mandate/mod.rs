//! 授权委托：声明、签名、签发与校验

pub mod authority;
pub mod claims;
pub mod signer;

pub use authority::{EnsureOutcome, MandateAuthority, MandatePolicy, MandateRequest};
pub use claims::{Capability, MandateClaims, MandateStatus, SignedMandate};
pub use signer::{HmacSigner, MandateSigner};
