//! Header rules
//!
//! Session-scoped request/response header rewrites, deduplicated by fingerprint
//! and installed with the host's declarative network-rule engine.

mod fingerprint;
mod prepare;
mod store;

pub use fingerprint::*;
pub use prepare::*;
pub use store::*;
