//! Authentication modules.
//!
//! - `session`: in-memory credential store with single-flight refresh.
//! - `invoker`: credential-aware call wrapper with 401-driven retry.

/// Call wrapper with the single refresh-and-retry path.
pub mod invoker;
/// Bearer credential store and renewal coordination.
pub mod session;

pub use invoker::{AuthenticatedInvoker, InvokeError};
pub use session::{AuthError, CredentialRenewer, SessionStore};
