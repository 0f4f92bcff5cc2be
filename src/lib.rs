//! Resilient authenticated event-streaming client.
//!
//! The crate is organized by concern:
//! - `auth`: bearer credential store with single-flight refresh, and the
//!   credential-aware call wrapper with its single retry path.
//! - `stream`: reconnecting stream connection and incremental framing.
//! - `dispatch`: record validation and typed fan-out to subscribers.
//! - `event`: the event record model.
//! - `backoff`: reconnect delay policy.
//! - `transport`: reqwest-backed HTTP collaborators.

/// Credential store and authenticated call wrapper.
pub mod auth;
/// Reconnect backoff policy.
pub mod backoff;
/// Event validation and subscriber fan-out.
pub mod dispatch;
/// Event record model.
pub mod event;
/// Stream connection and framing.
pub mod stream;
/// HTTP implementations of the remote collaborators.
pub mod transport;

pub use auth::{AuthError, AuthenticatedInvoker, CredentialRenewer, InvokeError, SessionStore};
pub use backoff::ReconnectPolicy;
pub use dispatch::{
    AlertPermission, AlertSink, EventDispatcher, Listener, SubscriptionHandle, SubscriptionKey,
};
pub use event::{EventMetadata, EventRecord, Priority, RecordError};
pub use stream::{
    ByteStream, ConnectionState, DiagnosticsSnapshot, StreamAcquirer, StreamConnection,
    StreamOptions, TransportError,
};
pub use transport::{HttpTransport, HttpTransportOptions};
