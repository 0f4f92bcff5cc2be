//! Streaming modules.
//!
//! - `connection`: reconnecting stream session, buffering, and diagnostics.
//! - `decode`: incremental text event-stream framing.

/// Stream connection state machine and worker.
pub mod connection;
/// Line framing decoder.
pub mod decode;

pub use connection::{
    ByteStream, ConnectionState, DiagnosticsSnapshot, StreamAcquirer, StreamConnection,
    StreamOptions, TransportError,
};
pub use decode::{Frame, FrameDecoder, DATA_PREFIX, END_OF_STREAM};
