//! Supervisor/worker message protocol.
//!
//! Transport-agnostic message types (`messages`) and the length-prefixed binary
//! frame codec used over pipes (`framing`).

pub mod framing;
pub mod messages;

pub use framing::{
    encode_frame, ensure_frame_fits, invoke_len_bound, read_frame, write_frame, ProtocolError,
    MAX_FRAME_BYTES,
};
pub use messages::{
    BlobSpan, FailureKind, FrameValues, Method, Outcome, SupervisorMessage, Value, WorkerMessage,
};
