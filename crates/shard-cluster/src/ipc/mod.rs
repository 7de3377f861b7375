//! Inter-process channel between the parent coordinator and its workers
//!
//! Newline-delimited JSON over the worker's stdin/stdout; workers log to stderr.

mod error;
mod message;
mod op;
mod transport;

pub use error::IpcError;
pub use message::{
    ClosePayload, EvalOutcome, EvalPayload, EvalResult, IpcMessage, RemoteError, RestPayload,
    ShardStatePayload,
};
pub use op::IpcOp;
pub use transport::{IpcReader, IpcSender};
