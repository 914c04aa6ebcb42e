//! Wire protocol between the bridge and worker processes.
//!
//! - **protocol**: request/response message types and correlation ids
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
