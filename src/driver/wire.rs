//! Message shapes for the driver's RPC surface.
//!
//! The driver wire format is an external collaborator: this module only
//! fixes a concrete, consumed-not-defined framing for it —
//! `bincode`-encoded, length-prefixed request/response pairs over a Unix
//! domain socket. Nothing here models the driver's own internals.

use serde::{Deserialize, Serialize};

/// Maximum chunk size for a streamed artifact upload.
pub const LOAD_CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    CreateEg { requested_cores: u32 },
    DestroyEg { eg_id: u32, from_shutdown: bool },
    LoadHeader {
        eg_id: u32,
        total_size: u64,
        timeout_secs: u32,
        max_in_flight: u32,
        profile_enabled: bool,
    },
    LoadChunk { bytes: Vec<u8> },
    Unload { nn_id: u32, from_shutdown: bool },
    Start { nn_id: u32 },
    Stop { nn_id: u32 },
    Infer { nn_id: u32, io: InferPayload },
    InferPost { nn_id: u32, io: InferPayload },
    InferWait { cookie: u64 },
    ShmMap { path: String, prot: ShmProt, session: u64 },
    ShmUnmap { path: String, prot: ShmProt },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShmProt {
    ReadOnly,
    ReadWrite,
}

/// The bytes and buffer references that ride along with an inference
/// call. When a [`crate::shm::SharedMemoryBuffer`] backs an input or
/// output, only its mapping identifier crosses the wire; otherwise the
/// raw bytes are inlined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferPayload {
    pub inputs: Vec<TensorRef>,
    pub output_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TensorRef {
    Inline { name: String, bytes: Vec<u8> },
    Shared { name: String, mapping_id: u64, offset: u64, len: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    CreateEg { status: Status, eg_id: u32, granted_cores: u32 },
    DestroyEg { status: Status },
    LoadHeader { status: Status },
    LoadChunk { status: Status },
    LoadComplete { status: Status, nn_id: u32 },
    Unload { status: Status },
    Start { status: Status },
    Stop { status: Status },
    Infer { status: Status, outputs: Vec<TensorRef> },
    InferPost { status: Status, cookie: u64 },
    InferWait { status: Status, outputs: Vec<TensorRef> },
    ShmMap { status: Status, mapping_id: u64 },
    ShmUnmap { status: Status },
}

/// Status code reported by the driver. `Ok` and `OkNumericalAnomaly` are
/// both treated as success by the client: the anomaly flag is an
/// informational accelerator signal, not a transport failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    Ok,
    OkNumericalAnomaly,
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    Unavailable,
    Aborted,
    AlreadyExists,
    Internal,
    OutOfRange,
    SharedMemoryUnsupported,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::OkNumericalAnomaly)
    }
}

/// Map a driver status to the crate's error taxonomy. Total: an
/// unrecognized or otherwise-non-success code that doesn't match a
/// specific kind maps to [`crate::error::Error::Internal`].
pub fn status_to_error(status: Status, context: &str) -> crate::error::Error {
    use crate::error::Error;
    match status {
        Status::Ok | Status::OkNumericalAnomaly => {
            unreachable!("status_to_error called on a success status")
        }
        Status::InvalidArgument => Error::InvalidArgument(context.to_string()),
        Status::FailedPrecondition => Error::FailedPrecondition(context.to_string()),
        Status::ResourceExhausted => Error::ResourceExhausted(context.to_string()),
        Status::Unavailable => Error::Unavailable(context.to_string()),
        Status::Aborted => Error::Aborted(context.to_string()),
        Status::AlreadyExists => Error::AlreadyExists(context.to_string()),
        Status::OutOfRange => Error::OutOfRange(context.to_string()),
        Status::SharedMemoryUnsupported => {
            Error::Internal(format!("shared memory unsupported: {}", context))
        }
        Status::Internal => Error::Internal(context.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses() {
        assert!(Status::Ok.is_success());
        assert!(Status::OkNumericalAnomaly.is_success());
        assert!(!Status::Internal.is_success());
    }

    #[test]
    fn status_mapping_is_total_for_failures() {
        let failures = [
            Status::InvalidArgument,
            Status::FailedPrecondition,
            Status::ResourceExhausted,
            Status::Unavailable,
            Status::Aborted,
            Status::AlreadyExists,
            Status::Internal,
            Status::OutOfRange,
            Status::SharedMemoryUnsupported,
        ];
        for s in failures {
            let _ = status_to_error(s, "test");
        }
    }
}
