//! Driver RPC client.

pub mod client;
pub mod wire;

pub use client::{DriverClient, ShmMapOutcome};
pub use wire::{InferPayload, Request, Response, ShmProt, Status, TensorRef};
