//! Per-request runtime I/O descriptor.

use std::time::Instant;

use crate::driver::TensorRef;

/// Bundles one request's input/output buffer references, the target
/// model handle, and a driver cookie for outstanding posts.
///
/// `nn_id` starts out as the primary model id the caller targeted and is
/// rewritten in place to the active round-robin duplicate by
/// [`crate::device::Device::setup_infer`].
#[derive(Debug, Clone)]
pub struct RuntimeIO {
    pub nn_id: u32,
    pub inputs: Vec<TensorRef>,
    pub output_names: Vec<String>,
    pub cookie: Option<u64>,
    pub posted_at: Option<Instant>,
}

impl RuntimeIO {
    pub fn new(primary_nn_id: u32, inputs: Vec<TensorRef>, output_names: Vec<String>) -> Self {
        Self {
            nn_id: primary_nn_id,
            inputs,
            output_names,
            cookie: None,
            posted_at: None,
        }
    }
}
