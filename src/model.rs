//! Execution group and model entry.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::tensor::DType;

/// Opaque driver handle over a set of co-resident accelerator cores. At
/// most one model runs on an EG at a time; enforced by the owning
/// [`crate::device::Device`], not by this type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub eg_id: u32,
    pub granted_cores: u32,
}

/// Shape/dtype/name metadata stamped on one input or output at load time.
#[derive(Debug, Clone)]
pub struct TensorSignature {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// `Some(axis)` names the batch axis; `None` means this input/output
    /// is not batched and is passed by reference to every micro-batch.
    pub batch_axis: Option<usize>,
}

/// State for one loaded artifact. Created by `Device::load`, mutated only
/// by load/unload/infer, destroyed by `Device::unload` or device
/// teardown.
#[derive(Debug)]
pub struct ModelEntry {
    /// The first successful sibling `nn_id`; unique within a device and
    /// used externally to name the model.
    pub primary_nn_id: u32,
    /// One `nn_id` per execution group the artifact was loaded onto. May
    /// be shorter than the device's EG count after a partial duplicate
    /// load.
    pub siblings: Vec<u32>,
    cursor: AtomicUsize,
    pub profile_enabled: bool,
    pub timeout_secs: u32,
    pub max_in_flight: u32,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
}

impl ModelEntry {
    pub fn new(
        siblings: Vec<u32>,
        profile_enabled: bool,
        timeout_secs: u32,
        max_in_flight: u32,
        inputs: Vec<TensorSignature>,
        outputs: Vec<TensorSignature>,
    ) -> Self {
        assert!(!siblings.is_empty(), "a model entry must have at least one sibling");
        let primary_nn_id = siblings[0];
        Self {
            primary_nn_id,
            siblings,
            cursor: AtomicUsize::new(0),
            profile_enabled,
            timeout_secs,
            max_in_flight,
            inputs,
            outputs,
        }
    }

    /// Round-robin pick and return the next sibling `nn_id`, advancing the
    /// cursor modulo the sibling count.
    pub fn next_active(&self) -> u32 {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.siblings.len();
        self.siblings[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(siblings: Vec<u32>) -> ModelEntry {
        ModelEntry::new(siblings, false, 10, 1, Vec::new(), Vec::new())
    }

    #[test]
    fn single_sibling_always_active() {
        let e = entry(vec![7]);
        for _ in 0..5 {
            assert_eq!(e.next_active(), 7);
        }
    }

    #[test]
    fn round_robin_is_strict_across_duplicates() {
        let e = entry(vec![10, 11]);
        let seq: Vec<u32> = (0..4).map(|_| e.next_active()).collect();
        assert_eq!(seq, vec![10, 11, 10, 11]);
    }

    #[test]
    fn round_robin_counts_are_balanced() {
        let e = entry(vec![1, 2, 3]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            *counts.entry(e.next_active()).or_insert(0) += 1;
        }
        let min = *counts.values().min().unwrap();
        let max = *counts.values().max().unwrap();
        assert!(max - min <= 1);
    }
}
