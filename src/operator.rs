//! Inference operator: one instance per
//! fused subgraph node. Drives one model across its lifetime — lazy
//! device claim and artifact upload, shape validation, batch splitting,
//! pipelined execution against the device, and an optional profiling
//! hook.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::Device;
use crate::driver::TensorRef;
use crate::error::{Error, Result};
use crate::manager::DeviceManager;
use crate::model::TensorSignature;
use crate::profiler;
use crate::runtime_io::RuntimeIO;
use crate::semaphore::AdmissionSemaphore;
use crate::shm::{SharedMemoryBuffer, SharedMemoryPool};
use crate::tensor::{DType, HostTensor, TensorView};

/// Per-model driver-side timeout, in seconds, and the admission
/// semaphore's per-request wait bound.
const DEFAULT_TIMEOUT_SECS: u32 = 10;

/// Static attributes the enclosing framework hands the operator at graph
/// construction. `executable` and
/// `graph_def` are held only until lazy initialisation succeeds.
pub struct OperatorAttrs {
    pub op_name: String,
    pub executable: Vec<u8>,
    pub graph_def: Vec<u8>,
    pub input_names: Vec<String>,
    pub input_dtypes: Vec<DType>,
    pub input_shapes: Vec<Vec<usize>>,
    pub input_batch_axis: Vec<Option<usize>>,
    pub output_names: Vec<String>,
    pub output_dtypes: Vec<DType>,
    pub output_shapes: Vec<Vec<usize>>,
    pub output_batch_axis: Vec<Option<usize>>,
    /// Requested execution-group size hint, fed to
    /// [`DeviceManager::apply_for_device`] when no explicit policy or
    /// index applies.
    pub opt_device_size: usize,
    pub max_num_duplicates: usize,
    /// `-1` to let the manager round-robin-assign a device.
    pub device_index: i64,
    pub profile_enabled: bool,
}

/// State produced by a successful lazy initialisation. Immutable after
/// construction; shared across concurrent `compute` calls on the same
/// operator instance via `Arc`.
struct Ready {
    op_name: String,
    device: Arc<Device>,
    model_id: u32,
    inputs: Vec<TensorSignature>,
    outputs: Vec<TensorSignature>,
    admission: AdmissionSemaphore,
    /// The compiled model's batch size `K`: the dimension
    /// stamped at `batch_axis` on the first batched input, or `1` if the
    /// model has no batched inputs at all.
    compiled_batch: usize,
    profile_dir: Option<String>,
}

enum State {
    Uninitialized,
    Ready(Arc<Ready>),
}

/// One instance per fused subgraph node. `compute` is the
/// hot path; lazy initialisation happens once, under a combined
/// `state`+`attrs` critical section.
pub struct InferenceOperator {
    attrs: Mutex<Option<OperatorAttrs>>,
    state: Mutex<State>,
    profile_session_counter: AtomicU64,
}

/// Planned shape of one `compute` call, derived by
/// [`validate_and_plan`] from the incoming tensors against the model's
/// stored signatures.
enum BatchPlan {
    /// No split needed: either there are no batched inputs, or the
    /// request's batch size equals the compiled batch size `K`.
    Single,
    Split { batch_size: usize, num_batches: usize },
}

impl InferenceOperator {
    /// Construct the operator. If `PROFILE_DIR` is set, immediately dumps
    /// the compiled artifact and subgraph to disk; this
    /// happens unconditionally at construction, before any lazy
    /// initialisation or inference.
    pub fn new(attrs: OperatorAttrs) -> Self {
        if let Some(dir) = profile_dir_from_env() {
            profiler::dump_artifacts(&dir, &attrs.op_name, &attrs.executable, &attrs.graph_def);
        }
        Self {
            attrs: Mutex::new(Some(attrs)),
            state: Mutex::new(State::Uninitialized),
            profile_session_counter: AtomicU64::new(0),
        }
    }

    /// Run one inference, lazily initialising (claiming a device, loading
    /// the artifact) on the first call.
    pub fn compute(&self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        let ready = self.ensure_initialized()?;
        match validate_and_plan(&ready.inputs, inputs, ready.compiled_batch)? {
            BatchPlan::Single => self.run_single(&ready, inputs),
            BatchPlan::Split { batch_size, num_batches } => {
                self.run_pipelined(&ready, inputs, batch_size, num_batches)
            }
        }
    }

    fn ensure_initialized(&self) -> Result<Arc<Ready>> {
        {
            let state = self.state.lock();
            if let State::Ready(r) = &*state {
                return Ok(r.clone());
            }
        }

        // Re-acquire and re-check: another thread may have finished
        // initialisation between the fast-path check above and here.
        let mut state = self.state.lock();
        if let State::Ready(r) = &*state {
            return Ok(r.clone());
        }

        let mut attrs_guard = self.attrs.lock();
        let attrs = attrs_guard
            .as_ref()
            .ok_or_else(|| Error::FailedPrecondition("operator attributes missing; construction never completed".into()))?;

        let ready = Arc::new(self.do_initialize(attrs)?);
        // The artifact bytes are no longer needed once `load` succeeds.
        attrs_guard.take();
        *state = State::Ready(ready.clone());
        Ok(ready)
    }

    fn do_initialize(&self, attrs: &OperatorAttrs) -> Result<Ready> {
        let device = DeviceManager::apply_for_device(attrs.opt_device_size, attrs.max_num_duplicates, attrs.device_index)?;

        let inputs = build_signatures(&attrs.input_names, &attrs.input_dtypes, &attrs.input_shapes, &attrs.input_batch_axis)?;
        let outputs = build_signatures(&attrs.output_names, &attrs.output_dtypes, &attrs.output_shapes, &attrs.output_batch_axis)?;

        let has_dynamic_batch_axis = inputs.iter().any(|s| s.batch_axis.is_some());
        let max_in_flight: u32 = if has_dynamic_batch_axis { 4 } else { 1 };

        let model_id = device.load(
            &attrs.executable,
            DEFAULT_TIMEOUT_SECS,
            max_in_flight,
            attrs.profile_enabled,
            inputs.clone(),
            outputs.clone(),
        )?;

        let compiled_batch = inputs
            .iter()
            .find_map(|s| s.batch_axis.map(|axis| s.shape[axis]))
            .unwrap_or(1);

        warm_output_buffers(&device, &outputs);

        Ok(Ready {
            op_name: attrs.op_name.clone(),
            device,
            model_id,
            inputs,
            outputs,
            admission: AdmissionSemaphore::new(max_in_flight as usize, Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64)),
            compiled_batch,
            profile_dir: profile_dir_from_env(),
        })
    }

    /// Single-request path: takes
    /// the device's batch lock once and runs one synchronous `infer`.
    fn run_single(&self, ready: &Ready, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        // Batch lock before admission permit, matching `run_pipelined`'s
        // order — both paths share one operator's semaphore and device
        // lock, so a fixed acquisition order across them is required to
        // avoid a cross-path deadlock.
        let _batch_guard = ready.device.lock_batch();
        let _permit = ready.admission.acquire()?;
        let shm = ready.device.shm();

        let mut held_buffers = Vec::with_capacity(inputs.len());
        let mut trefs = Vec::with_capacity(inputs.len());
        for (sig, tensor) in ready.inputs.iter().zip(inputs) {
            let (tref, buf) = encode_input(shm, &sig.name, tensor);
            if let Some(b) = buf {
                held_buffers.push(b);
            }
            trefs.push(tref);
        }
        let output_names: Vec<String> = ready.outputs.iter().map(|s| s.name.clone()).collect();
        let io = RuntimeIO::new(ready.model_id, trefs, output_names);

        let wire_outputs = self.run_maybe_profiled(ready, || ready.device.infer(io))?;

        if let Some(pool) = shm {
            for buf in held_buffers {
                pool.free(buf);
            }
        }

        decode_outputs(&ready.outputs, wire_outputs)
    }

    /// Pipelined execution: slices
    /// batched inputs into `K`-sized micro-batch windows, pads the last
    /// one, and runs a sliding window of posts/waits bounded by
    /// `max_in_flight`.
    fn run_pipelined(
        &self,
        ready: &Ready,
        inputs: &[HostTensor],
        batch_size: usize,
        num_batches: usize,
    ) -> Result<Vec<HostTensor>> {
        let k = ready.compiled_batch;
        let last_rows = batch_size - (num_batches - 1) * k;

        let micro_batches = split_into_micro_batches(&ready.inputs, inputs, k, num_batches, last_rows)?;

        let _batch_guard = ready.device.lock_batch();
        let shm = ready.device.shm();

        let mut stitched: Vec<Vec<HostTensor>> = (0..ready.outputs.len()).map(|_| Vec::with_capacity(num_batches)).collect();

        let max_in_flight = ready.admission.capacity();
        let mut start = 0usize;
        while start < num_batches {
            let end = (start + max_in_flight).min(num_batches);
            let window = end - start;

            let mut permits = Vec::with_capacity(window);
            let mut cookies = Vec::with_capacity(window);
            let mut held_per_post: Vec<Vec<SharedMemoryBuffer>> = Vec::with_capacity(window);

            for i in start..end {
                let permit = ready.admission.acquire()?;
                let mut held = Vec::with_capacity(ready.inputs.len());
                let mut trefs = Vec::with_capacity(ready.inputs.len());
                for (sig, tensor) in ready.inputs.iter().zip(&micro_batches[i]) {
                    let (tref, buf) = encode_input(shm, &sig.name, tensor);
                    if let Some(b) = buf {
                        held.push(b);
                    }
                    trefs.push(tref);
                }
                let output_names: Vec<String> = ready.outputs.iter().map(|s| s.name.clone()).collect();
                let io = RuntimeIO::new(ready.model_id, trefs, output_names);
                let cookie = self.run_maybe_profiled(ready, || ready.device.infer_post(io))?;
                cookies.push(cookie);
                held_per_post.push(held);
                permits.push(permit);
            }

            for (slot, &cookie) in cookies.iter().enumerate() {
                let wire_outputs = ready.device.infer_wait(cookie)?;
                let decoded = decode_outputs(&ready.outputs, wire_outputs)?;
                for (out_idx, tensor) in decoded.into_iter().enumerate() {
                    stitched[out_idx].push(tensor);
                }
                if let Some(pool) = shm {
                    for buf in held_per_post[slot].drain(..) {
                        pool.free(buf);
                    }
                }
            }
            // Permits for this window release here, once every post in it
            // has been waited on.
            drop(permits);

            start = end;
        }

        let mut final_outputs = Vec::with_capacity(ready.outputs.len());
        for (out_idx, sig) in ready.outputs.iter().enumerate() {
            let parts = std::mem::take(&mut stitched[out_idx]);
            let tensor = match sig.batch_axis {
                Some(_) => HostTensor::stitch(&parts, last_rows)?,
                None => parts
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::Internal(format!("no micro-batch produced output '{}'", sig.name)))?,
            };
            final_outputs.push(tensor);
        }
        Ok(final_outputs)
    }

    fn run_maybe_profiled<F, R>(&self, ready: &Ready, body: F) -> R
    where
        F: FnOnce() -> R,
    {
        match &ready.profile_dir {
            Some(dir) => {
                let session = self.profile_session_counter.fetch_add(1, Ordering::Relaxed);
                profiler::run_profiled(dir, &ready.op_name, ready.model_id, session, body)
            }
            None => body(),
        }
    }
}

fn profile_dir_from_env() -> Option<String> {
    std::env::var("PROFILE_DIR").ok().filter(|s| !s.is_empty())
}

fn build_signatures(
    names: &[String],
    dtypes: &[DType],
    shapes: &[Vec<usize>],
    batch_axis: &[Option<usize>],
) -> Result<Vec<TensorSignature>> {
    let n = names.len();
    if dtypes.len() != n || shapes.len() != n || batch_axis.len() != n {
        return Err(Error::FailedPrecondition(format!(
            "operator attribute length mismatch: {} names, {} dtypes, {} shapes, {} batch_axis entries",
            n,
            dtypes.len(),
            shapes.len(),
            batch_axis.len()
        )));
    }
    Ok((0..n)
        .map(|i| TensorSignature {
            name: names[i].clone(),
            dtype: dtypes[i],
            shape: shapes[i].clone(),
            batch_axis: batch_axis[i],
        })
        .collect())
}

/// Warm the shared-memory pool's free-list with one buffer per output, at
/// the per-microbatch byte size, so steady-state inference does not pay a
/// `shm_open`/`mmap` round trip on its first call. A no-op in heap-backed
/// mode; `HostTensor` allocation at call time is cheap enough not to need
/// pre-warming.
fn warm_output_buffers(device: &Device, outputs: &[TensorSignature]) {
    let Some(pool) = device.shm() else { return };
    for sig in outputs {
        let size = sig.shape.iter().product::<usize>() * sig.dtype.size_of();
        if let Some(buf) = pool.allocate(size) {
            pool.free(buf);
        }
    }
}

/// Validate the incoming tensors against the model's stored signatures
/// and decide whether the request needs batch splitting. Every input's
/// shape must equal the stored shape except possibly along its
/// `batch_axis`; every batched input must agree on one common request
/// batch size `B`.
fn validate_and_plan(stored: &[TensorSignature], incoming: &[HostTensor], compiled_batch: usize) -> Result<BatchPlan> {
    if incoming.len() != stored.len() {
        return Err(Error::InvalidArgument(format!(
            "expected {} inputs, got {}",
            stored.len(),
            incoming.len()
        )));
    }

    let mut common_batch: Option<usize> = None;
    for (sig, tensor) in stored.iter().zip(incoming) {
        if tensor.dtype != sig.dtype {
            return Err(Error::InvalidArgument(format!(
                "input '{}' dtype mismatch: expected {:?}, got {:?}",
                sig.name, sig.dtype, tensor.dtype
            )));
        }
        if tensor.shape.len() != sig.shape.len() {
            return Err(Error::InvalidArgument(format!(
                "input '{}' rank mismatch: expected {} dims, got {}",
                sig.name,
                sig.shape.len(),
                tensor.shape.len()
            )));
        }

        match sig.batch_axis {
            Some(axis) => {
                for (i, (&have, &want)) in tensor.shape.iter().zip(sig.shape.iter()).enumerate() {
                    if i != axis && have != want {
                        return Err(Error::InvalidArgument(format!(
                            "input '{}' shape mismatch at dim {}: expected {}, got {}",
                            sig.name, i, want, have
                        )));
                    }
                }
                let b = tensor.shape[axis];
                match common_batch {
                    None => common_batch = Some(b),
                    Some(prev) if prev != b => {
                        return Err(Error::InvalidArgument(format!(
                            "batched inputs disagree on request batch size: {} vs {}",
                            prev, b
                        )))
                    }
                    _ => {}
                }
            }
            None if tensor.shape != sig.shape => {
                return Err(Error::InvalidArgument(format!("non-batched input '{}' shape mismatch", sig.name)));
            }
            None => {}
        }
    }

    let Some(b) = common_batch else {
        return Ok(BatchPlan::Single);
    };
    if b == compiled_batch {
        return Ok(BatchPlan::Single);
    }
    if b == 0 {
        return Err(Error::InvalidArgument("request batch size must be positive".into()));
    }
    Ok(BatchPlan::Split { batch_size: b, num_batches: b.div_ceil(compiled_batch) })
}

/// Slice every batched input into `num_batches` windows of `k` rows,
/// zero-padding the last window's residual rows; non-batched inputs are
/// passed by reference (cloned, since this crate owns tensors value-style)
/// to every micro-batch.
fn split_into_micro_batches(
    stored: &[TensorSignature],
    incoming: &[HostTensor],
    k: usize,
    num_batches: usize,
    last_rows: usize,
) -> Result<Vec<Vec<HostTensor>>> {
    let mut micro_batches: Vec<Vec<HostTensor>> = (0..num_batches).map(|_| Vec::with_capacity(incoming.len())).collect();

    for (sig, tensor) in stored.iter().zip(incoming) {
        match sig.batch_axis {
            Some(_) => {
                for (i, batch) in micro_batches.iter_mut().enumerate() {
                    let start = i * k;
                    let is_last = i + 1 == num_batches;
                    let window = if is_last && last_rows < k {
                        let mut padded = HostTensor::zeros(sig.shape.clone(), sig.dtype);
                        let residual = tensor.slice_rows(start, start + last_rows)?;
                        padded.write_rows(0, &residual)?;
                        padded
                    } else {
                        tensor.slice_rows(start, start + k)?
                    };
                    batch.push(window);
                }
            }
            None => {
                for batch in micro_batches.iter_mut() {
                    batch.push(tensor.clone());
                }
            }
        }
    }
    Ok(micro_batches)
}

fn encode_input(shm: Option<&Arc<SharedMemoryPool>>, name: &str, tensor: &HostTensor) -> (TensorRef, Option<SharedMemoryBuffer>) {
    if let Some(pool) = shm {
        if let Some(mut buf) = pool.allocate(tensor.bytes().len()) {
            buf.as_mut_slice().copy_from_slice(tensor.bytes());
            let tref = TensorRef::Shared { name: name.to_string(), mapping_id: buf.mapping_id(), offset: 0, len: buf.size() as u64 };
            return (tref, Some(buf));
        }
    }
    (TensorRef::Inline { name: name.to_string(), bytes: tensor.bytes().to_vec() }, None)
}

fn decode_outputs(sigs: &[TensorSignature], wire: Vec<TensorRef>) -> Result<Vec<HostTensor>> {
    if wire.len() != sigs.len() {
        return Err(Error::Internal(format!("driver returned {} outputs, expected {}", wire.len(), sigs.len())));
    }
    sigs.iter().zip(wire).map(decode_one).collect()
}

fn decode_one((sig, tref): (&TensorSignature, TensorRef)) -> Result<HostTensor> {
    match tref {
        TensorRef::Inline { name, bytes } => {
            if name != sig.name {
                return Err(Error::Internal(format!("output name mismatch: expected '{}', got '{}'", sig.name, name)));
            }
            HostTensor::from_bytes(sig.shape.clone(), sig.dtype, bytes)
        }
        TensorRef::Shared { name, .. } => Err(Error::Internal(format!(
            "output '{}' arrived as a shared-memory reference this transport cannot resolve \
             (no output-buffer mapping is negotiated in the consumed wire shape)",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str, shape: Vec<usize>, batch_axis: Option<usize>) -> TensorSignature {
        TensorSignature { name: name.to_string(), dtype: DType::F32, shape, batch_axis }
    }

    #[test]
    fn no_batched_inputs_is_single() {
        let stored = vec![sig("x", vec![4], None)];
        let incoming = vec![HostTensor::zeros(vec![4], DType::F32)];
        assert!(matches!(validate_and_plan(&stored, &incoming, 1).unwrap(), BatchPlan::Single));
    }

    #[test]
    fn request_batch_equal_to_compiled_is_single() {
        let stored = vec![sig("x", vec![2, 8], Some(0))];
        let incoming = vec![HostTensor::zeros(vec![2, 8], DType::F32)];
        assert!(matches!(validate_and_plan(&stored, &incoming, 2).unwrap(), BatchPlan::Single));
    }

    #[test]
    fn larger_request_batch_splits() {
        let stored = vec![sig("x", vec![2, 8], Some(0))];
        let incoming = vec![HostTensor::zeros(vec![5, 8], DType::F32)];
        match validate_and_plan(&stored, &incoming, 2).unwrap() {
            BatchPlan::Split { batch_size, num_batches } => {
                assert_eq!(batch_size, 5);
                assert_eq!(num_batches, 3);
            }
            BatchPlan::Single => panic!("expected a split plan"),
        }
    }

    #[test]
    fn disagreeing_batch_sizes_are_rejected() {
        let stored = vec![sig("x", vec![2, 8], Some(0)), sig("y", vec![2, 4], Some(0))];
        let incoming = vec![HostTensor::zeros(vec![4, 8], DType::F32), HostTensor::zeros(vec![5, 4], DType::F32)];
        let err = validate_and_plan(&stored, &incoming, 2).unwrap_err();
        assert_eq!(err.kind(), "INVALID_ARGUMENT");
    }

    #[test]
    fn non_batch_axis_shape_mismatch_is_rejected() {
        let stored = vec![sig("x", vec![2, 8], Some(0))];
        let incoming = vec![HostTensor::zeros(vec![2, 9], DType::F32)];
        let err = validate_and_plan(&stored, &incoming, 2).unwrap_err();
        assert_eq!(err.kind(), "INVALID_ARGUMENT");
    }

    #[test]
    fn split_pads_last_window_with_zeros() {
        let stored = vec![sig("x", vec![2, 4], Some(0))];
        let data: Vec<u8> = (1..=4u8).collect(); // one row, 4 bytes
        let incoming = vec![HostTensor::from_bytes(vec![1, 4], DType::U8, data.clone()).unwrap()];
        // pretend compiled batch is 2, 1 requested row -> 1 micro-batch, padded
        let micro = split_into_micro_batches(&stored, &incoming, 2, 1, 1).unwrap();
        assert_eq!(micro.len(), 1);
        assert_eq!(micro[0][0].shape, vec![2, 4]);
        assert_eq!(&micro[0][0].data[..4], &data[..]);
        assert_eq!(&micro[0][0].data[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn non_batched_input_is_cloned_into_every_window() {
        let stored = vec![sig("x", vec![4, 2], Some(0)), sig("bias", vec![2], None)];
        let incoming = vec![HostTensor::zeros(vec![4, 2], DType::F32), HostTensor::zeros(vec![2], DType::F32)];
        let micro = split_into_micro_batches(&stored, &incoming, 2, 2, 2).unwrap();
        assert_eq!(micro.len(), 2);
        assert_eq!(micro[0][1].shape, vec![2]);
        assert_eq!(micro[1][1].shape, vec![2]);
    }
}
