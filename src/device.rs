//! Device: owns a set of execution groups and model entries, serialises
//! load/unload/start/stop transitions against the driver, and exposes
//! pipelined infer-post / infer-wait.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DeviceGroup;
use crate::driver::{DriverClient, InferPayload, TensorRef};
use crate::error::{Error, Result};
use crate::model::{ExecutionGroup, ModelEntry, TensorSignature};
use crate::runtime_io::RuntimeIO;
use crate::shm::SharedMemoryPool;

/// Sentinel `running_nn_id` meaning "device idle".
const SENTINEL_NN_ID: u32 = u32::MAX;

struct DeviceState {
    models: HashMap<u32, ModelEntry>,
    running_nn_id: u32,
    closed: bool,
}

/// Owns a set of execution groups and model entries for one logical
/// device slot; shared by many operator instances through a non-owning
/// [`Arc`].
pub struct Device {
    pub index: usize,
    driver: Arc<DriverClient>,
    egs: Vec<ExecutionGroup>,
    state: Mutex<DeviceState>,
    shm: Option<Arc<SharedMemoryPool>>,
    /// Coarse-grained lock an [`crate::operator::InferenceOperator`] holds
    /// across the posting phase of one pipelined batch. Deliberately
    /// separate from `state`'s fine-grained scheduling lock, which is
    /// already re-acquired by `setup_infer` on every single post: holding
    /// that one mutex continuously for an entire multi-post batch would
    /// deadlock against its own per-post locking. This lock instead
    /// serialises whole-batch post phases against each other across
    /// operator instances sharing a device, without touching the
    /// scheduler's internals.
    batch_lock: Mutex<()>,
}

impl Device {
    /// Allocate this device's execution groups: `num_duplicates == 1`
    /// allocates one EG of the requested size; `num_duplicates > 1`
    /// allocates that many single-core EGs (any other granted size is
    /// rejected as `INVALID_ARGUMENT`).
    pub fn new(
        index: usize,
        driver: Arc<DriverClient>,
        group: DeviceGroup,
        shm_enabled: bool,
        session: u64,
    ) -> Result<Self> {
        let egs = if group.multiplicity <= 1 {
            vec![Self::create_one_eg(&driver, group.num_cores as u32)?]
        } else {
            let mut created = Vec::with_capacity(group.multiplicity);
            let mut failure = None;
            for _ in 0..group.multiplicity {
                match Self::create_one_eg(&driver, 1) {
                    Ok(eg) if eg.granted_cores == 1 => created.push(eg),
                    Ok(eg) => {
                        let _ = driver.destroy_eg(eg.eg_id, false);
                        failure = Some(Error::InvalidArgument(format!(
                            "duplicated device requested 1 core per EG but driver granted {}",
                            eg.granted_cores
                        )));
                        break;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                for eg in &created {
                    let _ = driver.destroy_eg(eg.eg_id, false);
                }
                return Err(e);
            }
            created
        };

        let shm = shm_enabled.then(|| Arc::new(SharedMemoryPool::new(driver.clone(), session, true)));

        Ok(Self {
            index,
            driver,
            egs,
            state: Mutex::new(DeviceState {
                models: HashMap::new(),
                running_nn_id: SENTINEL_NN_ID,
                closed: false,
            }),
            shm,
            batch_lock: Mutex::new(()),
        })
    }

    /// Acquire the coarse-grained batch-posting lock. Held by the caller
    /// across the post phase of a pipelined batch only — waits are meant
    /// to proceed without it.
    pub fn lock_batch(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.batch_lock.lock()
    }

    fn create_one_eg(driver: &DriverClient, requested_cores: u32) -> Result<ExecutionGroup> {
        let (eg_id, granted_cores) = driver.create_eg(requested_cores)?;
        Ok(ExecutionGroup { eg_id, granted_cores })
    }

    pub fn num_egs(&self) -> usize {
        self.egs.len()
    }

    pub fn shm(&self) -> Option<&Arc<SharedMemoryPool>> {
        self.shm.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_model_loaded(&self, primary_nn_id: u32) -> bool {
        self.state.lock().models.contains_key(&primary_nn_id)
    }

    pub fn running_nn_id(&self) -> Option<u32> {
        let id = self.state.lock().running_nn_id;
        (id != SENTINEL_NN_ID).then_some(id)
    }

    /// Load `artifact` onto every EG. If only one EG is present the
    /// artifact is loaded once; otherwise it is loaded independently onto
    /// each. If any but the first duplicate fails, loading stops and the
    /// successfully loaded duplicates are retained — a partial
    /// duplication is still valid, just lower-throughput. If the zeroth
    /// load fails, the whole load fails with the driver's status. A
    /// collision with an existing primary id rolls back every sibling
    /// just created and fails as `ALREADY_EXISTS`.
    #[tracing::instrument(level = "info", skip(self, artifact, inputs, outputs))]
    pub fn load(
        &self,
        artifact: &[u8],
        timeout_secs: u32,
        max_in_flight: u32,
        profile_enabled: bool,
        inputs: Vec<TensorSignature>,
        outputs: Vec<TensorSignature>,
    ) -> Result<u32> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::Aborted("device closed".into()));
            }
        }

        let mut siblings = Vec::with_capacity(self.egs.len());
        for (i, eg) in self.egs.iter().enumerate() {
            match self.driver.load(eg.eg_id, artifact, timeout_secs, max_in_flight, profile_enabled) {
                Ok(nn_id) => siblings.push(nn_id),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        eg_id = eg.eg_id,
                        loaded = siblings.len(),
                        "partial duplicate load failed, keeping successfully loaded siblings"
                    );
                    break;
                }
            }
        }

        let primary_nn_id = siblings[0];

        let mut state = self.state.lock();
        if state.models.contains_key(&primary_nn_id) {
            for nn_id in &siblings {
                let _ = self.driver.unload(*nn_id, false);
            }
            return Err(Error::AlreadyExists(format!("model {} already loaded on this device", primary_nn_id)));
        }

        let entry = ModelEntry::new(siblings, profile_enabled, timeout_secs, max_in_flight, inputs, outputs);
        state.models.insert(primary_nn_id, entry);
        Ok(primary_nn_id)
    }

    /// Unload `primary_nn_id`. If it is the running model, stop every
    /// sibling first; then unload every sibling and drop the entry.
    /// Tolerant of per-sibling driver failures.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn unload(&self, primary_nn_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Aborted("device closed".into()));
        }
        let entry = state
            .models
            .remove(&primary_nn_id)
            .ok_or_else(|| Error::FailedPrecondition(format!("model {} not loaded", primary_nn_id)))?;

        if state.running_nn_id == primary_nn_id {
            if let Err(e) = self.stop_all(&entry.siblings) {
                tracing::warn!(error = %e, primary_nn_id, "stop failed during unload, continuing");
            }
            state.running_nn_id = SENTINEL_NN_ID;
        }
        drop(state);

        for nn_id in &entry.siblings {
            if let Err(e) = self.driver.unload(*nn_id, false) {
                tracing::warn!(error = %e, nn_id, "unload failed for a sibling, continuing");
            }
        }

        Ok(())
    }

    /// The start/stop scheduler — the hard part. Must be called with
    /// `state` already locked; the lock is held across every sibling
    /// start/stop RPC so lifecycle transitions serialise.
    fn ensure_running(&self, state: &mut DeviceState, primary_nn_id: u32) -> Result<()> {
        if state.closed {
            return Err(Error::Aborted("device closed".into()));
        }
        if state.running_nn_id == primary_nn_id {
            return Ok(());
        }
        if state.running_nn_id != SENTINEL_NN_ID {
            let incumbent_siblings = state
                .models
                .get(&state.running_nn_id)
                .map(|e| e.siblings.clone())
                .unwrap_or_default();
            self.stop_all(&incumbent_siblings)?;
            state.running_nn_id = SENTINEL_NN_ID;
        }
        let siblings = state
            .models
            .get(&primary_nn_id)
            .ok_or_else(|| Error::FailedPrecondition(format!("model {} not loaded", primary_nn_id)))?
            .siblings
            .clone();
        self.start_all(&siblings)?;
        state.running_nn_id = primary_nn_id;
        Ok(())
    }

    fn start_all(&self, siblings: &[u32]) -> Result<()> {
        let outcomes = self.for_each_sibling(siblings, |driver, nn_id| driver.start(nn_id));
        // No partial start is observable across a sibling set: the first
        // failure fails the whole transition, but every sibling was still
        // attempted, matching the "all siblings posted in parallel, then
        // awaited" shape.
        outcomes.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    fn stop_all(&self, siblings: &[u32]) -> Result<()> {
        let outcomes = self.for_each_sibling(siblings, |driver, nn_id| driver.stop(nn_id));
        let mut first_err = None;
        for outcome in outcomes {
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "stop failed for a sibling, continuing with the rest");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Post `f` to every sibling in parallel on scoped threads and await
    /// all completions before returning.
    fn for_each_sibling<F>(&self, siblings: &[u32], f: F) -> Vec<Result<()>>
    where
        F: Fn(&DriverClient, u32) -> Result<()> + Sync,
    {
        std::thread::scope(|scope| {
            let handles: Vec<_> = siblings
                .iter()
                .map(|&nn_id| scope.spawn(|| f(&self.driver, nn_id)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(Error::Internal("sibling lifecycle call panicked".into()))))
                .collect()
        })
    }

    /// Ensure the model behind `io.nn_id` (the primary) is running, then
    /// rewrite `io.nn_id` to the next active duplicate. Shared by the
    /// synchronous and posted paths; per the preserved asymmetry, a
    /// missing sibling set here (an entry the caller never loaded) fails
    /// outright rather than being silently tolerated the way `load`
    /// tolerates a partial duplication.
    fn setup_infer(&self, io: &mut RuntimeIO) -> Result<()> {
        let mut state = self.state.lock();
        let primary_nn_id = io.nn_id;
        self.ensure_running(&mut state, primary_nn_id)?;
        let entry = state
            .models
            .get(&primary_nn_id)
            .ok_or_else(|| Error::FailedPrecondition(format!("model {} not loaded", primary_nn_id)))?;
        io.nn_id = entry.next_active();
        Ok(())
    }

    /// Synchronous single-request inference path.
    #[tracing::instrument(level = "debug", skip(self, io))]
    pub fn infer(&self, mut io: RuntimeIO) -> Result<Vec<TensorRef>> {
        self.setup_infer(&mut io)?;
        let payload = InferPayload { inputs: io.inputs, output_names: io.output_names };
        self.driver.infer(io.nn_id, payload)
    }

    /// Post half of the pipelined path. The device mutex is held only
    /// while posting — the wait may proceed without it.
    #[tracing::instrument(level = "debug", skip(self, io))]
    pub fn infer_post(&self, mut io: RuntimeIO) -> Result<u64> {
        self.setup_infer(&mut io)?;
        let payload = InferPayload { inputs: io.inputs, output_names: io.output_names };
        self.driver.infer_post(io.nn_id, payload)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn infer_wait(&self, cookie: u64) -> Result<Vec<TensorRef>> {
        self.driver.infer_wait(cookie)
    }

    /// Advance and return the round-robin active duplicate for a loaded
    /// model, without touching the start/stop scheduler. Exposed so the
    /// strict round-robin invariant can be exercised in isolation from
    /// scheduling side effects.
    pub fn get_active(&self, primary_nn_id: u32) -> Result<u32> {
        let state = self.state.lock();
        state
            .models
            .get(&primary_nn_id)
            .map(|e| e.next_active())
            .ok_or_else(|| Error::FailedPrecondition(format!("model {} not loaded", primary_nn_id)))
    }

    /// Sweep the model map, stop and unload everything tolerantly,
    /// destroy every EG, and clear the shared-memory pool.
    /// `from_global_state = true` additionally sets `closed` so
    /// subsequent calls short-circuit with `ABORTED` without touching the
    /// driver again.
    pub fn clear(&self, from_global_state: bool) {
        let mut state = self.state.lock();
        let models = std::mem::take(&mut state.models);
        for (primary_nn_id, entry) in &models {
            if state.running_nn_id == *primary_nn_id {
                if let Err(e) = self.stop_all(&entry.siblings) {
                    tracing::warn!(error = %e, primary_nn_id, "stop failed during teardown, continuing");
                }
            }
            for nn_id in &entry.siblings {
                if let Err(e) = self.driver.unload(*nn_id, true) {
                    tracing::warn!(error = %e, nn_id, "unload failed during teardown, continuing");
                }
            }
        }
        state.running_nn_id = SENTINEL_NN_ID;

        for eg in &self.egs {
            if let Err(e) = self.driver.destroy_eg(eg.eg_id, true) {
                tracing::warn!(error = %e, eg_id = eg.eg_id, "destroy_eg failed during teardown, continuing");
            }
        }

        if let Some(shm) = &self.shm {
            shm.clear();
        }

        if from_global_state {
            state.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    //! Device scheduler tests live in `tests/device_scheduler.rs` against a
    //! mock driver transport; a real driver connection (and therefore a
    //! live socket) is required even for a single `create_eg`, so there is
    //! little this crate's unit tests can usefully cover in isolation.
}
