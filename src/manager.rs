//! Device manager: process-wide singleton that parses the core-grouping
//! policy, initialises devices, and hands them out to operator instances
//! round-robin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::{DeviceGroup, RuntimeConfig};
use crate::device::Device;
use crate::driver::DriverClient;
use crate::error::{Error, Result};

static MANAGER: OnceLock<DeviceManager> = OnceLock::new();

/// Process-wide device manager. Lazily initialised on the first
/// [`DeviceManager::apply_for_device`] call; torn down on process exit or
/// a caught termination signal via [`DeviceManager::clear_from_global_state`].
pub struct DeviceManager {
    #[allow(dead_code)]
    driver: Arc<DriverClient>,
    devices: Vec<Arc<Device>>,
    /// Round-robin cursor, guarded by a mutex held only during
    /// `apply_for_device`.
    cursor: Mutex<usize>,
    ready: AtomicBool,
}

impl DeviceManager {
    /// Claim a device for an operator instance. `device_index = -1` uses
    /// the round-robin cursor; a non-negative index returns that device
    /// directly. Lazily initialises the singleton on first call, deriving
    /// the default grouping policy from `opt_device_size`/
    /// `max_num_duplicates` if `CORE_GROUP_SIZES` was absent or malformed.
    /// The returned `Arc` is a non-owning handle; the manager retains
    /// lifetime ownership of the `Device`.
    pub fn apply_for_device(
        opt_device_size: usize,
        max_num_duplicates: usize,
        device_index: i64,
    ) -> Result<Arc<Device>> {
        let mgr = Self::ensure_initialized(opt_device_size, max_num_duplicates)?;

        if device_index >= 0 {
            let idx = device_index as usize;
            return mgr
                .devices
                .get(idx)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("device index {} out of range", device_index)));
        }

        let mut cursor = mgr.cursor.lock();
        let idx = *cursor % mgr.devices.len();
        *cursor = cursor.wrapping_add(1);
        Ok(mgr.devices[idx].clone())
    }

    fn ensure_initialized(opt_device_size: usize, max_num_duplicates: usize) -> Result<&'static DeviceManager> {
        if let Some(mgr) = MANAGER.get() {
            return Ok(mgr);
        }

        let config = RuntimeConfig::from_env();
        let driver = Arc::new(DriverClient::initialize(&config.driver_address)?);
        let groups = config.groups_or_default(opt_device_size, max_num_duplicates);
        let devices = Self::build_devices(&driver, &groups, config.shm_enabled);

        if devices.is_empty() {
            return Err(Error::ResourceExhausted(
                "no execution group could be created from any configured device".into(),
            ));
        }

        let mgr = DeviceManager {
            driver,
            devices,
            cursor: Mutex::new(0),
            ready: AtomicBool::new(true),
        };
        // `OnceLock::get_or_init` resolves the race if another thread won
        // initialisation first; the loser's freshly-built manager (and its
        // driver connection) is simply dropped.
        Ok(MANAGER.get_or_init(|| mgr))
    }

    fn build_devices(driver: &Arc<DriverClient>, groups: &[DeviceGroup], shm_enabled: bool) -> Vec<Arc<Device>> {
        let mut devices = Vec::new();
        for (index, group) in groups.iter().enumerate() {
            match Device::new(index, driver.clone(), *group, shm_enabled, index as u64) {
                Ok(device) => devices.push(Arc::new(device)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        index,
                        num_cores = group.num_cores,
                        multiplicity = group.multiplicity,
                        "failed to create device from policy group, skipping"
                    );
                }
            }
        }
        devices
    }

    pub fn device_count() -> usize {
        MANAGER.get().map(|m| m.devices.len()).unwrap_or(0)
    }

    pub fn is_ready() -> bool {
        MANAGER.get().map(|m| m.ready.load(Ordering::SeqCst)).unwrap_or(false)
    }

    /// Sweep every device tolerantly and mark the manager not-ready.
    /// Invoked directly for graceful process-exit teardown, or via the
    /// signal handler installed by [`crate::signal::install`] for
    /// fatal-signal teardown. A no-op if the manager was never initialised.
    pub fn clear_from_global_state() {
        if let Some(mgr) = MANAGER.get() {
            mgr.ready.store(false, Ordering::SeqCst);
            for device in &mgr.devices {
                device.clear(true);
            }
        }
    }
}
