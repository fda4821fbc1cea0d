//! Environment-sourced configuration.
//!
//! Mirrors the recognised environment variables: `DRIVER_ADDRESS`,
//! `CORE_GROUP_SIZES`, `SHM_MAP`, `PROFILE_DIR`, `PATH`.

use std::env;

/// Maximum number of physical accelerator cores the runtime will ever
/// reason about. Bounds the device manager's slot array and the grouping
/// policy grammar's integers.
pub const MAX_NUM_CORES: usize = 64;

const DEFAULT_DRIVER_ADDRESS: &str = "unix:/run/driver.sock";
const ACCEL_BIN_DIR: &str = "/opt/accel/bin";

/// One parsed group from the `CORE_GROUP_SIZES` grammar: `num_cores` cores
/// per execution group, duplicated `multiplicity` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGroup {
    pub num_cores: usize,
    pub multiplicity: usize,
}

/// Fully resolved runtime configuration, read once at
/// [`crate::manager::DeviceManager`] initialisation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub driver_address: String,
    pub groups: Vec<DeviceGroup>,
    pub shm_enabled: bool,
    pub profile_dir: Option<String>,
}

impl RuntimeConfig {
    /// Read and parse every recognised environment variable.
    ///
    /// `CORE_GROUP_SIZES` is parsed by [`parse_core_group_sizes`]; a
    /// malformed value is discarded with a `tracing::warn!` and a default
    /// policy derived from `opt_device_size`/`max_num_duplicates` is used
    /// instead (the caller supplies those two once the operator attributes
    /// are known, via [`RuntimeConfig::groups_or_default`]).
    pub fn from_env() -> Self {
        prepend_accel_path();

        let driver_address =
            env::var("DRIVER_ADDRESS").unwrap_or_else(|_| DEFAULT_DRIVER_ADDRESS.to_string());

        let shm_enabled = match env::var("SHM_MAP") {
            Ok(v) if v == "no" => false,
            _ => true,
        };

        let groups = match env::var("CORE_GROUP_SIZES") {
            Ok(raw) => match parse_core_group_sizes(&raw) {
                Ok(groups) if !groups.is_empty() => groups,
                Ok(_) => {
                    tracing::warn!("CORE_GROUP_SIZES was empty; using default policy");
                    Vec::new()
                }
                Err(e) => {
                    tracing::warn!(error = %e, raw = %raw, "malformed CORE_GROUP_SIZES; using default policy");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let profile_dir = env::var("PROFILE_DIR").ok().filter(|s| !s.is_empty());

        Self {
            driver_address,
            groups,
            shm_enabled,
            profile_dir,
        }
    }

    /// The configured groups, or a default policy derived from an
    /// operator-supplied size hint and duplication advice. Called lazily
    /// since the default depends on the first operator to request a
    /// device.
    pub fn groups_or_default(&self, opt_device_size: usize, max_num_duplicates: usize) -> Vec<DeviceGroup> {
        if !self.groups.is_empty() {
            return self.groups.clone();
        }
        default_policy(opt_device_size, max_num_duplicates)
    }
}

/// Parse the `CORE_GROUP_SIZES` grammar:
///
/// ```text
/// spec := group ("," group)*
/// group := [multiplicity "x"] size
/// multiplicity, size := integer in [0, MAX_NUM_CORES]
/// ```
///
/// Enclosing `[` `]` brackets are stripped before parsing if present.
pub fn parse_core_group_sizes(raw: &str) -> std::result::Result<Vec<DeviceGroup>, String> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    if stripped.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut groups = Vec::new();
    for part in stripped.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty group in '{}'", raw));
        }

        let (multiplicity, size_str) = match part.split_once('x') {
            Some((mult, size)) => {
                let mult: usize = mult
                    .trim()
                    .parse()
                    .map_err(|_| format!("non-integer multiplicity in group '{}'", part))?;
                (mult, size.trim())
            }
            None => (1, part),
        };

        let size: usize = size_str
            .parse()
            .map_err(|_| format!("non-integer size in group '{}'", part))?;

        if size > MAX_NUM_CORES || multiplicity > MAX_NUM_CORES {
            return Err(format!(
                "group '{}' out of range [0, {}]",
                part, MAX_NUM_CORES
            ));
        }

        groups.push(DeviceGroup {
            num_cores: size,
            multiplicity,
        });
    }

    Ok(groups)
}

/// Default grouping policy when `CORE_GROUP_SIZES` is absent or malformed.
///
/// Splits the fixed core budget into same-sized devices of
/// `opt_device_size` cores each, duplicated up to `max_num_duplicates`
/// times per device as long as there are enough cores to go around.
/// Fewer-than-requested devices is not fatal; the manager only requires
/// that at least one execution group was created (enforced by the
/// caller, not here).
pub fn default_policy(opt_device_size: usize, max_num_duplicates: usize) -> Vec<DeviceGroup> {
    let device_size = opt_device_size.clamp(1, MAX_NUM_CORES);
    let duplicates = max_num_duplicates.max(1);

    let cores_per_logical_device = device_size * duplicates;
    let num_devices = (MAX_NUM_CORES / cores_per_logical_device).max(1);

    vec![
        DeviceGroup {
            num_cores: device_size,
            multiplicity: duplicates,
        };
        num_devices
    ]
}

fn prepend_accel_path() {
    let current = env::var("PATH").unwrap_or_default();
    if current.split(':').any(|p| p == ACCEL_BIN_DIR) {
        return;
    }
    let updated = if current.is_empty() {
        ACCEL_BIN_DIR.to_string()
    } else {
        format!("{}:{}", current, ACCEL_BIN_DIR)
    };
    env::set_var("PATH", updated);
}
