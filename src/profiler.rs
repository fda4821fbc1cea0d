//! Optional profiler hook. Enabled by a non-empty `PROFILE_DIR`; dumps
//! the compiled artifact and subgraph at operator construction, and
//! forks a profiler subprocess around each `infer`. Every failure here
//! degrades to a log line and never propagates.

use std::fs;
use std::path::PathBuf;

use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, ForkResult};

/// Replace `/` with `+` in an operator name to make it filesystem-safe.
pub fn mangle_op_name(op_name: &str) -> String {
    op_name.replace('/', "+")
}

/// Write `<PROFILE_DIR>/<mangled_op_name>.neff` and `.pb` at operator
/// construction. Failures are logged and swallowed.
pub fn dump_artifacts(profile_dir: &str, op_name: &str, executable: &[u8], graph_def: &[u8]) {
    let mangled = mangle_op_name(op_name);
    let neff_path = PathBuf::from(profile_dir).join(format!("{}.neff", mangled));
    let pb_path = PathBuf::from(profile_dir).join(format!("{}.pb", mangled));

    if let Err(e) = fs::write(&neff_path, executable) {
        tracing::warn!(error = %e, path = %neff_path.display(), "profiler: failed to dump compiled artifact");
    }
    if let Err(e) = fs::write(&pb_path, graph_def) {
        tracing::warn!(error = %e, path = %pb_path.display(), "profiler: failed to dump subgraph");
    }
}

/// Run `profiler_bin` around one `infer` call, targeting
/// `<PROFILE_DIR>/<mangled>-<nn_id>-<session>.ipd`.
/// Guards the `fork`+`execvp`+`waitpid` sequence: any failure is logged
/// and ignored, never propagated to the caller.
pub fn run_profiled<F, R>(profile_dir: &str, op_name: &str, nn_id: u32, session: u64, body: F) -> R
where
    F: FnOnce() -> R,
{
    let mangled = mangle_op_name(op_name);
    let output_path = PathBuf::from(profile_dir).join(format!("{}-{}-{}.ipd", mangled, nn_id, session));

    match spawn_profiler(&output_path) {
        Ok(child) => {
            let result = body();
            if let Err(e) = waitpid(child, None) {
                tracing::warn!(error = %e, pid = %child, "profiler: waitpid failed");
            }
            result
        }
        Err(e) => {
            tracing::warn!(error = %e, "profiler: failed to spawn subprocess, running unprofiled");
            body()
        }
    }
}

fn spawn_profiler(output_path: &std::path::Path) -> Result<nix::unistd::Pid, String> {
    use std::ffi::CString;

    let bin = CString::new("neuron-profile").map_err(|e| e.to_string())?;
    let out_arg = CString::new(output_path.as_os_str().as_encoded_bytes()).map_err(|e| e.to_string())?;
    let args = [bin.clone(), CString::new("-o").unwrap(), out_arg];

    match unsafe { fork() }.map_err(|e| e.to_string())? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let _ = execvp(&bin, &args);
            // execvp only returns on failure; the child must not unwind
            // back into the parent's call stack.
            std::process::exit(127);
        }
    }
}
