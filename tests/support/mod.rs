//! Shared mock-driver harness for integration tests: implements just
//! enough of the wire protocol (`npu_runtime_core::driver::wire`) to drive
//! `Device`/`InferenceOperator` end-to-end without a real accelerator or
//! driver daemon, which is an external collaborator

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use npu_runtime_core::driver::{DriverClient, InferPayload, Request, Response, Status, TensorRef};

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// A background thread accepting one connection and serving deterministic
/// replies: sequential `eg_id`/`nn_id`/cookie allocation, and inference
/// calls echoed back (input bytes renamed to the requested output names)
/// so a round-trip through the real wire framing is still exercised.
pub struct MockDriver {
    pub address: String,
    pub log: CallLog,
    _handle: thread::JoinHandle<()>,
}

impl MockDriver {
    pub fn spawn() -> Self {
        Self::spawn_with_nn_id_start(100)
    }

    /// Like [`MockDriver::spawn`], but every `load` call hands out the
    /// same fixed `nn_id` instead of a fresh one each time — used to
    /// exercise the `ALREADY_EXISTS` collision path, which a normal
    /// sequential mock never triggers.
    pub fn spawn_fixed_nn_id(nn_id: u32) -> Self {
        Self::spawn_inner(NnIdPolicy::Fixed(nn_id))
    }

    fn spawn_with_nn_id_start(start: u32) -> Self {
        Self::spawn_inner(NnIdPolicy::Sequential(AtomicU32::new(start)))
    }

    fn spawn_inner(nn_policy: NnIdPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock-driver.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let thread_log = log.clone();

        let handle = thread::Builder::new()
            .name("mock-driver".into())
            .spawn(move || {
                let _dir = dir; // keeps the socket's backing tempdir alive
                if let Ok((stream, _)) = listener.accept() {
                    serve(stream, thread_log, nn_policy);
                }
            })
            .unwrap();

        Self { address: format!("unix:{}", path.display()), log, _handle: handle }
    }

    pub fn connect(&self) -> Arc<DriverClient> {
        Arc::new(DriverClient::initialize(&self.address).unwrap())
    }
}

enum NnIdPolicy {
    Sequential(AtomicU32),
    Fixed(u32),
}

impl NnIdPolicy {
    fn next(&self) -> u32 {
        match self {
            NnIdPolicy::Sequential(counter) => counter.fetch_add(1, Ordering::SeqCst),
            NnIdPolicy::Fixed(id) => *id,
        }
    }
}

fn serve(stream: UnixStream, log: CallLog, nn_policy: NnIdPolicy) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone socket"));
    let mut writer = BufWriter::new(stream);

    let next_eg = AtomicU32::new(1);
    let next_cookie = AtomicU64::new(1);
    let mut pending_loads: HashMap<u32, Vec<u8>> = HashMap::new();
    let mut pending_outputs: HashMap<u64, Vec<TensorRef>> = HashMap::new();
    let mut active_load_eg: Option<u32> = None;

    loop {
        let (id, request) = match read_frame(&mut reader) {
            Ok(v) => v,
            Err(_) => return,
        };

        let response = match request {
            Request::CreateEg { requested_cores } => {
                let eg_id = next_eg.fetch_add(1, Ordering::SeqCst);
                Response::CreateEg { status: Status::Ok, eg_id, granted_cores: requested_cores }
            }
            Request::DestroyEg { eg_id, .. } => {
                log.lock().unwrap().push(format!("destroy_eg:{}", eg_id));
                Response::DestroyEg { status: Status::Ok }
            }
            Request::LoadHeader { eg_id, .. } => {
                active_load_eg = Some(eg_id);
                pending_loads.insert(eg_id, Vec::new());
                Response::LoadHeader { status: Status::Ok }
            }
            Request::LoadChunk { bytes } => {
                if bytes.is_empty() {
                    let nn_id = nn_policy.next();
                    log.lock().unwrap().push(format!("load_complete:{}", nn_id));
                    Response::LoadComplete { status: Status::Ok, nn_id }
                } else {
                    if let Some(eg_id) = active_load_eg {
                        pending_loads.entry(eg_id).or_default().extend(bytes);
                    }
                    Response::LoadChunk { status: Status::Ok }
                }
            }
            Request::Unload { nn_id, .. } => {
                log.lock().unwrap().push(format!("unload:{}", nn_id));
                Response::Unload { status: Status::Ok }
            }
            Request::Start { nn_id } => {
                log.lock().unwrap().push(format!("start:{}", nn_id));
                Response::Start { status: Status::Ok }
            }
            Request::Stop { nn_id } => {
                log.lock().unwrap().push(format!("stop:{}", nn_id));
                Response::Stop { status: Status::Ok }
            }
            Request::Infer { nn_id, io } => {
                log.lock().unwrap().push(format!("infer:{}", nn_id));
                Response::Infer { status: Status::Ok, outputs: echo(io) }
            }
            Request::InferPost { nn_id, io } => {
                log.lock().unwrap().push(format!("infer_post:{}", nn_id));
                let cookie = next_cookie.fetch_add(1, Ordering::SeqCst);
                pending_outputs.insert(cookie, echo(io));
                Response::InferPost { status: Status::Ok, cookie }
            }
            Request::InferWait { cookie } => {
                let outputs = pending_outputs.remove(&cookie).unwrap_or_default();
                Response::InferWait { status: Status::Ok, outputs }
            }
            Request::ShmMap { .. } => {
                static NEXT_MAPPING: AtomicU64 = AtomicU64::new(1);
                Response::ShmMap { status: Status::Ok, mapping_id: NEXT_MAPPING.fetch_add(1, Ordering::SeqCst) }
            }
            Request::ShmUnmap { .. } => Response::ShmUnmap { status: Status::Ok },
        };

        if write_frame(&mut writer, id, &response).is_err() {
            return;
        }
    }
}

/// Turn one request's inputs into outputs of the same bytes, renamed to
/// the requested output names — enough to assert on row counts, padding,
/// and ordering without modelling real accelerator numerics.
fn echo(io: InferPayload) -> Vec<TensorRef> {
    io.output_names
        .into_iter()
        .zip(io.inputs)
        .map(|(name, input)| match input {
            TensorRef::Inline { bytes, .. } => TensorRef::Inline { name, bytes },
            TensorRef::Shared { mapping_id, offset, len, .. } => TensorRef::Shared { name, mapping_id, offset, len },
        })
        .collect()
}

fn write_frame<W: Write, T: serde::Serialize>(w: &mut W, id: u64, value: &T) -> io::Result<()> {
    let body = bincode::serialize(&(id, value)).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

fn read_frame<R: Read, T: serde::de::DeserializeOwned>(r: &mut R) -> io::Result<(u64, T)> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    bincode::deserialize(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
