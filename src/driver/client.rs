//! Thin, reconnection-free, thread-safe façade over the out-of-process
//! driver daemon.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::wire;
use super::wire::{InferPayload, Request, Response, ShmProt, Status, TensorRef, LOAD_CHUNK_SIZE};

type Pending = mpsc::Sender<Response>;

/// Outcome of a `shm_map` call that distinguishes the driver's
/// distinguished "unsupported" status from a successful mapping, so
/// callers can tell it apart from a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMapOutcome {
    Mapped(u64),
    Unsupported,
}

/// One connection to the driver daemon. Owns a writer thread and a reader
/// thread so that `infer_post` never blocks on the driver's reply — the
/// reader thread demultiplexes responses back to whichever call (sync or
/// posted) is waiting on them.
pub struct DriverClient {
    writer_tx: mpsc::Sender<WriterJob>,
    pending: std::sync::Arc<Mutex<HashMap<u64, Pending>>>,
    next_cookie: AtomicU64,
    reader_handle: Option<thread::JoinHandle<()>>,
    writer_handle: Option<thread::JoinHandle<()>>,
}

enum WriterJob {
    Send { id: u64, request: Request },
    Shutdown,
}

impl DriverClient {
    /// Establish a connection to the driver daemon. `address` must begin
    /// with `unix:`; the remainder is the socket path.
    pub fn initialize(address: &str) -> Result<Self> {
        let path = address.strip_prefix("unix:").ok_or_else(|| {
            Error::InvalidArgument(format!(
                "DRIVER_ADDRESS '{}' must begin with 'unix:'",
                address
            ))
        })?;

        let stream = UnixStream::connect(path)
            .map_err(|e| Error::Unavailable(format!("connecting to driver at {}: {}", path, e)))?;
        let write_stream = stream
            .try_clone()
            .map_err(|e| Error::Unavailable(format!("cloning driver socket: {}", e)))?;

        let pending: std::sync::Arc<Mutex<HashMap<u64, Pending>>> =
            std::sync::Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        let (writer_tx, writer_rx) = mpsc::channel::<WriterJob>();

        let writer_handle = thread::Builder::new()
            .name("driver-writer".into())
            .spawn(move || writer_loop(write_stream, writer_rx))
            .map_err(|e| Error::Internal(format!("spawning driver writer thread: {}", e)))?;

        let reader_handle = thread::Builder::new()
            .name("driver-reader".into())
            .spawn(move || reader_loop(stream, reader_pending))
            .map_err(|e| Error::Internal(format!("spawning driver reader thread: {}", e)))?;

        Ok(Self {
            writer_tx,
            pending,
            next_cookie: AtomicU64::new(1),
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        })
    }

    fn call(&self, request: Request) -> Result<Response> {
        let id = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(id, tx);

        self.writer_tx
            .send(WriterJob::Send { id, request })
            .map_err(|_| Error::Unavailable("driver writer thread has exited".into()))?;

        rx.recv()
            .map_err(|_| Error::Unavailable("driver connection closed before reply".into()))
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn create_eg(&self, requested_cores: u32) -> Result<(u32, u32)> {
        match self.call(Request::CreateEg { requested_cores })? {
            Response::CreateEg { status, eg_id, granted_cores } if status.is_success() => {
                Ok((eg_id, granted_cores))
            }
            Response::CreateEg { status, .. } => Err(wire::status_to_error(status, "create_eg")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn destroy_eg(&self, eg_id: u32, from_shutdown: bool) -> Result<()> {
        match self.call(Request::DestroyEg { eg_id, from_shutdown })? {
            Response::DestroyEg { status } if status.is_success() => Ok(()),
            Response::DestroyEg { status } if from_shutdown => {
                tracing::warn!(eg_id, kind = status_kind(status), "destroy_eg failed during shutdown, ignoring");
                Ok(())
            }
            Response::DestroyEg { status } => Err(wire::status_to_error(status, "destroy_eg")),
            other => Err(unexpected(other)),
        }
    }

    /// Stream `artifact` to `eg_id` in `LOAD_CHUNK_SIZE` chunks preceded
    /// by a header message carrying the target EG, the total byte size,
    /// and the model parameters.
    #[tracing::instrument(level = "info", skip(self, artifact))]
    pub fn load(
        &self,
        eg_id: u32,
        artifact: &[u8],
        timeout_secs: u32,
        max_in_flight: u32,
        profile_enabled: bool,
    ) -> Result<u32> {
        match self.call(Request::LoadHeader {
            eg_id,
            total_size: artifact.len() as u64,
            timeout_secs,
            max_in_flight,
            profile_enabled,
        })? {
            Response::LoadHeader { status } if status.is_success() => {}
            Response::LoadHeader { status } => return Err(wire::status_to_error(status, "load header")),
            other => return Err(unexpected(other)),
        }

        for chunk in artifact.chunks(LOAD_CHUNK_SIZE) {
            match self.call(Request::LoadChunk { bytes: chunk.to_vec() })? {
                Response::LoadChunk { status } if status.is_success() => {}
                Response::LoadChunk { status } => return Err(wire::status_to_error(status, "load chunk")),
                other => return Err(unexpected(other)),
            }
        }

        // The final chunk response, if artifact is empty, is still expected
        // as a LoadComplete from the driver once all bytes are acknowledged.
        match self.call(Request::LoadChunk { bytes: Vec::new() })? {
            Response::LoadComplete { status, nn_id } if status.is_success() => Ok(nn_id),
            Response::LoadComplete { status, .. } => Err(wire::status_to_error(status, "load complete")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn unload(&self, nn_id: u32, from_shutdown: bool) -> Result<()> {
        match self.call(Request::Unload { nn_id, from_shutdown })? {
            Response::Unload { status } if status.is_success() => Ok(()),
            Response::Unload { status } if from_shutdown => {
                tracing::warn!(nn_id, kind = status_kind(status), "unload failed during shutdown, ignoring");
                Ok(())
            }
            Response::Unload { status } => Err(wire::status_to_error(status, "unload")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn start(&self, nn_id: u32) -> Result<()> {
        match self.call(Request::Start { nn_id })? {
            Response::Start { status } if status.is_success() => Ok(()),
            Response::Start { status } => Err(wire::status_to_error(status, "start")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn stop(&self, nn_id: u32) -> Result<()> {
        match self.call(Request::Stop { nn_id })? {
            Response::Stop { status } if status.is_success() => Ok(()),
            Response::Stop { status } => Err(wire::status_to_error(status, "stop")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, io))]
    pub fn infer(&self, nn_id: u32, io: InferPayload) -> Result<Vec<TensorRef>> {
        match self.call(Request::Infer { nn_id, io })? {
            Response::Infer { status, outputs } if status.is_success() => Ok(outputs),
            Response::Infer { status, .. } => Err(wire::status_to_error(status, "infer")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, io))]
    pub fn infer_post(&self, nn_id: u32, io: InferPayload) -> Result<u64> {
        match self.call(Request::InferPost { nn_id, io })? {
            Response::InferPost { status, cookie } if status.is_success() => Ok(cookie),
            Response::InferPost { status, .. } => Err(wire::status_to_error(status, "infer_post")),
            other => Err(unexpected(other)),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn infer_wait(&self, cookie: u64) -> Result<Vec<TensorRef>> {
        match self.call(Request::InferWait { cookie })? {
            Response::InferWait { status, outputs } if status.is_success() => Ok(outputs),
            Response::InferWait { status, .. } => Err(wire::status_to_error(status, "infer_wait")),
            other => Err(unexpected(other)),
        }
    }

    pub fn shm_map(&self, path: &str, prot: ShmProt, session: u64) -> Result<u64> {
        match self.shm_map_checked(path, prot, session)? {
            ShmMapOutcome::Mapped(mapping_id) => Ok(mapping_id),
            ShmMapOutcome::Unsupported => {
                Err(wire::status_to_error(Status::SharedMemoryUnsupported, "shm_map"))
            }
        }
    }

    /// Like [`DriverClient::shm_map`], but distinguishes the driver's
    /// "shared memory unsupported" status from every other failure
    /// instead of folding both into an error. The shared-memory pool
    /// uses this to decide whether to latch permanently `invalid` or
    /// just log a transient allocation failure.
    pub fn shm_map_checked(&self, path: &str, prot: ShmProt, session: u64) -> Result<ShmMapOutcome> {
        match self.call(Request::ShmMap { path: path.to_string(), prot, session })? {
            Response::ShmMap { status, .. } if status == Status::SharedMemoryUnsupported => {
                Ok(ShmMapOutcome::Unsupported)
            }
            Response::ShmMap { status, mapping_id } if status.is_success() => {
                Ok(ShmMapOutcome::Mapped(mapping_id))
            }
            Response::ShmMap { status, .. } => Err(wire::status_to_error(status, "shm_map")),
            other => Err(unexpected(other)),
        }
    }

    pub fn shm_unmap(&self, path: &str, prot: ShmProt) -> Result<()> {
        match self.call(Request::ShmUnmap { path: path.to_string(), prot })? {
            Response::ShmUnmap { status } if status.is_success() => Ok(()),
            Response::ShmUnmap { status } => Err(wire::status_to_error(status, "shm_unmap")),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for DriverClient {
    fn drop(&mut self) {
        let _ = self.writer_tx.send(WriterJob::Shutdown);
        if let Some(h) = self.writer_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
    }
}

fn writer_loop(stream: UnixStream, rx: mpsc::Receiver<WriterJob>) {
    let mut writer = BufWriter::new(stream);
    while let Ok(job) = rx.recv() {
        let (id, request) = match job {
            WriterJob::Send { id, request } => (id, request),
            WriterJob::Shutdown => break,
        };
        if let Err(e) = write_frame(&mut writer, id, &request) {
            tracing::warn!(error = %e, "driver writer thread: write failed, exiting");
            break;
        }
    }
}

fn reader_loop(stream: UnixStream, pending: std::sync::Arc<Mutex<HashMap<u64, Pending>>>) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader) {
            Ok((id, response)) => {
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(response);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "driver reader thread: read failed, draining pending calls");
                break;
            }
        }
    }
    // The connection is gone; wake every still-outstanding caller with a
    // dropped sender so their `rx.recv` returns an error instead of
    // hanging forever.
    pending.lock().clear();
}

fn write_frame<W: Write, T: serde::Serialize>(w: &mut W, id: u64, value: &T) -> io::Result<()> {
    let body = bincode::serialize(&(id, value))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
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

fn status_kind(status: Status) -> &'static str {
    if status.is_success() {
        "OK"
    } else {
        wire::status_to_error(status, "").kind()
    }
}

fn unexpected(response: Response) -> Error {
    Error::Internal(format!("unexpected driver response variant: {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn initialize_rejects_non_unix_address() {
        let err = DriverClient::initialize("tcp:127.0.0.1:9000").unwrap_err();
        assert_eq!(err.kind(), "INVALID_ARGUMENT");
    }

    #[test]
    fn initialize_fails_when_driver_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.sock");
        let err = DriverClient::initialize(&format!("unix:{}", path.display())).unwrap_err();
        assert_eq!(err.kind(), "UNAVAILABLE");
    }

    #[test]
    fn frame_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let (id, req) = read_frame(&mut reader).unwrap();
            match req {
                Request::CreateEg { requested_cores } => {
                    write_frame(
                        &mut writer,
                        id,
                        &Request::CreateEg { requested_cores },
                    )
                    .ok();
                }
                _ => unreachable!(),
            }
        });

        let client = UnixStream::connect(&path).unwrap();
        let mut writer = BufWriter::new(client.try_clone().unwrap());
        let mut reader = BufReader::new(client);
        write_frame(&mut writer, 7, &Request::CreateEg { requested_cores: 4 }).unwrap();
        let (id, _echoed): (u64, Request) = read_frame(&mut reader).unwrap();
        assert_eq!(id, 7);
        server.join().unwrap();
    }
}
