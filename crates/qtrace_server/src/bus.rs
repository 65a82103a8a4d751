//! Probe transport: the socket the coordinator attaches through.
//!
//! The server listens on a Unix socket derived from the postmaster pid.
//! One collector session at a time: the session receives a hello frame
//! carrying the marker catalog, sends attach/detach control frames to
//! toggle marker semaphores, and receives fired markers as length-prefixed
//! binary frames. Emission is best-effort: a slow session drops events, it
//! never blocks a backend.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use bytes::{Buf, BufMut};

use crate::marker::{MarkerId, MarkerObserver};
use crate::ServerShared;

const FRAME_HELLO: u8 = 0x01;
const FRAME_MARKER: u8 = 0x03;
const FRAME_ATTACH: u8 = 0x10;
const FRAME_DETACH: u8 = 0x11;

/// Upper bound on any frame body; a larger length prefix means a corrupt
/// stream.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Queue depth between marker emission and the session writer.
const SESSION_QUEUE_DEPTH: usize = 8192;

/// Well-known socket path for a postmaster pid.
pub fn socket_path(runtime_dir: &Path, postmaster_pid: u32) -> PathBuf {
    runtime_dir.join(format!("qtrace-{postmaster_pid}.sock"))
}

/// One frame of the probe transport.
#[derive(Debug, Clone, PartialEq)]
pub enum BusFrame {
    /// Server → session, once per connection: pid plus the marker catalog
    /// in id order.
    Hello {
        server_pid: u32,
        markers: Vec<String>,
    },
    /// Server → session: one fired marker.
    Marker {
        backend_pid: u32,
        marker_id: u32,
        args: Vec<u64>,
        payload: Option<Vec<u8>>,
    },
    /// Session → server: increment semaphores.
    Attach { markers: Vec<String> },
    /// Session → server: decrement semaphores.
    Detach { markers: Vec<String> },
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.put_u16_ne(value.len().min(u16::MAX as usize) as u16);
    buf.extend_from_slice(&value.as_bytes()[..value.len().min(u16::MAX as usize)]);
}

fn get_string(buf: &mut &[u8]) -> anyhow::Result<String> {
    if buf.remaining() < 2 {
        anyhow::bail!("truncated string length");
    }
    let len = buf.get_u16_ne() as usize;
    if buf.remaining() < len {
        anyhow::bail!("truncated string body");
    }
    let value = String::from_utf8(buf[..len].to_vec()).context("non-utf8 string")?;
    buf.advance(len);
    Ok(value)
}

impl BusFrame {
    /// Encode with the length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            BusFrame::Hello {
                server_pid,
                markers,
            } => {
                body.put_u8(FRAME_HELLO);
                body.put_u32_ne(*server_pid);
                body.put_u32_ne(markers.len() as u32);
                for marker in markers {
                    put_string(&mut body, marker);
                }
            }
            BusFrame::Marker {
                backend_pid,
                marker_id,
                args,
                payload,
            } => {
                body.put_u8(FRAME_MARKER);
                body.put_u32_ne(*backend_pid);
                body.put_u32_ne(*marker_id);
                body.put_u8(args.len() as u8);
                for arg in args {
                    body.put_u64_ne(*arg);
                }
                match payload {
                    Some(payload) => {
                        body.put_u32_ne(payload.len() as u32);
                        body.extend_from_slice(payload);
                    }
                    None => body.put_u32_ne(u32::MAX),
                }
            }
            BusFrame::Attach { markers } => {
                body.put_u8(FRAME_ATTACH);
                body.put_u32_ne(markers.len() as u32);
                for marker in markers {
                    put_string(&mut body, marker);
                }
            }
            BusFrame::Detach { markers } => {
                body.put_u8(FRAME_DETACH);
                body.put_u32_ne(markers.len() as u32);
                for marker in markers {
                    put_string(&mut body, marker);
                }
            }
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.put_u32_ne(body.len() as u32);
        frame.extend_from_slice(&body);
        frame
    }

    pub fn decode(mut body: &[u8]) -> anyhow::Result<Self> {
        if body.is_empty() {
            anyhow::bail!("empty frame");
        }
        let kind = body.get_u8();
        match kind {
            FRAME_HELLO => {
                let server_pid = body.get_u32_ne();
                let count = body.get_u32_ne() as usize;
                let mut markers = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    markers.push(get_string(&mut body)?);
                }
                Ok(BusFrame::Hello {
                    server_pid,
                    markers,
                })
            }
            FRAME_MARKER => {
                if body.remaining() < 9 {
                    anyhow::bail!("truncated marker frame");
                }
                let backend_pid = body.get_u32_ne();
                let marker_id = body.get_u32_ne();
                let arg_count = body.get_u8() as usize;
                if body.remaining() < arg_count * 8 + 4 {
                    anyhow::bail!("truncated marker args");
                }
                let mut args = Vec::with_capacity(arg_count);
                for _ in 0..arg_count {
                    args.push(body.get_u64_ne());
                }
                let payload_len = body.get_u32_ne();
                let payload = if payload_len == u32::MAX {
                    None
                } else {
                    let payload_len = payload_len as usize;
                    if body.remaining() < payload_len {
                        anyhow::bail!("truncated marker payload");
                    }
                    let payload = body[..payload_len].to_vec();
                    body.advance(payload_len);
                    Some(payload)
                };
                Ok(BusFrame::Marker {
                    backend_pid,
                    marker_id,
                    args,
                    payload,
                })
            }
            FRAME_ATTACH | FRAME_DETACH => {
                let count = body.get_u32_ne() as usize;
                let mut markers = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    markers.push(get_string(&mut body)?);
                }
                if kind == FRAME_ATTACH {
                    Ok(BusFrame::Attach { markers })
                } else {
                    Ok(BusFrame::Detach { markers })
                }
            }
            other => anyhow::bail!("unknown frame kind {other:#x}"),
        }
    }
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
pub fn read_frame(stream: &mut impl Read) -> anyhow::Result<Option<BusFrame>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame length"),
    }
    let len = u32::from_ne_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame length {len} exceeds limit");
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).context("read frame body")?;
    BusFrame::decode(&body).map(Some)
}

/// Live backends, kept so a newly attached session can learn about
/// children forked before it connected.
#[derive(Debug, Clone, Copy)]
pub struct BackendInfo {
    pub pid: u32,
    pub socket_fd: i32,
    pub background: bool,
}

#[derive(Default)]
pub struct BackendDirectory {
    inner: Mutex<HashMap<u32, BackendInfo>>,
}

impl BackendDirectory {
    pub fn register(&self, info: BackendInfo) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(info.pid, info);
    }

    pub fn unregister(&self, pid: u32) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid);
    }

    pub fn list(&self) -> Vec<BackendInfo> {
        let mut backends: Vec<BackendInfo> = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .copied()
            .collect();
        backends.sort_by_key(|info| info.pid);
        backends
    }
}

struct SessionObserver {
    tx: SyncSender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl MarkerObserver for SessionObserver {
    fn marker(&self, backend_pid: u32, marker: MarkerId, args: &[u64], payload: Option<&[u8]>) {
        let frame = BusFrame::Marker {
            backend_pid,
            marker_id: marker.0,
            args: args.to_vec(),
            payload: payload.map(<[u8]>::to_vec),
        }
        .encode();
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The server-side listener. Accepts one session at a time.
pub struct ProbeBusListener {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ProbeBusListener {
    pub fn start(
        server: Arc<ServerShared>,
        backends: Arc<BackendDirectory>,
        path: PathBuf,
    ) -> anyhow::Result<Self> {
        // A stale socket from a dead process blocks bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("bind probe socket {}", path.display()))?;
        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let accept_thread = std::thread::Builder::new()
            .name("probe-bus-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            if let Err(err) = handle_session(&server, &backends, stream, &accept_stop)
                            {
                                tracing::warn!(error = %err, "probe session ended with error");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "probe socket accept failed");
                            break;
                        }
                    }
                }
            })
            .context("spawn probe-bus accept thread")?;
        Ok(Self {
            path,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting sessions and remove the socket file.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Wake the accept loop.
        let _ = UnixStream::connect(&self.path);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle_session(
    server: &Arc<ServerShared>,
    backends: &Arc<BackendDirectory>,
    mut stream: UnixStream,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    tracing::info!("collector session attached to probe socket");
    // A deadline on control reads lets the session observe listener
    // shutdown; control frames are tiny and written whole, so a deadline
    // splitting one mid-frame is not a practical concern.
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .context("set session read deadline")?;
    let mut write_stream = stream.try_clone().context("clone session stream")?;

    // Hello first, straight onto the socket, before the event queue exists.
    let hello = BusFrame::Hello {
        server_pid: server.postmaster_pid,
        markers: server.fabric.marker_names().to_vec(),
    };
    write_stream
        .write_all(&hello.encode())
        .context("write hello frame")?;

    let (tx, rx) = sync_channel::<Vec<u8>>(SESSION_QUEUE_DEPTH);
    let dropped = Arc::new(AtomicU64::new(0));
    let writer = std::thread::Builder::new()
        .name("probe-bus-writer".to_string())
        .spawn(move || {
            while let Ok(frame) = rx.recv() {
                if write_stream.write_all(&frame).is_err() {
                    break;
                }
            }
        })
        .context("spawn probe-bus writer thread")?;

    server.fabric.set_observer(Arc::new(SessionObserver {
        tx: tx.clone(),
        dropped: Arc::clone(&dropped),
    }));

    // Semaphores held by this session, decremented on disconnect so a hard
    // kill of the coordinator leaves every marker a no-op.
    let mut attached: Vec<String> = Vec::new();
    let result = loop {
        match read_frame(&mut stream) {
            Ok(Some(BusFrame::Attach { markers })) => {
                for name in markers {
                    if server.fabric.attach(&name) {
                        if name == "postmaster_fork_backend" {
                            replay_backends(server, backends, &tx, false);
                        } else if name == "postmaster_fork_background" {
                            replay_backends(server, backends, &tx, true);
                        }
                        attached.push(name);
                    } else {
                        tracing::warn!(marker = %name, "attach requested for unknown marker");
                    }
                }
            }
            Ok(Some(BusFrame::Detach { markers })) => {
                for name in markers {
                    server.fabric.detach(&name);
                    if let Some(pos) = attached.iter().position(|held| *held == name) {
                        attached.swap_remove(pos);
                    }
                }
            }
            Ok(Some(_)) => {
                break Err(anyhow::anyhow!("unexpected frame from session"));
            }
            Ok(None) => break Ok(()),
            Err(err) => {
                let timed_out = err.downcast_ref::<std::io::Error>().is_some_and(|io| {
                    matches!(
                        io.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    )
                });
                if timed_out {
                    if stop.load(Ordering::Relaxed) {
                        break Ok(());
                    }
                    continue;
                }
                break Err(err);
            }
        }
    };

    server.fabric.clear_observer();
    for name in &attached {
        server.fabric.detach(name);
    }
    drop(tx);
    let _ = writer.join();

    let lost = dropped.load(Ordering::Relaxed);
    if lost > 0 {
        tracing::warn!(lost, "probe session dropped events");
    }
    tracing::info!("collector session detached");
    result
}

/// Replay fork events for backends that were alive before the session
/// attached.
fn replay_backends(
    server: &Arc<ServerShared>,
    backends: &Arc<BackendDirectory>,
    tx: &SyncSender<Vec<u8>>,
    background: bool,
) {
    let marker_name = if background {
        "postmaster_fork_background"
    } else {
        "postmaster_fork_backend"
    };
    let Some(marker_id) = server.fabric.lookup(marker_name) else {
        return;
    };
    for info in backends.list() {
        if info.background != background {
            continue;
        }
        let args = if background {
            vec![u64::from(info.pid)]
        } else {
            vec![u64::from(info.pid), info.socket_fd as u64]
        };
        let frame = BusFrame::Marker {
            backend_pid: server.postmaster_pid,
            marker_id: marker_id.0,
            args,
            payload: None,
        }
        .encode();
        let _ = tx.try_send(frame);
    }
}

/// Result of a client read under a deadline.
#[derive(Debug)]
pub enum BusRead {
    Frame(BusFrame),
    TimedOut,
    Closed,
}

/// Client half, used by the coordinator. Reads are buffered internally so
/// a deadline expiring mid-frame never desynchronizes the stream.
pub struct ProbeBusClient {
    stream: UnixStream,
    buffer: Vec<u8>,
}

impl ProbeBusClient {
    /// Connect and consume the hello frame.
    pub fn connect(path: &Path) -> anyhow::Result<(Self, u32, Vec<String>)> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("connect probe socket {}", path.display()))?;
        let mut client = Self {
            stream,
            buffer: Vec::new(),
        };
        match client.read(None)? {
            BusRead::Frame(BusFrame::Hello {
                server_pid,
                markers,
            }) => Ok((client, server_pid, markers)),
            BusRead::Frame(_) => anyhow::bail!("expected hello frame"),
            BusRead::TimedOut | BusRead::Closed => {
                anyhow::bail!("probe socket closed before hello")
            }
        }
    }

    fn try_parse(&mut self) -> anyhow::Result<Option<BusFrame>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_ne_bytes(self.buffer[..4].try_into().expect("4 bytes")) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame length {len} exceeds limit");
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let frame = BusFrame::decode(&self.buffer[4..4 + len])?;
        self.buffer.drain(..4 + len);
        Ok(Some(frame))
    }

    /// Read the next frame, optionally under a read deadline so shutdown
    /// can be observed.
    pub fn read(&mut self, timeout: Option<Duration>) -> anyhow::Result<BusRead> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(BusRead::Frame(frame));
            }
            self.stream
                .set_read_timeout(timeout)
                .context("set read deadline")?;
            let mut chunk = [0u8; 16 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(BusRead::Closed),
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(BusRead::TimedOut)
                }
                Err(err) => return Err(err).context("read probe socket"),
            }
        }
    }

    pub fn attach(&mut self, markers: Vec<String>) -> anyhow::Result<()> {
        self.stream
            .write_all(&BusFrame::Attach { markers }.encode())
            .context("write attach frame")
    }

    pub fn detach(&mut self, markers: Vec<String>) -> anyhow::Result<()> {
        self.stream
            .write_all(&BusFrame::Detach { markers }.encode())
            .context("write detach frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frames = vec![
            BusFrame::Hello {
                server_pid: 1234,
                markers: vec!["ExecSeqScan_begin".to_string(), "x".to_string()],
            },
            BusFrame::Marker {
                backend_pid: 7,
                marker_id: 3,
                args: vec![1, u64::MAX, 42],
                payload: Some(vec![9, 8, 7]),
            },
            BusFrame::Marker {
                backend_pid: 7,
                marker_id: 3,
                args: vec![],
                payload: None,
            },
            BusFrame::Attach {
                markers: vec!["a".to_string()],
            },
            BusFrame::Detach {
                markers: vec!["a".to_string()],
            },
        ];
        for frame in frames {
            let encoded = frame.encode();
            let decoded = BusFrame::decode(&encoded[4..]).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut data = ((MAX_FRAME_LEN as u32) + 1).to_ne_bytes().to_vec();
        data.extend_from_slice(&[0u8; 8]);
        let mut stream: &[u8] = &data;
        assert!(read_frame(&mut stream).is_err());
    }

    #[test]
    fn eof_reads_as_none() {
        let mut stream: &[u8] = &[];
        assert!(read_frame(&mut stream).unwrap().is_none());
    }

    #[test]
    fn session_attach_replays_existing_backends() {
        let server = crate::ServerShared::new(1, 4321);
        let backends = Arc::new(BackendDirectory::default());
        backends.register(BackendInfo {
            pid: 11,
            socket_fd: 5,
            background: false,
        });
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), 4321);
        let listener =
            ProbeBusListener::start(Arc::clone(&server), Arc::clone(&backends), path.clone())
                .unwrap();

        let (mut client, server_pid, markers) = ProbeBusClient::connect(&path).unwrap();
        assert_eq!(server_pid, 4321);
        assert!(markers.contains(&"postmaster_fork_backend".to_string()));
        client
            .attach(vec!["postmaster_fork_backend".to_string()])
            .unwrap();

        match client.read(Some(Duration::from_secs(5))).unwrap() {
            BusRead::Frame(BusFrame::Marker { args, .. }) => assert_eq!(args, vec![11, 5]),
            other => panic!("unexpected read {other:?}"),
        }
        drop(client);
        listener.shutdown();
    }
}
