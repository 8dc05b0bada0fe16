//! Scripted transports and a loopback SSE server for stream tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::Url;

use crate::transport::{StreamReader, StreamTransport, TransportError};

/// Stand-in for the HTTP transport's read tick.
const SCRIPTED_READ_TICK: Duration = Duration::from_millis(20);
const PEER_CLOSE_WAIT: Duration = Duration::from_secs(2);

pub(crate) enum Chunk {
    Bytes(Vec<u8>),
    Fail(io::ErrorKind),
}

pub(crate) enum Ending {
    Eof,
    /// Blocks for a full read tick and then times out, forever, like a
    /// silent server behind the HTTP transport.
    Hang,
}

pub(crate) struct Script {
    chunks: Vec<Chunk>,
    ending: Ending,
}

impl Script {
    pub(crate) fn new(ending: Ending) -> Self {
        Self {
            chunks: Vec::new(),
            ending,
        }
    }

    pub(crate) fn event(mut self, name: &str, data: &str) -> Self {
        self.chunks
            .push(Chunk::Bytes(format!("event: {name}\ndata: {data}\n\n").into_bytes()));
        self
    }

    pub(crate) fn raw(mut self, bytes: &[u8]) -> Self {
        self.chunks.push(Chunk::Bytes(bytes.to_vec()));
        self
    }

    pub(crate) fn fail(mut self, kind: io::ErrorKind) -> Self {
        self.chunks.push(Chunk::Fail(kind));
        self
    }
}

#[derive(Default)]
pub(crate) struct ConnectionLog {
    opened: Mutex<Vec<String>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    drained: AtomicUsize,
}

impl ConnectionLog {
    pub(crate) fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .map(|urls| urls.clone())
            .unwrap_or_default()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Readers that have handed out every scripted chunk.
    pub(crate) fn drained(&self) -> usize {
        self.drained.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    log: Arc<ConnectionLog>,
}

impl ScriptedTransport {
    pub(crate) fn new(scripts: Vec<Script>) -> (Arc<Self>, Arc<ConnectionLog>) {
        let log = Arc::new(ConnectionLog::default());
        let transport = Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            log: Arc::clone(&log),
        });
        (transport, log)
    }
}

impl StreamTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, url: &Url) -> Result<StreamReader, TransportError> {
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front());
        let Some(script) = script else {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no scripted stream left",
            )));
        };
        if let Ok(mut opened) = self.log.opened.lock() {
            opened.push(url.to_string());
        }
        let live = self.log.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedReader {
            chunks: script.chunks.into(),
            ending: script.ending,
            drained_reported: false,
            log: Arc::clone(&self.log),
        }))
    }
}

struct ScriptedReader {
    chunks: VecDeque<Chunk>,
    ending: Ending,
    drained_reported: bool,
    log: Arc<ConnectionLog>,
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chunks.pop_front() {
            Some(Chunk::Bytes(mut bytes)) => {
                let take = bytes.len().min(buf.len());
                buf[..take].copy_from_slice(&bytes[..take]);
                if take < bytes.len() {
                    self.chunks.push_front(Chunk::Bytes(bytes.split_off(take)));
                }
                Ok(take)
            }
            Some(Chunk::Fail(kind)) => Err(io::Error::from(kind)),
            None => {
                if !self.drained_reported {
                    self.drained_reported = true;
                    self.log.drained.fetch_add(1, Ordering::SeqCst);
                }
                match self.ending {
                    Ending::Eof => Ok(0),
                    Ending::Hang => {
                        thread::sleep(SCRIPTED_READ_TICK);
                        Err(io::Error::from(io::ErrorKind::TimedOut))
                    }
                }
            }
        }
    }
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        self.log.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0_u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(read) => head.extend_from_slice(&buf[..read]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn write_sse_response(stream: &mut TcpStream, body: &str) -> io::Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n",
    )?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

/// True once the client has closed its end: EOF or a reset.
fn peer_closed(stream: &mut TcpStream, wait: Duration) -> bool {
    if stream.set_read_timeout(Some(wait)).is_err() {
        return false;
    }
    let mut buf = [0_u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(err) => {
                return matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                )
            }
        }
    }
}

/// Serves one `text/event-stream` response and returns the request head.
pub(crate) fn serve_sse_once(body: String) -> io::Result<(String, thread::JoinHandle<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return String::new();
        };
        let head = read_request_head(&mut stream);
        let _ = write_sse_response(&mut stream, &body);
        head
    });
    Ok((base_url, handle))
}

#[derive(Debug, Default)]
pub(crate) struct HandoverReport {
    pub(crate) first_head: String,
    pub(crate) second_head: String,
    /// The first connection was closed by the client once the second
    /// request had arrived.
    pub(crate) first_closed: bool,
}

/// Serves two streams in turn. The first sends `first_body` and then goes
/// silent without closing; the second sends `second_body` and closes.
pub(crate) fn serve_stream_handover(
    first_body: String,
    second_body: String,
) -> io::Result<(String, thread::JoinHandle<HandoverReport>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let handle = thread::spawn(move || {
        let mut report = HandoverReport::default();
        let Ok((mut first, _)) = listener.accept() else {
            return report;
        };
        report.first_head = read_request_head(&mut first);
        if write_sse_response(&mut first, &first_body).is_err() {
            return report;
        }

        let Ok((mut second, _)) = listener.accept() else {
            return report;
        };
        report.second_head = read_request_head(&mut second);
        report.first_closed = peer_closed(&mut first, PEER_CLOSE_WAIT);
        let _ = write_sse_response(&mut second, &second_body);
        report
    });
    Ok((base_url, handle))
}
