use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use gesture_contracts::events::EventWriter;
use gesture_contracts::generation::{
    decode_event, Applied, DecodedEvent, GenerationRequest, GenerationState, GenerationStatus,
    GenerationView, ProgressEvent, ProgressReconciler, STREAM_STALLED_MESSAGE,
};
use reqwest::Url;
use serde_json::{json, Map, Value};

use crate::config::ClientConfig;
use crate::sse::{SseDecoder, SseEvent};
use crate::transport::{is_idle_read_error, HttpTransport, StreamReader, StreamTransport};

const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StreamInputs {
    prompt: Option<String>,
    trigger: bool,
}

/// Owns at most one generation event stream and the state reconciled from it.
///
/// Every input change runs the same procedure: close the current stream
/// (synchronously, dropping its channel so nothing it already queued can be
/// applied), then open a new one if the prompt is non-empty and the trigger
/// is set. Stream events are applied on the caller's thread by
/// [`GenerationStreamClient::pump`] or
/// [`GenerationStreamClient::wait_for_update`].
pub struct GenerationStreamClient {
    config: ClientConfig,
    transport: Arc<dyn StreamTransport>,
    events: EventWriter,
    reconciler: ProgressReconciler,
    inputs: StreamInputs,
    connection: Option<StreamConnection>,
}

impl GenerationStreamClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn StreamTransport>,
        events: EventWriter,
    ) -> Self {
        let reconciler = ProgressReconciler::new(config.default_total_steps);
        Self {
            config,
            transport,
            events,
            reconciler,
            inputs: StreamInputs::default(),
            connection: None,
        }
    }

    pub fn with_http(config: ClientConfig, events: EventWriter) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(config, Arc::new(transport), events))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> &GenerationState {
        self.reconciler.state()
    }

    pub fn view(&self) -> GenerationView {
        self.reconciler.state().view()
    }

    pub fn progress_fraction(&self) -> f64 {
        self.reconciler.state().progress_fraction()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn active_request(&self) -> Option<&GenerationRequest> {
        self.connection.as_ref().map(|connection| &connection.request)
    }

    /// Reactive entry point: a no-op when nothing changed.
    pub fn set_inputs(&mut self, prompt: Option<&str>, trigger: bool) {
        let next = StreamInputs {
            prompt: prompt
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            trigger,
        };
        if next == self.inputs {
            return;
        }
        self.inputs = next;
        self.restart();
    }

    pub fn set_default_total_steps(&mut self, total_steps: u64) {
        let total_steps = total_steps.max(1);
        if total_steps == self.reconciler.default_total_steps() {
            return;
        }
        self.reconciler.set_default_total_steps(total_steps);
        self.config.default_total_steps = total_steps;
        self.restart();
    }

    /// Supersede-then-restart with the current inputs.
    pub fn restart(&mut self) {
        self.cancel_current();
        self.maybe_start();
    }

    /// Closes the live stream, if any. Safe to call repeatedly.
    ///
    /// A request still loading falls back to `Idle`; a finished one keeps its
    /// final state for display.
    pub fn cancel_current(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let request_id = connection.request.request_id().to_string();
        tracing::info!(request_id = %request_id, "closing generation stream");
        connection.close();
        if self.reconciler.status() == GenerationStatus::Loading {
            self.reconciler.reset();
        }
        self.emit(
            "stream_closed",
            json!({
                "request_id": request_id,
                "status": self.reconciler.status().as_str(),
            }),
        );
    }

    /// Opens a stream for the current inputs when eligible and none is live.
    pub fn maybe_start(&mut self) -> bool {
        if self.connection.is_some() || !self.inputs.trigger {
            return false;
        }
        let Some(prompt) = self.inputs.prompt.clone() else {
            return false;
        };

        let request = GenerationRequest::new(prompt);
        self.reconciler.begin(&request);

        let url = match self.config.stream_url(request.prompt()) {
            Ok(url) => url,
            Err(err) => {
                self.fail_start(&request, format!("Initialization failed: {err:#}"));
                return false;
            }
        };

        let (sender, receiver) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker = StreamWorker {
            transport: Arc::clone(&self.transport),
            url: url.clone(),
            request_id: request.request_id().to_string(),
            sender,
            stop_flag: Arc::clone(&stop_flag),
            idle_timeout: self.config.idle_timeout,
        };
        let handle = match thread::Builder::new()
            .name("generation-stream".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                self.fail_start(&request, format!("Initialization failed: {err}"));
                return false;
            }
        };

        tracing::info!(
            request_id = request.request_id(),
            %url,
            transport = self.transport.name(),
            "opening generation stream"
        );
        self.emit(
            "stream_opened",
            json!({
                "request_id": request.request_id(),
                "prompt": request.prompt(),
                "url": url.to_string(),
                "transport": self.transport.name(),
            }),
        );
        self.connection = Some(StreamConnection {
            request,
            receiver,
            stop_flag,
            handle: Some(handle),
        });
        true
    }

    /// Applies every event already queued by the stream worker.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let Some(connection) = self.connection.as_ref() else {
                break;
            };
            match connection.receiver.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.worker_vanished();
                    break;
                }
            }
            applied += 1;
        }
        applied
    }

    /// Blocks up to `timeout` for the next event and applies only that one.
    pub fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let Some(connection) = self.connection.as_ref() else {
            return false;
        };
        match connection.receiver.recv_timeout(timeout) {
            Ok(event) => self.handle_event(event),
            Err(mpsc::RecvTimeoutError::Timeout) => return false,
            Err(mpsc::RecvTimeoutError::Disconnected) => self.worker_vanished(),
        }
        true
    }

    /// The worker hung up without a final event.
    fn worker_vanished(&mut self) {
        self.handle_event(ProgressEvent::connection_failed());
        self.cancel_current();
    }

    fn handle_event(&mut self, event: ProgressEvent) {
        let kind = event.kind();
        let request_id = self
            .connection
            .as_ref()
            .map(|connection| connection.request.request_id().to_string())
            .unwrap_or_default();

        match self.reconciler.apply(event) {
            Applied::Updated => {
                let state = self.reconciler.state();
                tracing::debug!(
                    request_id = %request_id,
                    step = state.current_step,
                    total_steps = state.total_steps,
                    "generation progress"
                );
                self.emit(
                    "stream_step",
                    json!({
                        "request_id": request_id,
                        "step": state.current_step,
                        "total_steps": state.total_steps,
                        "has_image": state.image.is_some(),
                    }),
                );
            }
            Applied::Ignored => {
                tracing::debug!(request_id = %request_id, kind, "stream event had no effect");
            }
            Applied::Terminal => {
                let state = self.reconciler.state();
                if state.status == GenerationStatus::Complete {
                    tracing::info!(
                        request_id = %request_id,
                        total_steps = state.total_steps,
                        "generation complete"
                    );
                    self.emit(
                        "stream_completed",
                        json!({
                            "request_id": request_id,
                            "total_steps": state.total_steps,
                            "has_image": state.image.is_some(),
                            "image_url": state.image_url,
                        }),
                    );
                } else {
                    let error = state.error.clone().unwrap_or_default();
                    tracing::error!(request_id = %request_id, kind, error = %error, "generation failed");
                    self.emit(
                        "stream_failed",
                        json!({
                            "request_id": request_id,
                            "error": error,
                            "cause": kind,
                        }),
                    );
                }
                self.cancel_current();
            }
        }
    }

    fn fail_start(&mut self, request: &GenerationRequest, message: String) {
        tracing::error!(request_id = request.request_id(), error = %message, "generation stream not started");
        self.reconciler.fail(message.clone());
        self.emit(
            "stream_failed",
            json!({
                "request_id": request.request_id(),
                "error": message,
                "cause": "initialization",
            }),
        );
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Err(err) = self.events.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "failed to record stream event");
        }
    }
}

impl Drop for GenerationStreamClient {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

struct StreamConnection {
    request: GenerationRequest,
    receiver: mpsc::Receiver<ProgressEvent>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamConnection {
    /// Stops the worker and waits for it, so the response (and its socket) is
    /// dropped before this returns. A blocked read gives up within one read
    /// tick of the transport.
    fn close(self) {
        let StreamConnection {
            receiver,
            stop_flag,
            handle,
            ..
        } = self;
        stop_flag.store(true, Ordering::SeqCst);
        drop(receiver);

        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("generation stream worker panicked");
            }
        }
    }
}

struct StreamWorker {
    transport: Arc<dyn StreamTransport>,
    url: Url,
    request_id: String,
    sender: mpsc::Sender<ProgressEvent>,
    stop_flag: Arc<AtomicBool>,
    idle_timeout: Option<Duration>,
}

impl StreamWorker {
    fn run(self) {
        if self.stopped() {
            return;
        }
        match self.transport.open(&self.url) {
            Ok(reader) => self.read_stream(reader),
            Err(err) => {
                tracing::error!(
                    request_id = %self.request_id,
                    error = %err,
                    "generation stream connection failed"
                );
                self.deliver(ProgressEvent::connection_failed());
            }
        }
    }

    fn read_stream(&self, mut reader: StreamReader) {
        let mut decoder = SseDecoder::new();
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        let mut last_bytes_at = Instant::now();

        while !self.stopped() {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    decoder.finish();
                    tracing::debug!(request_id = %self.request_id, "generation server closed the stream");
                    self.deliver(ProgressEvent::EndOfStream);
                    return;
                }
                Ok(read) => {
                    last_bytes_at = Instant::now();
                    for event in decoder.push(&chunk[..read]) {
                        if !self.dispatch(event) {
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_idle_read_error(&err) => {
                    if let Some(limit) = self.idle_timeout {
                        if last_bytes_at.elapsed() >= limit {
                            tracing::warn!(
                                request_id = %self.request_id,
                                idle_ms = limit.as_millis() as u64,
                                "generation stream stalled"
                            );
                            self.deliver(ProgressEvent::TransportError {
                                message: STREAM_STALLED_MESSAGE.to_string(),
                            });
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        request_id = %self.request_id,
                        error = %err,
                        "generation stream read failed"
                    );
                    self.deliver(ProgressEvent::connection_failed());
                    return;
                }
            }
        }
    }

    /// Returns false once the stream should stop being read.
    fn dispatch(&self, event: SseEvent) -> bool {
        match decode_event(&event.event, &event.data) {
            Ok(DecodedEvent::Progress(progress)) => {
                let final_event = matches!(
                    progress,
                    ProgressEvent::Complete { .. } | ProgressEvent::ServerError { .. }
                );
                self.deliver(progress) && !final_event
            }
            Ok(DecodedEvent::Message(value)) => {
                tracing::debug!(request_id = %self.request_id, message = %value, "received stream message");
                true
            }
            Ok(DecodedEvent::Ignored { event }) => {
                tracing::debug!(request_id = %self.request_id, event = %event, "ignoring unrecognized stream event");
                true
            }
            Err(err) => {
                tracing::warn!(request_id = %self.request_id, error = %err, "dropping malformed stream payload");
                true
            }
        }
    }

    fn deliver(&self, event: ProgressEvent) -> bool {
        if self.stopped() {
            return false;
        }
        self.sender.send(event).is_ok()
    }

    fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}
