/// User-visible text for any connection-level failure.
pub const CONNECTION_FAILED_MESSAGE: &str = "Connection to server failed";
/// User-visible text when the idle timeout fires.
pub const STREAM_STALLED_MESSAGE: &str = "Generation stream stalled";

/// Typed notification pushed by the stream worker, applied in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Step {
        step: u64,
        total_steps: Option<u64>,
        image: Option<Vec<u8>>,
    },
    Complete {
        image: Option<Vec<u8>>,
        image_url: Option<String>,
    },
    /// Named `error` event sent by the generation server.
    ServerError { message: String },
    TransportError { message: String },
    /// The server closed the stream without a `complete` event.
    EndOfStream,
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Step { .. } => "step",
            Self::Complete { .. } => "complete",
            Self::ServerError { .. } => "server_error",
            Self::TransportError { .. } => "transport_error",
            Self::EndOfStream => "end_of_stream",
        }
    }

    pub fn connection_failed() -> Self {
        Self::TransportError {
            message: CONNECTION_FAILED_MESSAGE.to_string(),
        }
    }
}
