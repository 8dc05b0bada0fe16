use std::error::Error as StdError;
use std::io::{self, Read};

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Url;
use thiserror::Error;

use crate::config::ClientConfig;

pub type StreamReader = Box<dyn Read + Send>;

/// Failure to establish the event stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to reach generation server: {0}")]
    Request(#[from] reqwest::Error),
    #[error("generation server returned HTTP {status}")]
    Status { status: u16 },
    #[error("stream i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Opens the raw byte stream for one generation request.
///
/// Readers may return `WouldBlock`/`TimedOut` errors to signal "no bytes
/// yet"; the stream worker treats those as idle ticks, not failures.
pub trait StreamTransport: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self, url: &Url) -> std::result::Result<StreamReader, TransportError>;
}

/// Blocking reqwest transport.
///
/// Every socket wait is capped at `read_tick`, so a reader on a silent
/// stream returns a timeout error at that cadence and the worker can notice
/// it was stopped. Stall detection on top of that is the worker's job.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_tick)
            .user_agent(concat!("gesture-gen/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build generation http client")?;
        Ok(Self { client })
    }
}

impl StreamTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn open(&self, url: &Url) -> std::result::Result<StreamReader, TransportError> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.starts_with("text/event-stream") {
            tracing::warn!(
                %url,
                content_type = %content_type,
                "generation stream has unexpected content type"
            );
        }
        Ok(Box::new(response))
    }
}

/// True when a read failed only because no bytes arrived in time.
pub(crate) fn is_idle_read_error(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
        return true;
    }
    let mut cause: Option<&(dyn StdError + 'static)> = err
        .get_ref()
        .map(|inner| inner as &(dyn StdError + 'static));
    while let Some(current) = cause {
        if let Some(reqwest_err) = current.downcast_ref::<reqwest::Error>() {
            if reqwest_err.is_timeout() {
                return true;
            }
        }
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        cause = current.source();
    }
    false
}
