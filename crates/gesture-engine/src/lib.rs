//! Streaming generation client: opens the server's progress stream for a
//! prompt, reconciles its events, and drives it from detected gestures.

mod client;
mod config;
mod session;
mod sse;
mod transport;

#[cfg(test)]
mod testing;

pub use client::GenerationStreamClient;
pub use config::{clamp_total_steps, idle_timeout_from_millis, ClientConfig, DEFAULT_BASE_URL};
pub use session::{GestureOutcome, GestureSession};
pub use sse::{SseDecoder, SseEvent};
pub use transport::{HttpTransport, StreamReader, StreamTransport, TransportError};
