mod progress;
mod reconciler;
mod request;
mod state;
mod wire;

pub use progress::{ProgressEvent, CONNECTION_FAILED_MESSAGE, STREAM_STALLED_MESSAGE};
pub use reconciler::{Applied, ProgressReconciler, DEFAULT_TOTAL_STEPS};
pub use request::GenerationRequest;
pub use state::{image_data_uri, GenerationState, GenerationStatus, GenerationView};
pub use wire::{decode_event, CompletePayload, DecodedEvent, ErrorPayload, ParseError, StepPayload};
