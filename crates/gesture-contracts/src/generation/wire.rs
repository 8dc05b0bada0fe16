use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::progress::ProgressEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPayload {
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: Option<String>,
}

/// A payload that could not be turned into a [`ProgressEvent`].
///
/// Never surfaced to the user; the stream keeps going.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed `{event}` payload: {source}")]
    InvalidJson {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("undecodable image in `{event}` payload: {source}")]
    InvalidImage {
        event: String,
        #[source]
        source: base64::DecodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Progress(ProgressEvent),
    /// Generic unnamed `message` event; diagnostic only.
    Message(Value),
    /// A named event this client does not listen for.
    Ignored { event: String },
}

/// Maps one SSE dispatch (event name plus joined data lines) to a typed event.
pub fn decode_event(event: &str, data: &str) -> Result<DecodedEvent, ParseError> {
    match event {
        "step" => {
            let payload: StepPayload = parse_json(event, data)?;
            Ok(DecodedEvent::Progress(ProgressEvent::Step {
                step: payload.step,
                total_steps: payload.total_steps.filter(|total| *total > 0),
                image: decode_image(event, payload.image.as_deref())?,
            }))
        }
        "complete" => {
            let payload: CompletePayload = parse_json(event, data)?;
            Ok(DecodedEvent::Progress(ProgressEvent::Complete {
                image: decode_image(event, payload.image.as_deref())?,
                image_url: payload.image_url.filter(|url| !url.trim().is_empty()),
            }))
        }
        "error" => {
            let payload: ErrorPayload = parse_json(event, data)?;
            let message = payload
                .message
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| "unknown server error".to_string());
            Ok(DecodedEvent::Progress(ProgressEvent::ServerError { message }))
        }
        "" | "message" => Ok(DecodedEvent::Message(parse_json("message", data)?)),
        other => Ok(DecodedEvent::Ignored {
            event: other.to_string(),
        }),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(event: &str, data: &str) -> Result<T, ParseError> {
    serde_json::from_str(data).map_err(|source| ParseError::InvalidJson {
        event: event.to_string(),
        source,
    })
}

fn decode_image(event: &str, raw: Option<&str>) -> Result<Option<Vec<u8>>, ParseError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    BASE64
        .decode(raw)
        .map(Some)
        .map_err(|source| ParseError::InvalidImage {
            event: event.to_string(),
            source,
        })
}
