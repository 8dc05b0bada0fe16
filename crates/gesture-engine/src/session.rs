use std::time::Duration;

use gesture_contracts::events::EventWriter;
use gesture_contracts::generation::{GenerationState, GenerationView};
use gesture_contracts::prompts::PromptMap;
use serde_json::{json, Map, Value};

use crate::client::GenerationStreamClient;

/// What a recognized gesture led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GestureOutcome {
    /// Detection was off or a generation is still running.
    Ignored,
    Unmapped { gesture: String },
    Started { prompt: String },
}

/// Drives one detect, map, generate cycle on top of a stream client.
///
/// A recognized gesture ends detection. Mapped gestures set the client's
/// prompt and trigger; the trigger is released again once the generation
/// reaches a terminal state, leaving its final state on display.
pub struct GestureSession {
    prompts: PromptMap,
    client: GenerationStreamClient,
    events: EventWriter,
    detecting: bool,
    generating: bool,
    result: Option<String>,
    prompt: Option<String>,
}

impl GestureSession {
    pub fn new(prompts: PromptMap, client: GenerationStreamClient, events: EventWriter) -> Self {
        Self {
            prompts,
            client,
            events,
            detecting: false,
            generating: false,
            result: None,
            prompt: None,
        }
    }

    pub fn prompts(&self) -> &PromptMap {
        &self.prompts
    }

    pub fn client(&self) -> &GenerationStreamClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut GenerationStreamClient {
        &mut self.client
    }

    pub fn is_detecting(&self) -> bool {
        self.detecting
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    /// Last user-facing detection message, e.g. `Detected: Victory`.
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn state(&self) -> &GenerationState {
        self.client.state()
    }

    pub fn view(&self) -> GenerationView {
        self.client.view()
    }

    /// Arms detection. Refused while a generation is running.
    pub fn start_detection(&mut self) -> bool {
        if self.generating {
            return false;
        }
        self.detecting = true;
        self.result = None;
        true
    }

    pub fn stop_detection(&mut self) {
        self.detecting = false;
    }

    pub fn on_gesture(&mut self, label: &str) -> GestureOutcome {
        let label = label.trim();
        if !self.detecting || self.generating || label.is_empty() {
            tracing::debug!(gesture = label, "gesture ignored");
            return GestureOutcome::Ignored;
        }
        self.detecting = false;
        self.result = Some(format!("Detected: {label}"));

        let prompt = match self.prompts.prompt_for(label) {
            Ok(prompt) => prompt.to_string(),
            Err(err) => {
                tracing::warn!(gesture = label, "{err}");
                self.result = Some(err.to_string());
                self.emit("gesture_unmapped", json!({ "gesture": label }));
                return GestureOutcome::Unmapped {
                    gesture: label.to_string(),
                };
            }
        };

        tracing::info!(gesture = label, prompt = %prompt, "gesture mapped to prompt");
        self.emit(
            "gesture_detected",
            json!({ "gesture": label, "prompt": prompt }),
        );
        self.generating = true;
        self.prompt = Some(prompt.clone());
        self.client.set_inputs(Some(&prompt), true);
        GestureOutcome::Started { prompt }
    }

    /// Applies queued stream events and releases the trigger once done.
    pub fn pump(&mut self) -> usize {
        let applied = self.client.pump();
        self.release_if_finished();
        applied
    }

    pub fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let updated = self.client.wait_for_update(timeout);
        self.release_if_finished();
        updated
    }

    fn release_if_finished(&mut self) {
        if !self.generating || self.client.is_connected() {
            return;
        }
        self.generating = false;
        let prompt = self.prompt.clone();
        self.client.set_inputs(prompt.as_deref(), false);
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Err(err) = self.events.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "failed to record gesture event");
        }
    }
}
