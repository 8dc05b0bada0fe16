use super::progress::{ProgressEvent, CONNECTION_FAILED_MESSAGE};
use super::request::GenerationRequest;
use super::state::{GenerationState, GenerationStatus};

/// Step count assumed until the server reports its own.
pub const DEFAULT_TOTAL_STEPS: u64 = 15;

/// What applying one event did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State changed; the stream stays open.
    Updated,
    /// Event had no effect (not loading, or stale).
    Ignored,
    /// State reached `Complete` or `Failed`; the stream must be closed.
    Terminal,
}

/// Folds stream events into [`GenerationState`].
///
/// The state machine is `Idle -> Loading -> {Complete, Failed}`. Only
/// [`ProgressReconciler::begin`] and [`ProgressReconciler::reset`] leave a
/// terminal state, and a cancelled `Loading` request is reset to `Idle`.
/// While loading, `current_step` never decreases and the displayed image is
/// never swapped for one from an older step.
#[derive(Debug, Clone)]
pub struct ProgressReconciler {
    state: GenerationState,
    default_total_steps: u64,
    image_step: Option<u64>,
}

impl Default for ProgressReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_STEPS)
    }
}

impl ProgressReconciler {
    pub fn new(default_total_steps: u64) -> Self {
        let default_total_steps = default_total_steps.max(1);
        Self {
            state: GenerationState::idle(default_total_steps),
            default_total_steps,
            image_step: None,
        }
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn status(&self) -> GenerationStatus {
        self.state.status
    }

    pub fn default_total_steps(&self) -> u64 {
        self.default_total_steps
    }

    /// Takes effect at the next `begin` or `reset`.
    pub fn set_default_total_steps(&mut self, total_steps: u64) {
        self.default_total_steps = total_steps.max(1);
    }

    /// Drops the current request. Used when a loading stream is cancelled,
    /// which is the one edge from `Loading` back to `Idle`.
    pub fn reset(&mut self) {
        self.state = GenerationState::idle(self.default_total_steps);
        self.image_step = None;
    }

    pub fn begin(&mut self, request: &GenerationRequest) {
        self.reset();
        self.state.status = GenerationStatus::Loading;
        self.state.request_id = Some(request.request_id().to_string());
    }

    /// Marks a request that never got a connection as failed.
    pub fn fail(&mut self, message: impl Into<String>) -> Applied {
        if self.state.status != GenerationStatus::Loading {
            return Applied::Ignored;
        }
        self.state.error = Some(message.into());
        self.state.status = GenerationStatus::Failed;
        Applied::Terminal
    }

    pub fn apply(&mut self, event: ProgressEvent) -> Applied {
        if self.state.status != GenerationStatus::Loading {
            return Applied::Ignored;
        }

        match event {
            ProgressEvent::Step {
                step,
                total_steps,
                image,
            } => self.apply_step(step, total_steps, image),
            ProgressEvent::Complete { image, image_url } => {
                if let Some(image) = image {
                    self.state.image = Some(image);
                }
                if image_url.is_some() {
                    self.state.image_url = image_url;
                }
                self.complete()
            }
            ProgressEvent::ServerError { message } => {
                self.fail(format!("Generation failed: {message}"))
            }
            ProgressEvent::TransportError { message } => self.fail(message),
            ProgressEvent::EndOfStream => {
                if self.state.current_step >= self.state.total_steps {
                    self.complete()
                } else {
                    self.fail(CONNECTION_FAILED_MESSAGE)
                }
            }
        }
    }

    fn apply_step(&mut self, step: u64, total_steps: Option<u64>, image: Option<Vec<u8>>) -> Applied {
        let mut changed = false;

        if let Some(total) = total_steps.filter(|total| *total > 0) {
            changed |= self.state.total_steps != total;
            self.state.total_steps = total;
        }
        if step > self.state.current_step {
            self.state.current_step = step;
            changed = true;
        }
        if let Some(image) = image {
            if self.image_step.map_or(true, |shown| step >= shown) {
                self.state.image = Some(image);
                self.image_step = Some(step);
                changed = true;
            }
        }

        if changed {
            Applied::Updated
        } else {
            Applied::Ignored
        }
    }

    fn complete(&mut self) -> Applied {
        self.state.current_step = self.state.total_steps;
        self.state.status = GenerationStatus::Complete;
        Applied::Terminal
    }
}
