use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Idle,
    Loading,
    Complete,
    Failed,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Reconciled generation progress. Only the reconciler mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub current_step: u64,
    pub total_steps: u64,
    pub image: Option<Vec<u8>>,
    pub image_url: Option<String>,
    pub error: Option<String>,
    pub request_id: Option<String>,
}

impl GenerationState {
    pub fn idle(total_steps: u64) -> Self {
        Self {
            status: GenerationStatus::Idle,
            current_step: 0,
            total_steps: total_steps.max(1),
            image: None,
            image_url: None,
            error: None,
            request_id: None,
        }
    }

    /// Fraction in `[0, 1]` while loading; zero in every other status.
    pub fn progress_fraction(&self) -> f64 {
        if self.status != GenerationStatus::Loading || self.total_steps == 0 {
            return 0.0;
        }
        (self.current_step as f64 / self.total_steps as f64).min(1.0)
    }

    pub fn view(&self) -> GenerationView {
        GenerationView {
            status: self.status,
            is_loading: self.status == GenerationStatus::Loading,
            current_step: self.current_step,
            total_steps: self.total_steps,
            progress: self.progress_fraction(),
            current_image: self.image.as_deref().map(image_data_uri),
            image_url: self.image_url.clone(),
            error: self.error.clone(),
        }
    }
}

/// Read-only snapshot handed to presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationView {
    pub status: GenerationStatus,
    pub is_loading: bool,
    pub current_step: u64,
    pub total_steps: u64,
    pub progress: f64,
    pub current_image: Option<String>,
    pub image_url: Option<String>,
    pub error: Option<String>,
}

/// `data:` URI for raw image bytes; unknown formats are labelled PNG.
pub fn image_data_uri(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/png");
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}
