use uuid::Uuid;

/// One generation attempt. Superseded requests are dropped, never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    request_id: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            request_id: format!("gen-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}
