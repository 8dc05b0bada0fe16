mod registry;

pub use registry::{ConfigurationError, PromptMap};
