use std::env;
use std::path::PathBuf;

use crate::error::ConfigurationError;

pub const DEFAULT_OUTPUT_DIR: &str = "./output";

/// One snapshot of every credential and setting the pipeline needs, taken
/// from the process environment. Components receive credentials from this
/// struct explicitly; nothing else reads the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub google_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub freepik_api_key: Option<String>,
    pub replicate_api_token: Option<String>,
    pub stability_api_key: Option<String>,
    pub output_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            google_api_key: non_empty_env("GOOGLE_API_KEY"),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            freepik_api_key: non_empty_env("FREEPIK_API_KEY"),
            replicate_api_token: non_empty_env("REPLICATE_API_TOKEN"),
            stability_api_key: non_empty_env("STABILITY_API_KEY"),
            output_dir: non_empty_env("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
        }
    }

    /// The classifier cannot run without a Google API key.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.google_api_key.is_none() {
            return Err(ConfigurationError(
                "GOOGLE_API_KEY is required for query classification; \
                 set it in the environment or a .env file"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Image-generation services with credentials present, in registration
    /// order.
    pub fn available_services(&self) -> Vec<&'static str> {
        let candidates = [
            ("openai", self.openai_api_key.is_some()),
            ("freepik", self.freepik_api_key.is_some()),
            ("replicate", self.replicate_api_token.is_some()),
            ("stability", self.stability_api_key.is_some()),
        ];
        candidates
            .into_iter()
            .filter_map(|(name, configured)| configured.then_some(name))
            .collect()
    }

    pub fn count_available_services(&self) -> usize {
        self.available_services().len()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
