//! Shared runtime arguments handed to the composition root.

use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Clone)]
pub struct GlobalArgs {
    pub backend_url: String,
    pub api_key: SecretString,
    pub state_dir: PathBuf,
    pub reset_target: String,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(
        backend_url: String,
        api_key: SecretString,
        state_dir: PathBuf,
        reset_target: String,
    ) -> Self {
        Self {
            backend_url,
            api_key,
            state_dir,
            reset_target,
        }
    }
}

impl std::fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArgs")
            .field("backend_url", &self.backend_url)
            .field("api_key", &"***")
            .field("state_dir", &self.state_dir)
            .field("reset_target", &self.reset_target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_the_api_key() {
        let args = GlobalArgs::new(
            "https://backend.example".to_string(),
            SecretString::from("anon-key".to_string()),
            PathBuf::from(".pumpguard"),
            "https://app.example/reset".to_string(),
        );
        let rendered = format!("{args:?}");
        assert!(rendered.contains("backend.example"));
        assert!(!rendered.contains("anon-key"));
    }
}
