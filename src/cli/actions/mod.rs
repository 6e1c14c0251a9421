pub mod run;

use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run {
        backend_url: String,
        api_key: SecretString,
        state_dir: PathBuf,
        reset_target: String,
    },
}
