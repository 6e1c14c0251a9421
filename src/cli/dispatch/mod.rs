use crate::cli::actions::Action;
use anyhow::Result;
use secrecy::SecretString;
use std::path::PathBuf;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Run {
        backend_url: matches
            .get_one("backend-url")
            .map(|s: &String| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --backend-url"))?,
        api_key: matches
            .get_one("api-key")
            .map(|s: &String| SecretString::from(s.to_string()))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --api-key"))?,
        state_dir: matches
            .get_one("state-dir")
            .map(|s: &String| PathBuf::from(s))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --state-dir"))?,
        reset_target: matches
            .get_one("reset-target")
            .map(|s: &String| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --reset-target"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn builds_the_run_action() -> Result<()> {
        let matches = commands::new().try_get_matches_from([
            "pumpguard",
            "--backend-url",
            "https://backend.example",
            "--api-key",
            "anon-key",
            "--state-dir",
            "/tmp/pumpguard-state",
        ])?;

        let Action::Run {
            backend_url,
            api_key,
            state_dir,
            reset_target,
        } = handler(&matches)?;

        assert_eq!(backend_url, "https://backend.example");
        assert_eq!(api_key.expose_secret(), "anon-key");
        assert_eq!(state_dir, PathBuf::from("/tmp/pumpguard-state"));
        assert_eq!(reset_target, "https://app.pumpguard.com/reset-password");
        Ok(())
    }
}
