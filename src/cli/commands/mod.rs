use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("pumpguard")
        .about("Fuel station operations - session service")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("backend-url")
                .short('b')
                .long("backend-url")
                .help("Base URL of the backend, example: https://backend.pumpguard.com")
                .env("PUMPGUARD_BACKEND_URL")
                .required(true),
        )
        .arg(
            Arg::new("api-key")
                .short('k')
                .long("api-key")
                .help("Anonymous API key for the backend")
                .env("PUMPGUARD_API_KEY")
                .required(true),
        )
        .arg(
            Arg::new("state-dir")
                .short('s')
                .long("state-dir")
                .help("Directory for durable client state (rate limits, hints)")
                .env("PUMPGUARD_STATE_DIR")
                .default_value(".pumpguard"),
        )
        .arg(
            Arg::new("reset-target")
                .long("reset-target")
                .help("URL the password reset email sends the user back to")
                .env("PUMPGUARD_RESET_TARGET")
                .default_value("https://app.pumpguard.com/reset-password"),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("PUMPGUARD_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_args() {
        let matches = new().try_get_matches_from([
            "pumpguard",
            "--backend-url",
            "https://backend.example",
            "--api-key",
            "anon-key",
        ]);
        let matches = matches.expect("arguments should parse");
        assert_eq!(
            matches.get_one::<String>("backend-url").map(String::as_str),
            Some("https://backend.example")
        );
        assert_eq!(
            matches.get_one::<String>("state-dir").map(String::as_str),
            Some(".pumpguard")
        );
    }

    #[test]
    fn missing_backend_url_is_rejected() {
        temp_env::with_vars_unset(["PUMPGUARD_BACKEND_URL", "PUMPGUARD_API_KEY"], || {
            let result = new().try_get_matches_from(["pumpguard", "--api-key", "anon-key"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn env_vars_supply_arguments() {
        temp_env::with_vars(
            [
                ("PUMPGUARD_BACKEND_URL", Some("https://env.example")),
                ("PUMPGUARD_API_KEY", Some("env-key")),
            ],
            || {
                let matches = new()
                    .try_get_matches_from(["pumpguard"])
                    .expect("env should satisfy required args");
                assert_eq!(
                    matches.get_one::<String>("backend-url").map(String::as_str),
                    Some("https://env.example")
                );
            },
        );
    }

    #[test]
    fn verbosity_counts_occurrences() {
        let matches = new()
            .try_get_matches_from([
                "pumpguard",
                "--backend-url",
                "https://backend.example",
                "--api-key",
                "anon-key",
                "-vvv",
            ])
            .expect("arguments should parse");
        assert_eq!(matches.get_one::<u8>("verbosity").copied(), Some(3));
    }
}
