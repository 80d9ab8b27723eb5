use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Dashboard session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the dashboard API
    #[arg(
        short = 'u',
        long,
        env = "DASHBOARD_API_URL",
        default_value = "http://localhost:8000"
    )]
    pub api_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// The refresh cookie lives in this process's cookie jar only, so every
/// command starts signed out and signs out again before exiting.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Interactive prompt: sign in, issue requests and sign out in one process
    Shell,

    /// Sign in and print the session
    Login {
        #[arg(short, long, env = "DASHBOARD_EMAIL")]
        email: String,

        /// Prompted for when omitted
        #[arg(short, long, env = "DASHBOARD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Sign in, then issue an authenticated GET and print the body
    Get {
        /// API path, e.g. /calls
        path: String,

        #[arg(short, long, env = "DASHBOARD_EMAIL")]
        email: String,

        #[arg(short, long, env = "DASHBOARD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

}

/// One line typed at the interactive prompt
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Login { email: String },
    Get { path: String },
    Whoami,
    /// Reload the profile of the current session
    Profile,
    /// Renew from the refresh cookie and reload the session
    Restore,
    Logout,
    Help,
    Quit,
}

impl ShellCommand {
    pub const HELP: &'static str =
        "login <email> | get <path> | whoami | profile | restore | logout | help | quit";

    /// Parse a prompt line; `Ok(None)` for a blank one
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        if words.next().is_some() {
            anyhow::bail!("Too many arguments: {}", line.trim());
        }

        let command = match (verb, arg) {
            ("login", Some(email)) => ShellCommand::Login {
                email: email.to_string(),
            },
            ("get", Some(path)) => ShellCommand::Get {
                path: path.to_string(),
            },
            ("whoami", None) => ShellCommand::Whoami,
            ("profile", None) => ShellCommand::Profile,
            ("restore", None) => ShellCommand::Restore,
            ("logout", None) => ShellCommand::Logout,
            ("help", None) => ShellCommand::Help,
            ("quit" | "exit", None) => ShellCommand::Quit,
            _ => anyhow::bail!("Unknown command: {} (try: {})", line.trim(), Self::HELP),
        };
        Ok(Some(command))
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_url: String,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Profile fetch retries on 429
    pub profile_max_retries: u32,
    pub profile_retry_base_ms: u64,
    pub profile_retry_max_ms: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    pub command: Command,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Self::from_args(CliArgs::parse()))
    }

    /// Build config from parsed arguments, reading env-only settings
    pub fn from_args(args: CliArgs) -> Self {
        Config {
            api_url: args.api_url.trim_end_matches('/').to_string(),

            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,

            profile_max_retries: env_or("PROFILE_MAX_RETRIES", 3),
            profile_retry_base_ms: env_or("PROFILE_RETRY_BASE_MS", 2000),
            profile_retry_max_ms: env_or("PROFILE_RETRY_MAX_MS", 10_000),

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),

            command: args.command.unwrap_or(Command::Shell),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            anyhow::bail!(
                "DASHBOARD_API_URL must start with http:// or https://: {}",
                self.api_url
            );
        }

        if self.http_connect_timeout == 0 || self.http_request_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        if self.profile_retry_base_ms == 0 {
            anyhow::bail!("PROFILE_RETRY_BASE_MS must be greater than zero");
        }

        if self.profile_retry_max_ms < self.profile_retry_base_ms {
            anyhow::bail!(
                "PROFILE_RETRY_MAX_MS ({}) must not be below PROFILE_RETRY_BASE_MS ({})",
                self.profile_retry_max_ms,
                self.profile_retry_base_ms
            );
        }

        Ok(())
    }

    /// Backoff used when the profile fetch is rate limited
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.profile_max_retries,
            base_delay: Duration::from_millis(self.profile_retry_base_ms),
            max_delay: Duration::from_millis(self.profile_retry_max_ms),
        }
    }
}

/// Read a numeric env var, falling back to `default` when unset or invalid
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

// === Interactive prompts ===

/// Ask for the password on the terminal
pub fn prompt_password(email: &str) -> Result<String> {
    let password: String = Password::new()
        .with_prompt(format!("Password for {}", email))
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok(password)
}

/// Read one line at the interactive prompt
pub fn prompt_shell_line() -> Result<String> {
    Input::new()
        .with_prompt("dashboard")
        .allow_empty(true)
        .interact_text()
        .context("Failed to read command")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(argv: &[&str]) -> Config {
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("JSON"), LogFormat::Json);
        assert_eq!(parse_log_format("text"), LogFormat::Text);
        assert_eq!(parse_log_format("invalid"), LogFormat::Text);
        assert_eq!(parse_log_format(""), LogFormat::Text);
    }

    #[test]
    fn test_default_command_is_shell() {
        let config = config_from(&["dashboard-session", "--api-url", "https://ops.example.com/"]);
        assert_eq!(config.command, Command::Shell);
        assert_eq!(config.api_url, "https://ops.example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_login_command() {
        let config = config_from(&[
            "dashboard-session",
            "login",
            "--email",
            "doc@practice.com",
            "--password",
            "pw",
        ]);
        assert_eq!(
            config.command,
            Command::Login {
                email: "doc@practice.com".to_string(),
                password: Some("pw".to_string()),
            }
        );
    }

    #[test]
    fn test_get_command() {
        let config = config_from(&["dashboard-session", "get", "/calls", "-e", "a@b.c"]);
        assert_eq!(
            config.command,
            Command::Get {
                path: "/calls".to_string(),
                email: "a@b.c".to_string(),
                password: None,
            }
        );
    }

    #[test]
    fn test_parse_shell_line() {
        assert_eq!(ShellCommand::parse("").unwrap(), None);
        assert_eq!(ShellCommand::parse("   ").unwrap(), None);
        assert_eq!(
            ShellCommand::parse("login doc@practice.com").unwrap(),
            Some(ShellCommand::Login {
                email: "doc@practice.com".to_string()
            })
        );
        assert_eq!(
            ShellCommand::parse("  get /calls?limit=5 ").unwrap(),
            Some(ShellCommand::Get {
                path: "/calls?limit=5".to_string()
            })
        );
        assert_eq!(ShellCommand::parse("whoami").unwrap(), Some(ShellCommand::Whoami));
        assert_eq!(ShellCommand::parse("exit").unwrap(), Some(ShellCommand::Quit));

        assert!(ShellCommand::parse("get").is_err());
        assert!(ShellCommand::parse("logout now").is_err());
        assert!(ShellCommand::parse("get /a /b").is_err());
        assert!(ShellCommand::parse("delete /calls").is_err());
    }

    #[test]
    fn test_default_retry_policy() {
        let config = config_from(&["dashboard-session"]);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = config_from(&["dashboard-session", "--api-url", "localhost:8000"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = config_from(&["dashboard-session"]);
        config.profile_retry_base_ms = 5000;
        config.profile_retry_max_ms = 1000;
        assert!(config.validate().is_err());

        config.profile_retry_base_ms = 0;
        assert!(config.validate().is_err());
    }
}
