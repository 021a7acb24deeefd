use std::{env, fs, path::PathBuf, time::Duration};

use clap::Parser;

use crate::error::ServoError;

pub const RETRY_DELAY_ENV: &str = "SERVO_RETRY_DELAY_SEC";
pub const IO_TIMEOUT_ENV: &str = "OPTUNE_IO_TIMEOUT";
pub const VERBOSE_STDERR_ENV: &str = "OPTUNE_VERBOSE_STDERR";
pub const PERF_ENV: &str = "OPTUNE_PERF";

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(20);
const DEFAULT_TOKEN_PATH: &str = "/run/secrets/optune_auth_token";

/// Command-line surface of the agent.
#[derive(Debug, Parser)]
#[command(
    name = "servo",
    version,
    about = "Optimization agent that relays service commands to local driver programs"
)]
pub struct Opts {
    /// Application to optimize
    pub app_id: String,
    /// Prompt between commands instead of delaying, and ignore SLEEP commands
    #[arg(long)]
    pub interactive: bool,
    /// Fixed delay between commands, in seconds
    #[arg(long, value_name = "SECONDS")]
    pub delay: Option<u64>,
    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
    /// Agent name reported to the service
    #[arg(long, default_value = "servo")]
    pub agent: String,
    /// Optimization account
    #[arg(long, env = "OPTUNE_ACCOUNT")]
    pub account: Option<String>,
    /// Override the service endpoint URL
    #[arg(long)]
    pub url: Option<String>,
    /// Path to the bearer token file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub auth_token: PathBuf,
    /// Disable authentication
    #[arg(long)]
    pub no_auth: bool,
}

/// How much captured stderr is folded into a failed driver's message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum StderrVerbosity {
    #[default]
    All,
    Minimal,
    None,
}

impl StderrVerbosity {
    fn from_env(value: Option<&str>) -> Self {
        match value {
            Some("minimal") => StderrVerbosity::Minimal,
            Some("none") => StderrVerbosity::None,
            _ => StderrVerbosity::All,
        }
    }
}

/// Fully resolved agent configuration: CLI options plus environment knobs.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_id: String,
    pub url: String,
    pub agent: String,
    pub token: Option<String>,
    pub interactive: bool,
    pub delay: Option<Duration>,
    pub retry_delay: Duration,
    pub io_timeout: Option<Duration>,
    pub stderr_verbosity: StderrVerbosity,
    pub perf_expr: Option<String>,
    pub adjust_driver: PathBuf,
    pub measure_driver: PathBuf,
    pub environment_driver: PathBuf,
}

impl Config {
    pub fn resolve(opts: Opts) -> Result<Config, ServoError> {
        let url = match (opts.url, opts.account.as_deref()) {
            (Some(url), _) => url,
            (None, Some(account)) => format!(
                "https://api.opsani.com/accounts/{account}/applications/{}/servo",
                opts.app_id
            ),
            (None, None) => return Err(ServoError::MissingAccount),
        };

        let token = if opts.no_auth {
            None
        } else {
            let raw = fs::read_to_string(&opts.auth_token).map_err(|source| {
                ServoError::AuthToken { path: opts.auth_token.clone(), source }
            })?;
            Some(raw.trim().to_string())
        };

        Ok(Config {
            app_id: opts.app_id,
            url,
            agent: opts.agent,
            token,
            interactive: opts.interactive,
            delay: opts.delay.map(Duration::from_secs),
            retry_delay: env_secs(RETRY_DELAY_ENV).unwrap_or(DEFAULT_RETRY_DELAY),
            io_timeout: env_secs(IO_TIMEOUT_ENV),
            stderr_verbosity: StderrVerbosity::from_env(env::var(VERBOSE_STDERR_ENV).ok().as_deref()),
            perf_expr: env::var(PERF_ENV).ok(),
            adjust_driver: PathBuf::from("./adjust"),
            measure_driver: PathBuf::from("./measure"),
            environment_driver: PathBuf::from("./environment"),
        })
    }
}

/// Reads an env var holding whole seconds. Unset, unparsable, or zero all
/// mean "not configured".
fn env_secs(name: &str) -> Option<Duration> {
    let seconds = env::var(name).ok()?.trim().parse::<u64>().ok()?;
    (seconds > 0).then(|| Duration::from_secs(seconds))
}
