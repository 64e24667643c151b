//! Configuration for the referral engine and the `refgate` binary.
//!
//! Settings are layered: built-in defaults, then `refgate.toml` (or the file
//! named by `--config`), then `REFGATE_*` environment variables, then CLI
//! flags. Later layers win. [`EngineConfig::validate`] runs once at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::codec::InviteCodec;
use crate::gate::{RetryPolicy, SubscriptionChecker, SubscriptionGate};
use crate::model::UserId;
use crate::orchestrator::AttributionPolicy;

pub const CONFIG_FILE: &str = "refgate.toml";
pub const DEFAULT_DATABASE: &str = "refgate.db";

const MIN_SECRET_LEN: usize = 8;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Referral attribution engine: invite codes, gated confirmation, credits.
///
/// Configuration can be set in refgate.toml, via environment variables or
/// CLI arguments. CLI arguments take precedence over environment variables,
/// which take precedence over the config file.
#[derive(Parser, Debug)]
#[command(name = "refgate", version, about)]
pub struct Cli {
    /// Config file [default: ./refgate.toml when present]
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path [env: REFGATE_DB] [default: refgate.db]
    #[arg(long, short = 'd', global = true)]
    pub db: Option<PathBuf>,

    /// Channel a referee must subscribe to [env: REFGATE_CHANNEL_ID]
    #[arg(long, global = true)]
    pub channel_id: Option<String>,

    /// Seconds a pending referral may wait before it can expire [env: REFGATE_GRACE_SECS]
    #[arg(long, global = true)]
    pub grace_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a user's invite code
    Code { user: UserId },
    /// Decode an invite code back to a user id
    Decode { code: String },
    /// Record a join, optionally through an invite code
    Join { user: UserId, code: Option<String> },
    /// Record a subscription change reported by the platform
    Subscription {
        user: UserId,
        #[arg(action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
        subscribed: bool,
    },
    /// Re-check a user against their last recorded status
    Recheck { user: UserId },
    /// Show a user's subscription verdict without applying it
    Status {
        user: UserId,
        /// Skip the check cache
        #[arg(long)]
        force: bool,
    },
    /// List the referral edges a user created as referrer
    Referrals { user: UserId },
    /// Reject a user's pending referral
    Veto { user: UserId },
    Ban { user: UserId },
    Unban { user: UserId },
    /// Delete a user, their referral edge and check history
    Purge { user: UserId },
    /// Top referrers by credited referrals
    Top {
        #[arg(long, short = 'n', default_value_t = 10)]
        limit: usize,
    },
    Stats,
    /// Expire or confirm overdue pending referrals
    Sweep {
        /// Keep running every sweep interval until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Replay a JSON-lines event log
    Replay { file: PathBuf },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {e}"),
            ConfigError::Toml(e) => write!(f, "config error: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub database: PathBuf,
    pub channel_id: String,
    pub invite_secret: String,
    pub grace_period_secs: u64,
    pub allow_recovery: bool,
    pub verify_on_join: bool,
    pub reward_per_referral: u64,
    pub check_attempts: u32,
    pub check_backoff_ms: u64,
    pub check_max_backoff_ms: u64,
    pub check_cache_ttl_secs: u64,
    pub check_cache_capacity: usize,
    pub suspicious_window: usize,
    pub suspicious_flips: usize,
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            channel_id: String::new(),
            invite_secret: String::new(),
            grace_period_secs: 86_400,
            allow_recovery: true,
            verify_on_join: true,
            reward_per_referral: 1,
            check_attempts: 3,
            check_backoff_ms: 500,
            check_max_backoff_ms: 8_000,
            check_cache_ttl_secs: 60,
            check_cache_capacity: 1_000,
            suspicious_window: 10,
            suspicious_flips: 3,
            sweep_interval_secs: 1_800,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database", &self.database)
            .field("channel_id", &self.channel_id)
            .field("invite_secret", &"<redacted>")
            .field("grace_period_secs", &self.grace_period_secs)
            .field("allow_recovery", &self.allow_recovery)
            .field("verify_on_join", &self.verify_on_join)
            .field("reward_per_referral", &self.reward_per_referral)
            .field("check_attempts", &self.check_attempts)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Resolve the full layered configuration for a CLI invocation.
    pub fn from_cli_and_env(cli: &Cli) -> Result<Self, ConfigError> {
        let config = Self::layered(cli)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, file, env and CLI layers without validation.
    pub fn layered(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::load_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Overlay `REFGATE_*` variables as returned by `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(db) = lookup("REFGATE_DB") {
            self.database = PathBuf::from(db);
        }
        if let Some(channel) = lookup("REFGATE_CHANNEL_ID") {
            self.channel_id = channel;
        }
        if let Some(secret) = lookup("REFGATE_INVITE_SECRET") {
            self.invite_secret = secret;
        }
        if let Some(grace) = lookup("REFGATE_GRACE_SECS") {
            self.grace_period_secs = grace.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("REFGATE_GRACE_SECS is not a number: {grace:?}"))
            })?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(db) = &cli.db {
            self.database = db.clone();
        }
        if let Some(channel) = &cli.channel_id {
            self.channel_id = channel.clone();
        }
        if let Some(grace) = cli.grace_secs {
            self.grace_period_secs = grace;
        }
    }

    /// Enough for encoding and decoding invite codes.
    pub fn validate_codec(&self) -> Result<(), ConfigError> {
        if self.invite_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "invite_secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.channel_id.trim().is_empty() {
            return invalid("channel_id must be set");
        }
        self.validate_codec()?;
        if self.reward_per_referral == 0 {
            return invalid("reward_per_referral must be positive");
        }
        if self.check_attempts == 0 {
            return invalid("check_attempts must be positive");
        }
        if self.check_backoff_ms > self.check_max_backoff_ms {
            return invalid("check_backoff_ms exceeds check_max_backoff_ms");
        }
        if self.suspicious_flips == 0 {
            return invalid("suspicious_flips must be positive");
        }
        if self.suspicious_window < self.suspicious_flips + 1 {
            return invalid("suspicious_window must hold at least suspicious_flips + 1 checks");
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn codec(&self) -> InviteCodec {
        InviteCodec::new(&self.invite_secret)
    }

    pub fn policy(&self) -> AttributionPolicy {
        AttributionPolicy {
            grace_period_secs: self.grace_period_secs,
            allow_recovery: self.allow_recovery,
            verify_on_join: self.verify_on_join,
            reward_per_referral: self.reward_per_referral,
            suspicious_window: self.suspicious_window,
            suspicious_flips: self.suspicious_flips,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.check_attempts,
            base_delay: Duration::from_millis(self.check_backoff_ms),
            max_delay: Duration::from_millis(self.check_max_backoff_ms),
        }
    }

    pub fn gate<C: SubscriptionChecker>(&self, checker: C) -> SubscriptionGate<C> {
        SubscriptionGate::new(
            checker,
            self.channel_id.clone(),
            self.retry_policy(),
            Duration::from_secs(self.check_cache_ttl_secs),
            self.check_cache_capacity,
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
