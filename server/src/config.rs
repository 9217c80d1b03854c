use std::str::FromStr;
use std::time;

use durq::JobRecoveryBehavior;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "DATABASE_PATH")]
    pub database_path: NonEmptyString,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3000")]
    pub port: u16,

    /// Size of the embedded worker pool. 0 runs the server as a producer only.
    #[envconfig(from = "WORKERS", default = "2")]
    pub workers: usize,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "1000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "MAX_PAYLOAD_BYTES", default = "1048576")]
    pub max_payload_bytes: usize,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    /// What to do with claims still held when the server starts. Only set `fail_abandoned` when
    /// no other process uses the same database file.
    #[envconfig(from = "JOB_RECOVERY", default = "leave_in_progress")]
    pub job_recovery: EnvJobRecovery,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    /// Total attempts per job. 1 leaves failed jobs alone.
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "1")]
    pub max_attempts: u32,

    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS", default = "3600000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_CHECK_INTERVAL_MS", default = "5000")]
    pub check_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn enabled(&self) -> bool {
        self.max_attempts > 1
    }

    pub fn policy(&self) -> durq::RetryPolicy {
        durq::RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval.0,
            maximum_interval: Some(self.maximum_interval.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvJobRecovery(pub JobRecoveryBehavior);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseJobRecoveryError;

impl FromStr for EnvJobRecovery {
    type Err = ParseJobRecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leave_in_progress" => Ok(EnvJobRecovery(JobRecoveryBehavior::LeaveInProgress)),
            "fail_abandoned" => Ok(EnvJobRecovery(JobRecoveryBehavior::FailAbandoned)),
            _ => Err(ParseJobRecoveryError),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
