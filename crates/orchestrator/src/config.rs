//! Environment-sourced configuration.
//!
//! Durations are given in seconds (e.g. `AGENT_TIMEOUT=21600` for six
//! hours). Every knob has a default; only credentials and connection
//! strings are genuinely optional.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,

    /// State database connection string. Unset means in-memory SQLite
    /// (local development only).
    pub database_url: Option<String>,

    /// Artifact bucket. Unset means the in-memory store.
    pub s3_bucket: Option<String>,

    /// Event bus connection string. Unset means the in-process bus.
    pub nats_url: Option<String>,

    /// HS256 secret for verifying bearer tokens.
    pub jwt_secret: String,

    /// Hosting provider API token; protection relaxation is skipped
    /// without it.
    pub vercel_token: Option<String>,

    /// Root under which per-app workspaces are created.
    pub workspace_dir: PathBuf,

    /// Starter tree mirrored into the workspace of a first build.
    pub starter_code_dir: PathBuf,

    /// Explicit agent binary override; otherwise resolution probes common
    /// install paths and falls back to `PATH`.
    pub agent_binary_path: Option<String>,

    pub agent_timeout: Duration,
    pub prebuild_timeout: Duration,
    pub deploy_timeout: Duration,
    pub link_timeout: Duration,
    pub schema_bootstrap_timeout: Duration,

    /// Prebuild attempts per build, counting the first one.
    pub max_build_attempts: u32,

    /// Pause after entering `building` so subscribers attaching right
    /// after the create response still see the first message. Zero in
    /// tests.
    pub subscribe_grace: Duration,

    pub sse_heartbeat_interval: Duration,
    pub sse_max_duration: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8092),
            database_url: env_opt("DATABASE_URL"),
            s3_bucket: env_opt("S3_BUCKET"),
            nats_url: env_opt("NATS_URL"),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            vercel_token: env_opt("VERCEL_TOKEN"),
            workspace_dir: PathBuf::from(env_or("WORKSPACE_DIR", "/tmp/appforge-workspaces")),
            starter_code_dir: PathBuf::from(env_or("STARTER_CODE_DIR", "../react-app")),
            agent_binary_path: env_opt("AGENT_BINARY_PATH"),
            agent_timeout: env_duration("AGENT_TIMEOUT", 6 * 60 * 60),
            prebuild_timeout: env_duration("PREBUILD_TIMEOUT", 10 * 60),
            deploy_timeout: env_duration("DEPLOY_TIMEOUT", 10 * 60),
            link_timeout: env_duration("LINK_TIMEOUT", 2 * 60),
            schema_bootstrap_timeout: env_duration("SCHEMA_BOOTSTRAP_TIMEOUT", 2 * 60),
            max_build_attempts: env_parse("MAX_BUILD_ATTEMPTS", 3),
            subscribe_grace: env_duration("SUBSCRIBE_GRACE", 2),
            sse_heartbeat_interval: env_duration("SSE_HEARTBEAT_INTERVAL", 15),
            sse_max_duration: env_duration("SSE_MAX_DURATION", 10 * 60 * 60),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        unsafe {
            env::remove_var("PORT");
            env::remove_var("AGENT_TIMEOUT");
        }

        let config = Config::from_env();
        assert_eq!(config.port, 8092);
        assert_eq!(config.agent_timeout, Duration::from_secs(21_600));
        assert_eq!(config.sse_heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.sse_max_duration, Duration::from_secs(36_000));
    }

    #[test]
    fn test_overrides() {
        unsafe {
            env::set_var("MAX_BUILD_ATTEMPTS", "5");
            env::set_var("PREBUILD_TIMEOUT", "30");
        }

        let config = Config::from_env();
        assert_eq!(config.max_build_attempts, 5);
        assert_eq!(config.prebuild_timeout, Duration::from_secs(30));

        unsafe {
            env::remove_var("MAX_BUILD_ATTEMPTS");
            env::remove_var("PREBUILD_TIMEOUT");
        }
    }
}
