//! Logging configuration and initialization for Appforge services
//!
//! Provides centralized logging with:
//! - Daily rotating file logging or console logging
//! - Configurable log directories and file prefixes
//! - Environment variable configuration

use anyhow::Result;
use std::env;
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with configurable output destination
///
/// ## Environment Variables
///
/// - `LOG_DESTINATION`: Output destination - "console" or "file" (default: "console")
/// - `LOG_DIR`: Directory for log files (default: "./logs") - only used when LOG_DESTINATION=file
/// - `LOG_FILE_PREFIX`: Prefix for log file names (default: "appforge") - only used when LOG_DESTINATION=file
pub fn init_logging() -> Result<()> {
    let log_destination = env::var("LOG_DESTINATION").unwrap_or_else(|_| "console".to_string());

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    match log_destination.to_lowercase().as_str() {
        "file" => {
            let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
            let log_file_prefix =
                env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| "appforge".to_string());

            if let Err(e) = std::fs::create_dir_all(&log_dir) {
                return Err(anyhow::anyhow!(
                    "Failed to create log directory '{}': {}",
                    log_dir,
                    e
                ));
            }

            let file_appender = rolling::daily(&log_dir, &log_file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize file logging: {}", e))?;

            info!("📝 Logging to daily rotating files in: {}/", log_dir);
            info!(
                "📂 Log file pattern: {}/{}.<YYYY-MM-DD>",
                log_dir, log_file_prefix
            );

            // The guard keeps the background writer thread alive; hold it for
            // the lifetime of the process.
            std::mem::forget(guard);
        }
        other => {
            if other != "console" {
                warn!(
                    "Unknown LOG_DESTINATION '{}', defaulting to console",
                    other
                );
            }
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stdout)
                        .with_ansi(true)
                        .with_target(false),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize console logging: {}", e))?;

            info!("📺 Logging to console (stdout)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_init_with_valid_directory() {
        let log_dir = "./test_logs_temp";

        unsafe {
            env::set_var("LOG_DESTINATION", "file");
            env::set_var("LOG_DIR", log_dir);
            env::set_var("LOG_FILE_PREFIX", "test-log");
        }

        let result = init_logging();
        assert!(result.is_ok(), "init should succeed with a valid directory");
        assert!(fs::metadata(log_dir).is_ok(), "log directory should exist");

        let _ = fs::remove_dir_all(log_dir);
        unsafe {
            env::remove_var("LOG_DESTINATION");
            env::remove_var("LOG_DIR");
            env::remove_var("LOG_FILE_PREFIX");
        }
    }

    #[test]
    fn test_environment_variable_fallbacks() {
        unsafe {
            env::remove_var("LOG_DESTINATION");
            env::remove_var("LOG_DIR");
            env::remove_var("LOG_FILE_PREFIX");
        }

        let log_destination = env::var("LOG_DESTINATION").unwrap_or_else(|_| "console".to_string());
        let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
        let log_file_prefix = env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| "appforge".to_string());

        assert_eq!(log_destination, "console");
        assert_eq!(log_dir, "./logs");
        assert_eq!(log_file_prefix, "appforge");
    }
}
