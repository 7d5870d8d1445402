//! Centralized constants for the storage crate.

/// Top-level directory names excluded from both workspace seeding and
/// artifact packaging. These are build byproducts the agent regenerates:
/// dependency caches, hosting-provider metadata, agent history, build
/// output, and source-control metadata.
pub const EXCLUDED_PREFIXES: &[&str] = &[
    "node_modules",
    ".vercel",
    ".agent-history",
    "dist",
    ".git",
    ".next",
];

/// MIME type for packaged source trees.
pub const ARCHIVE_MIME_TYPE: &str = "application/gzip";

/// Maximum number of retries when checking S3 object availability.
pub const S3_AVAILABILITY_MAX_RETRIES: u32 = 10;

/// Delay between S3 availability check retries (in milliseconds).
pub const S3_AVAILABILITY_RETRY_DELAY_MS: u64 = 500;

/// Artifact key for a packaged version.
pub fn artifact_key(app_id: &str, version_id: &str) -> String {
    format!("apps/{}/versions/{}/code.tar.gz", app_id, version_id)
}
