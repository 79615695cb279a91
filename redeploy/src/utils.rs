//! Utility functions

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Format of the timestamp suffix on backup directory names
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Version information for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// `YYYYMMDD_HHMMSS` in local time
pub fn stamp(at: &DateTime<Local>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Generate a random UUID v4, used to tag one update attempt in the logs
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shorten a revision id for display
pub fn short_rev(rev: &str) -> &str {
    rev.get(..10).unwrap_or(rev)
}

/// Hex encoding utilities
pub mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}
