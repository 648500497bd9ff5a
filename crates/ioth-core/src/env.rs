//! Environment variable helpers for loader configuration.
//!
//! ```ignore
//! use ioth_core::env::{env_flag, env_path};
//!
//! let user = env_path("IOTH_USER_PATH");            // Option<PathBuf>
//! let cwd  = env_flag("IOTH_SEARCH_CWD", false);     // "1", "true", "yes", "on"
//! ```
//!
//! `path_value` and `flag_value` do the parsing, so configuration can be
//! built from any variable source, not only the process environment.

use std::ffi::OsString;
use std::path::PathBuf;

/// Directory from the environment. Unset or empty is `None`.
#[inline]
pub fn env_path(key: &str) -> Option<PathBuf> {
    path_value(std::env::var_os(key))
}

/// Boolean flag from the environment; see [`flag_value`].
#[inline]
pub fn env_flag(key: &str, default: bool) -> bool {
    flag_value(std::env::var_os(key), default)
}

/// Directory value. Absent or empty is `None`.
pub fn path_value(value: Option<OsString>) -> Option<PathBuf> {
    value.filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Boolean value.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true and
/// "0", "false", "no", "off" as false. Absent or unrecognised returns
/// the default.
pub fn flag_value(value: Option<OsString>, default: bool) -> bool {
    let Some(value) = value.and_then(|v| v.into_string().ok()) else {
        return default;
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Per-user module directory: `$HOME/<dir>`, or `./<dir>` when `HOME`
/// is unset.
pub fn home_relative(dir: &str) -> PathBuf {
    match env_path("HOME") {
        Some(home) => home.join(dir),
        None => PathBuf::from(".").join(dir),
    }
}
