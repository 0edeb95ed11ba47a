//! Environment Configuration Loader
//!
//! Loads `KEY=VALUE` pairs from the bridge environment file so the service
//! binary and the demo client share the same secrets (JWT key, issuer,
//! endpoints).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bridge_core::config::{get_config, load_environment};
//!
//! load_environment();
//! let secret = get_config("BRIDGE_JWT_SECRET", "change-me");
//! ```

use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit env file
pub const ENV_FILE_VAR: &str = "BRIDGE_ENV_FILE";

/// Paths checked in order of priority
pub const ENV_FILE_PATHS: &[&str] = &["/etc/rpc-bridge/environment", "/etc/rpc-bridge.env", ".env"];

/// Load environment variables from the first env file found.
///
/// `BRIDGE_ENV_FILE` wins over the default paths. Variables already present
/// in the process environment are never overridden.
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var(ENV_FILE_VAR) {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded) = try_load_env_file(path) {
            return Some(loaded);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let (loaded, skipped) = apply_env_content(&content);
            info!(
                path = %path,
                loaded,
                skipped,
                "Loaded environment file"
            );
            Some(path.to_string())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            None
        }
    }
}

/// Apply env file content; returns (loaded, skipped-because-already-set).
fn apply_env_content(content: &str) -> (usize, usize) {
    let mut loaded = 0;
    let mut skipped = 0;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = parse_env_line(line) {
            if std::env::var(&key).is_err() {
                std::env::set_var(&key, &value);
                loaded += 1;
                debug!(key = %key, value = %redact(&key, &value), "Loaded");
            } else {
                skipped += 1;
                debug!(key = %key, "Skipped (already set)");
            }
        }
    }

    (loaded, skipped)
}

fn redact<'a>(key: &str, value: &'a str) -> &'a str {
    if key.contains("KEY") || key.contains("TOKEN") || key.contains("SECRET") {
        "***"
    } else {
        value
    }
}

/// Parse `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'` and `export KEY=VALUE`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Get a configuration value with a default.
pub fn get_config(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get an optional configuration value (empty counts as unset).
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Get a boolean configuration value.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

/// Get an integer configuration value.
pub fn get_config_int(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_line_simple() {
        let (k, v) = parse_env_line("FOO=bar").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_quoted() {
        let (k, v) = parse_env_line("FOO=\"bar baz\"").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar baz");

        let (_, v) = parse_env_line("FOO='bar'").unwrap();
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_export_and_equals_in_value() {
        let (k, v) = parse_env_line("export BRIDGE_URL=http://h/?a=b").unwrap();
        assert_eq!(k, "BRIDGE_URL");
        assert_eq!(v, "http://h/?a=b");
    }

    #[test]
    fn test_parse_env_line_empty() {
        assert!(parse_env_line("").is_none());
        assert!(parse_env_line("=value").is_none());
    }

    #[test]
    fn test_apply_env_content_never_overrides() {
        std::env::set_var("BRIDGE_CFG_TEST_SET", "original");
        std::env::remove_var("BRIDGE_CFG_TEST_NEW");

        let (loaded, skipped) = apply_env_content(
            "# comment\nBRIDGE_CFG_TEST_SET=replaced\nBRIDGE_CFG_TEST_NEW=fresh\n",
        );

        assert_eq!((loaded, skipped), (1, 1));
        assert_eq!(get_config("BRIDGE_CFG_TEST_SET", ""), "original");
        assert_eq!(get_config_opt("BRIDGE_CFG_TEST_NEW").as_deref(), Some("fresh"));
    }

    #[test]
    fn test_typed_getters_defaults() {
        std::env::set_var("BRIDGE_CFG_TEST_BOOL", "yes");
        std::env::set_var("BRIDGE_CFG_TEST_INT", "42");
        assert!(get_config_bool("BRIDGE_CFG_TEST_BOOL", false));
        assert!(!get_config_bool("BRIDGE_CFG_TEST_MISSING_BOOL", false));
        assert_eq!(get_config_int("BRIDGE_CFG_TEST_INT", 0), 42);
        assert_eq!(get_config_int("BRIDGE_CFG_TEST_MISSING_INT", 7), 7);
    }
}
