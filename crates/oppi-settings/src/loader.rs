//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`OppiSettings::default()`]
//! 2. If `~/.oppi/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `OPPI_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::OppiSettings;

/// Resolve the path to the settings file (`~/.oppi/settings.json`).
///
/// `OPPI_SETTINGS` points at an alternate file.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string("OPPI_SETTINGS") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".oppi").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<OppiSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged values fail validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<OppiSettings> {
    let defaults = serde_json::to_value(OppiSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: OppiSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid or out-of-range values are logged and ignored.
pub fn apply_env_overrides(settings: &mut OppiSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("OPPI_BASE_URL") {
        settings.server.base_url = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("OPPI_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("OPPI_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Stream ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("OPPI_SEND_TIMEOUT_MS", 100, 120_000) {
        settings.stream.send_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("OPPI_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.stream.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u32("OPPI_RECONNECT_MAX_ATTEMPTS", 0, 1_000) {
        settings.stream.reconnect_max_attempts = v;
    }

    // ── Commands ────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("OPPI_COMMAND_TIMEOUT_MS", 100, 600_000) {
        settings.commands.command_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("OPPI_TURN_TIMEOUT_MS", 100, 600_000) {
        settings.commands.turn_timeout_ms = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
