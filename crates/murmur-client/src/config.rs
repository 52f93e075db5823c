//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so the client runs with zero configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_shared::constants::{
    LOAD_MORE_DEBOUNCE_MS, MAX_FILE_SIZE, MAX_STORY_TTL_HOURS, PAGE_SIZE, STORY_TTL_HOURS,
    TYPING_IDLE_MS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Initial live-window size and its growth step.
    /// Env: `MURMUR_PAGE_SIZE`
    pub page_size: usize,

    /// Delay between accepting a "load more" and growing the window.
    /// Env: `MURMUR_LOAD_MORE_DEBOUNCE_MS`
    pub load_more_debounce: Duration,

    /// Idle time after which the typing flag is cleared.
    /// Env: `MURMUR_TYPING_IDLE_MS`
    pub typing_idle: Duration,

    /// At most one year.
    /// Env: `MURMUR_STORY_TTL_HOURS`
    pub story_ttl_hours: i64,

    /// SQLite file for the local document store. `None` uses the platform
    /// data directory.
    /// Env: `MURMUR_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Env: `MURMUR_MAX_UPLOAD_BYTES`
    pub max_upload_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            load_more_debounce: Duration::from_millis(LOAD_MORE_DEBOUNCE_MS),
            typing_idle: Duration::from_millis(TYPING_IDLE_MS),
            story_ttl_hours: STORY_TTL_HOURS,
            db_path: None,
            max_upload_bytes: MAX_FILE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_positive::<usize>(&lookup, "MURMUR_PAGE_SIZE") {
            config.page_size = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MURMUR_LOAD_MORE_DEBOUNCE_MS") {
            config.load_more_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MURMUR_TYPING_IDLE_MS") {
            config.typing_idle = Duration::from_millis(ms);
        }
        if let Some(hours) = parse_positive::<i64>(&lookup, "MURMUR_STORY_TTL_HOURS") {
            if hours > MAX_STORY_TTL_HOURS {
                tracing::warn!(
                    var = "MURMUR_STORY_TTL_HOURS",
                    max = MAX_STORY_TTL_HOURS,
                    "value too large, using default"
                );
            } else {
                config.story_ttl_hours = hours;
            }
        }
        if let Some(path) = lookup("MURMUR_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }
        if let Some(n) = parse_positive::<usize>(&lookup, "MURMUR_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = n;
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "invalid value, using default");
            None
        }
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    let value = parse_var::<T>(lookup, name)?;
    if value <= T::default() {
        tracing::warn!(var = name, "value must be positive, using default");
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.page_size, 20);
        assert_eq!(config.load_more_debounce, Duration::from_millis(500));
        assert_eq!(config.typing_idle, Duration::from_secs(2));
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn overrides_are_applied() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MURMUR_PAGE_SIZE", "50"),
            ("MURMUR_TYPING_IDLE_MS", "750"),
            ("MURMUR_DB_PATH", "/tmp/murmur.db"),
            ("MURMUR_STORY_TTL_HOURS", "12"),
        ]));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.typing_idle, Duration::from_millis(750));
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/murmur.db")));
        assert_eq!(config.story_ttl_hours, 12);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MURMUR_PAGE_SIZE", "0"),
            ("MURMUR_LOAD_MORE_DEBOUNCE_MS", "soon"),
            ("MURMUR_MAX_UPLOAD_BYTES", "-1"),
        ]));
        assert_eq!(config.page_size, PAGE_SIZE);
        assert_eq!(
            config.load_more_debounce,
            Duration::from_millis(LOAD_MORE_DEBOUNCE_MS)
        );
        assert_eq!(config.max_upload_bytes, MAX_FILE_SIZE);
    }

    #[test]
    fn story_lifetime_is_bounded() {
        let huge = ClientConfig::from_lookup(lookup(&[(
            "MURMUR_STORY_TTL_HOURS",
            "9223372036854775807",
        )]));
        assert_eq!(huge.story_ttl_hours, STORY_TTL_HOURS);

        let year = ClientConfig::from_lookup(lookup(&[("MURMUR_STORY_TTL_HOURS", "8760")]));
        assert_eq!(year.story_ttl_hours, 8760);

        let over = ClientConfig::from_lookup(lookup(&[("MURMUR_STORY_TTL_HOURS", "8761")]));
        assert_eq!(over.story_ttl_hours, STORY_TTL_HOURS);
    }
}
