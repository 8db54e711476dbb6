//! Persisted configuration: queues, the download set, and the JSON document.
//!
//! A single JSON document on disk holds everything the engine must survive a
//! restart with: the queue definitions and the known downloads. The document
//! is loaded once at startup and rewritten (atomically) whenever the
//! scheduler mutates durable state.
//!
//! Location: `$HOME/.config/download-manager/download-manager.json`.

mod error;

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

pub use error::ConfigError;

use crate::download::Download;

/// File name of the persisted document.
const CONFIG_FILE_NAME: &str = "download-manager.json";

/// Serde helper for `HH:MM` time-of-day fields.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parses an `HH:MM` string into a time of day.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTime`] when the value does not parse.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ConfigError::InvalidTime {
        value: value.to_string(),
    })
}

/// One named queue: placement, concurrency, bandwidth, and time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Unique queue name.
    pub name: String,

    /// Upper bound on simultaneously active downloads in this queue.
    pub max_concurrent: usize,

    /// Start of the admission window (inclusive).
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,

    /// End of the admission window (inclusive). When `start_time` is later
    /// than `end_time` the window wraps past midnight.
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,

    /// Queue-wide bandwidth cap in KiB/s; 0 means unlimited.
    pub speed_limit: u64,

    /// Disabled queues admit nothing.
    pub enabled: bool,

    /// Directory for files downloaded under this queue.
    pub path: PathBuf,
}

impl QueueConfig {
    /// Creates an always-open queue with the given name, directory, and
    /// concurrency.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            start_time: NaiveTime::MIN,
            end_time: end_of_day(),
            speed_limit: 0,
            enabled: true,
            path: path.into(),
        }
    }

    /// Checks the queue's invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQueue`] on an empty name or a zero
    /// concurrency limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid_queue(
                &self.name,
                "queue name must not be empty",
            ));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid_queue(
                &self.name,
                "max_concurrent must be at least 1",
            ));
        }
        Ok(())
    }

    /// Returns true when the queue admits work at the given time of day.
    ///
    /// Comparison happens at minute resolution, matching the `HH:MM`
    /// granularity of the window itself, with both boundaries inclusive. A
    /// wrapped window (`start > end`) covers `[start, midnight)` plus
    /// `[midnight, end]`.
    #[must_use]
    pub fn is_time_allowed_at(&self, now: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }

        let now = truncate_to_minute(now);
        if self.start_time > self.end_time {
            now >= self.start_time || now <= self.end_time
        } else {
            now >= self.start_time && now <= self.end_time
        }
    }

    /// Returns true when the queue admits work right now (local wall clock).
    #[must_use]
    pub fn is_time_allowed(&self) -> bool {
        self.is_time_allowed_at(Local::now().time())
    }

    /// Human-readable window description for messages.
    #[must_use]
    pub fn window_label(&self) -> String {
        format!(
            "{}-{}",
            self.start_time.format("%H:%M"),
            self.end_time.format("%H:%M")
        )
    }
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

fn night_start() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn night_end() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// The persisted document: defaults, the download set, and the queue set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Queue used when a download names none.
    pub default_queue: String,

    /// Base directory for queue paths.
    pub save_path: PathBuf,

    /// Known downloads, in insertion order.
    #[serde(default)]
    pub downloads: Vec<Download>,

    /// Configured queues, in configuration (admission) order.
    pub queues: Vec<QueueConfig>,
}

impl Default for Config {
    /// The first-run document: a `default` queue open all day with
    /// concurrency 3, and a `night` queue (23:00–06:00) with concurrency 5.
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            save_path: PathBuf::from("downloads"),
            downloads: Vec::new(),
            queues: vec![
                QueueConfig {
                    name: "default".to_string(),
                    max_concurrent: 3,
                    start_time: NaiveTime::MIN,
                    end_time: end_of_day(),
                    speed_limit: 0,
                    enabled: true,
                    path: PathBuf::from("downloads/default"),
                },
                QueueConfig {
                    name: "night".to_string(),
                    max_concurrent: 5,
                    start_time: night_start(),
                    end_time: night_end(),
                    speed_limit: 0,
                    enabled: true,
                    path: PathBuf::from("downloads/night"),
                },
            ],
        }
    }
}

impl Config {
    /// Resolves the default document path under the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHome`] when `$HOME` is unset or empty.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = std::env::var_os("HOME")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::NoHome)?;
        Ok(PathBuf::from(home)
            .join(".config")
            .join("download-manager")
            .join(CONFIG_FILE_NAME))
    }

    /// Loads the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Malformed`] when it does not parse. Both are fatal at
    /// startup; [`Config::load_or_init`] is the recovering variant.
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        debug!(
            downloads = config.downloads.len(),
            queues = config.queues.len(),
            "loaded config"
        );
        Ok(config)
    }

    /// Loads the document at `path`, writing and returning the default
    /// document when none exists yet.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Config::load`] for an existing but
    /// unreadable document, or [`ConfigError::Io`] if the default cannot be
    /// written.
    #[instrument]
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }

        info!(path = %path.display(), "no config found, writing defaults");
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    /// Writes the document atomically: serialize to a sibling temp file,
    /// then rename over the target. Parent directories are created on
    /// demand.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] on any filesystem failure.
    #[instrument(skip(self))]
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
            }
        }

        // Serialization of a valid in-memory config cannot fail; treat a
        // failure as an IO-level problem with the document.
        let data = serde_json::to_string_pretty(self).map_err(|e| {
            ConfigError::io(path, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|e| ConfigError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| ConfigError::io(path, e))?;
        Ok(())
    }

    /// Validates every queue and the uniqueness of queue names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQueue`] on the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, queue) in self.queues.iter().enumerate() {
            queue.validate()?;
            if self.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(ConfigError::invalid_queue(
                    &queue.name,
                    "duplicate queue name",
                ));
            }
        }
        Ok(())
    }

    /// Looks up a queue by name.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Looks up a queue by name, mutably.
    pub fn queue_mut(&mut self, name: &str) -> Option<&mut QueueConfig> {
        self.queues.iter_mut().find(|q| q.name == name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_time_of_day_valid() {
        assert_eq!(parse_time_of_day("23:00").unwrap(), hm(23, 0));
        assert_eq!(parse_time_of_day("00:00").unwrap(), hm(0, 0));
    }

    #[test]
    fn test_parse_time_of_day_invalid() {
        assert!(matches!(
            parse_time_of_day("25:00"),
            Err(ConfigError::InvalidTime { .. })
        ));
        assert!(matches!(
            parse_time_of_day("noon"),
            Err(ConfigError::InvalidTime { .. })
        ));
    }

    #[test]
    fn test_window_normal_hours() {
        let mut queue = QueueConfig::new("work", "downloads/work", 2);
        queue.start_time = hm(9, 0);
        queue.end_time = hm(17, 0);

        assert!(queue.is_time_allowed_at(hm(9, 0)));
        assert!(queue.is_time_allowed_at(hm(12, 30)));
        assert!(queue.is_time_allowed_at(hm(17, 0)));
        assert!(!queue.is_time_allowed_at(hm(8, 59)));
        assert!(!queue.is_time_allowed_at(hm(17, 1)));
    }

    #[test]
    fn test_window_wraps_past_midnight() {
        let mut queue = QueueConfig::new("night", "downloads/night", 5);
        queue.start_time = hm(23, 0);
        queue.end_time = hm(6, 0);

        assert!(queue.is_time_allowed_at(hm(23, 30)));
        assert!(queue.is_time_allowed_at(hm(5, 0)));
        assert!(queue.is_time_allowed_at(hm(23, 0)));
        assert!(queue.is_time_allowed_at(hm(6, 0)));
        assert!(!queue.is_time_allowed_at(hm(10, 0)));
        assert!(!queue.is_time_allowed_at(hm(22, 59)));
    }

    #[test]
    fn test_window_seconds_are_ignored() {
        let mut queue = QueueConfig::new("q", "downloads/q", 1);
        queue.start_time = hm(0, 0);
        queue.end_time = hm(23, 59);

        // 23:59:45 truncates to 23:59, which is inside the window.
        let late = NaiveTime::from_hms_opt(23, 59, 45).unwrap();
        assert!(queue.is_time_allowed_at(late));
    }

    #[test]
    fn test_disabled_queue_never_allows() {
        let mut queue = QueueConfig::new("q", "downloads/q", 1);
        queue.enabled = false;
        assert!(!queue.is_time_allowed_at(hm(12, 0)));
    }

    #[test]
    fn test_queue_validate_rejects_zero_concurrency() {
        let queue = QueueConfig::new("q", "downloads/q", 0);
        assert!(matches!(
            queue.validate(),
            Err(ConfigError::InvalidQueue { .. })
        ));
    }

    #[test]
    fn test_default_config_shape() {
        let config = Config::default();
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.queues.len(), 2);

        let default = config.queue("default").unwrap();
        assert_eq!(default.max_concurrent, 3);
        assert_eq!(default.window_label(), "00:00-23:59");

        let night = config.queue("night").unwrap();
        assert_eq!(night.max_concurrent, 5);
        assert_eq!(night.window_label(), "23:00-06:00");
    }

    #[test]
    fn test_validate_rejects_duplicate_queue_names() {
        let mut config = Config::default();
        config
            .queues
            .push(QueueConfig::new("default", "elsewhere", 1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQueue { .. })
        ));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download-manager.json");

        let mut config = Config::default();
        config
            .downloads
            .push(Download::new("https://example.com/f.bin", "default"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.downloads.len(), 1);
        assert_eq!(loaded.downloads[0].url, "https://example.com/f.bin");
    }

    #[test]
    fn test_save_writes_indented_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download-manager.json");
        Config::default().save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  "), "expected an indented document");
        assert!(raw.contains("\"default_queue\""));
        assert!(raw.contains("\"23:00\""));
    }

    #[test]
    fn test_load_or_init_writes_default_on_first_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("download-manager.json");

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_load_malformed_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download-manager.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_load_missing_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(Config::load(&path), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download-manager.json");
        Config::default().save(&path).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "only the document should remain");
    }
}
