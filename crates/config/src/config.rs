//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Media library layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Directories scanned recursively for candidates
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    /// Container extensions considered (without dot, case-insensitive)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/media")]
}

fn default_extensions() -> Vec<String> {
    vec!["mkv".to_string()]
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            extensions: default_extensions(),
        }
    }
}

/// Scan scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Minutes between delta scans
    #[serde(default = "default_delta_interval_minutes")]
    pub delta_interval_minutes: u64,
    /// Weekday of the weekly full scan ("sunday", "mon", ...)
    #[serde(default = "default_full_scan_day")]
    pub full_scan_day: String,
    /// Local time of the weekly full scan, "HH:MM"
    #[serde(default = "default_full_scan_time")]
    pub full_scan_time: String,
    /// Run a delta scan as soon as the daemon starts
    #[serde(default = "default_true")]
    pub scan_on_startup: bool,
    /// How far back the recent-import source is queried
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u64,
}

fn default_delta_interval_minutes() -> u64 {
    30
}

fn default_full_scan_day() -> String {
    "sunday".to_string()
}

fn default_full_scan_time() -> String {
    "03:00".to_string()
}

fn default_lookback_minutes() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            delta_interval_minutes: default_delta_interval_minutes(),
            full_scan_day: default_full_scan_day(),
            full_scan_time: default_full_scan_time(),
            scan_on_startup: true,
            lookback_minutes: default_lookback_minutes(),
        }
    }
}

/// Worker pool and retry budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Files converted in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Tool-failure attempts before a file is terminally Failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
}

fn default_concurrency() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_base_secs() -> u64 {
    5
}

fn default_retry_backoff_max_secs() -> u64 {
    30
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
        }
    }
}

/// Disk space preflight
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskConfig {
    /// Free space that must remain after the job's temporary files (GB)
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: u64,
    /// Required headroom as a multiple of the source size
    #[serde(default = "default_space_multiplier")]
    pub space_multiplier: f64,
}

fn default_min_free_gb() -> u64 {
    50
}

fn default_space_multiplier() -> f64 {
    2.5
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_free_gb: default_min_free_gb(),
            space_multiplier: default_space_multiplier(),
        }
    }
}

/// Backup retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Directory holding backups; next to the original when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_retention_days() -> u64 {
    7
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            dir: None,
        }
    }
}

/// Conversion policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Probe and decide only; never write (default true)
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Convert FEL sources even though the result is lossy
    #[serde(default)]
    pub auto_process_fel: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            auto_process_fel: false,
        }
    }
}

/// External tool locations and timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_dovi_tool")]
    pub dovi_tool: PathBuf,
    #[serde(default = "default_mkvmerge")]
    pub mkvmerge: PathBuf,
    #[serde(default = "default_mediainfo")]
    pub mediainfo: PathBuf,
    /// Fixed part of every tool timeout
    #[serde(default = "default_timeout_base_secs")]
    pub timeout_base_secs: u64,
    /// Additional timeout per GB of source
    #[serde(default = "default_timeout_secs_per_gb")]
    pub timeout_secs_per_gb: u64,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_dovi_tool() -> PathBuf {
    PathBuf::from("dovi_tool")
}

fn default_mkvmerge() -> PathBuf {
    PathBuf::from("mkvmerge")
}

fn default_mediainfo() -> PathBuf {
    PathBuf::from("mediainfo")
}

fn default_timeout_base_secs() -> u64 {
    300
}

fn default_timeout_secs_per_gb() -> u64 {
    120
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            dovi_tool: default_dovi_tool(),
            mkvmerge: default_mkvmerge(),
            mediainfo: default_mediainfo(),
            timeout_base_secs: default_timeout_base_secs(),
            timeout_secs_per_gb: default_timeout_secs_per_gb(),
        }
    }
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Directory holding the durable state and backup ledgers
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory for job-scoped work files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/config")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/temp")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            temp_dir: default_temp_dir(),
            library: LibraryConfig::default(),
            schedule: ScheduleConfig::default(),
            workers: WorkersConfig::default(),
            disk: DiskConfig::default(),
            backup: BackupConfig::default(),
            policy: PolicyConfig::default(),
            tools: ToolsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse a boolean the way every env override does.
///
/// Accepts "true", "1", "yes" and "false", "0", "no" (case-insensitive).
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Parse a weekday name ("sunday", "sun", ...) into days from Monday (0..=6).
pub fn parse_weekday(val: &str) -> Option<u32> {
    let day = match val.trim().to_lowercase().as_str() {
        "monday" | "mon" => 0,
        "tuesday" | "tue" | "tues" => 1,
        "wednesday" | "wed" => 2,
        "thursday" | "thu" | "thurs" => 3,
        "friday" | "fri" => 4,
        "saturday" | "sat" => 5,
        "sunday" | "sun" => 6,
        _ => return None,
    };
    Some(day)
}

/// Parse "HH:MM" into (hour, minute).
pub fn parse_time_of_day(val: &str) -> Option<(u32, u32)> {
    let (h, m) = val.trim().split_once(':')?;
    let hour = h.parse::<u32>().ok()?;
    let minute = m.parse::<u32>().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CONFIG_DIR -> state_dir
    /// - TEMP_DIR -> temp_dir
    /// - MEDIA_DIRS -> library.roots (comma separated)
    /// - DELTA_SCAN_INTERVAL_MINUTES, FULL_SCAN_DAY, FULL_SCAN_TIME,
    ///   SCAN_ON_STARTUP, LOOKBACK_MINUTES -> schedule
    /// - PROCESS_CONCURRENCY, MAX_ATTEMPTS -> workers
    /// - MIN_FREE_SPACE_GB -> disk.min_free_gb
    /// - BACKUP_RETENTION_DAYS, BACKUP_DIR -> backup
    /// - DRY_RUN, AUTO_PROCESS_FEL -> policy
    /// - LOG_LEVEL, LOG_FORMAT -> logging
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CONFIG_DIR") {
            if !val.trim().is_empty() {
                self.state_dir = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("TEMP_DIR") {
            if !val.trim().is_empty() {
                self.temp_dir = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("MEDIA_DIRS") {
            let roots: Vec<PathBuf> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
            if !roots.is_empty() {
                self.library.roots = roots;
            }
        }

        if let Ok(val) = env::var("DELTA_SCAN_INTERVAL_MINUTES") {
            if let Ok(minutes) = val.trim().parse::<u64>() {
                self.schedule.delta_interval_minutes = minutes;
            }
        }

        if let Ok(val) = env::var("FULL_SCAN_DAY") {
            if !val.trim().is_empty() {
                self.schedule.full_scan_day = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("FULL_SCAN_TIME") {
            if !val.trim().is_empty() {
                self.schedule.full_scan_time = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("SCAN_ON_STARTUP") {
            if let Some(b) = parse_bool(&val) {
                self.schedule.scan_on_startup = b;
            }
        }

        if let Ok(val) = env::var("LOOKBACK_MINUTES") {
            if let Ok(minutes) = val.trim().parse::<u64>() {
                self.schedule.lookback_minutes = minutes;
            }
        }

        if let Ok(val) = env::var("PROCESS_CONCURRENCY") {
            if let Ok(n) = val.trim().parse::<u32>() {
                self.workers.concurrency = n;
            }
        }

        if let Ok(val) = env::var("MAX_ATTEMPTS") {
            if let Ok(n) = val.trim().parse::<u32>() {
                self.workers.max_attempts = n;
            }
        }

        if let Ok(val) = env::var("MIN_FREE_SPACE_GB") {
            if let Ok(gb) = val.trim().parse::<u64>() {
                self.disk.min_free_gb = gb;
            }
        }

        if let Ok(val) = env::var("BACKUP_RETENTION_DAYS") {
            if let Ok(days) = val.trim().parse::<u64>() {
                self.backup.retention_days = days;
            }
        }

        if let Ok(val) = env::var("BACKUP_DIR") {
            let val = val.trim();
            self.backup.dir = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = env::var("DRY_RUN") {
            if let Some(b) = parse_bool(&val) {
                self.policy.dry_run = b;
            }
        }

        if let Ok(val) = env::var("AUTO_PROCESS_FEL") {
            if let Some(b) = parse_bool(&val) {
                self.policy.auto_process_fel = b;
            }
        }

        if let Ok(val) = env::var("LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val.trim().to_lowercase();
            }
        }

        if let Ok(val) = env::var("LOG_FORMAT") {
            match val.trim().to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "pretty" | "text" => self.logging.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    /// Check values that parse but cannot be run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.library.roots.is_empty() {
            return Err(ConfigError::Invalid(
                "library.roots must name at least one directory".to_string(),
            ));
        }
        if self.workers.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "workers.concurrency must be at least 1".to_string(),
            ));
        }
        if self.workers.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "workers.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.disk.space_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "disk.space_multiplier must be >= 1.0, got {}",
                self.disk.space_multiplier
            )));
        }
        if self.schedule.delta_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "schedule.delta_interval_minutes must be at least 1".to_string(),
            ));
        }
        if parse_weekday(&self.schedule.full_scan_day).is_none() {
            return Err(ConfigError::Invalid(format!(
                "schedule.full_scan_day '{}' is not a weekday",
                self.schedule.full_scan_day
            )));
        }
        if parse_time_of_day(&self.schedule.full_scan_time).is_none() {
            return Err(ConfigError::Invalid(format!(
                "schedule.full_scan_time '{}' is not HH:MM",
                self.schedule.full_scan_time
            )));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file means "all defaults"
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
