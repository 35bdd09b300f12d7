//! Layered configuration for the launcher.
//!
//! Settings come from `config.toml` (default location under the user's config
//! directory), then `CT_*` environment variables, then CLI flags applied by
//! the command layer. Numeric values are clamped after every layer.
//!
//! # Configuration File Format
//!
//! ```toml
//! [launch]
//! stability_window_secs = 10
//! max_attempts = 4
//! grace_period_secs = 5
//! inter_attempt_delay_ms = 2000
//! base_flags = ["--enable-logging=stderr", "--v=1"]
//! extra_flags = []
//! flatpak_fallback = true
//!
//! [diagnostics]
//! enabled = true
//! journal_lines = 200
//! kernel_monitor = false
//!
//! [logging]
//! enable_sqlite = true
//! enable_json = true
//! color = true
//! level = "info"
//! format = "compact"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "chrome-troubleshooter";

/// Bounds applied to user-supplied values.
pub const STABILITY_WINDOW_RANGE: (u64, u64) = (1, 300);
pub const MAX_ATTEMPTS_RANGE: (usize, usize) = (1, 10);
pub const JOURNAL_LINES_RANGE: (usize, usize) = (10, 10_000);
pub const GRACE_PERIOD_RANGE: (u64, u64) = (1, 60);
pub const INTER_ATTEMPT_DELAY_MS_RANGE: (u64, u64) = (0, 60_000);
pub const COMMAND_TIMEOUT_RANGE: (u64, u64) = (1, 120);
pub const MONITOR_GRACE_MS_RANGE: (u64, u64) = (0, 10_000);

/// Output format for operational tracing on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => bail!("Unknown log format '{}': expected compact or json", other),
        }
    }
}

/// `[launch]` section: how each attempt is run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSection {
    /// Seconds a child must stay alive to count as launched.
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Seconds between SIGTERM and SIGKILL when reaping a process group.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_inter_attempt_delay_ms")]
    pub inter_attempt_delay_ms: u64,
    /// Prepended to every attempt so the browser logs to stderr.
    #[serde(default = "default_base_flags")]
    pub base_flags: Vec<String>,
    /// Appended to every attempt.
    #[serde(default)]
    pub extra_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub flatpak_fallback: bool,
    #[serde(default = "default_flatpak_app_id")]
    pub flatpak_app_id: String,
}

fn default_stability_window_secs() -> u64 {
    10
}

fn default_max_attempts() -> usize {
    4
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_inter_attempt_delay_ms() -> u64 {
    2000
}

fn default_base_flags() -> Vec<String> {
    vec!["--enable-logging=stderr".to_string(), "--v=1".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_flatpak_app_id() -> String {
    "org.chromium.Chromium".to_string()
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            stability_window_secs: default_stability_window_secs(),
            max_attempts: default_max_attempts(),
            grace_period_secs: default_grace_period_secs(),
            inter_attempt_delay_ms: default_inter_attempt_delay_ms(),
            base_flags: default_base_flags(),
            extra_flags: Vec::new(),
            executable: None,
            lock_path: None,
            flatpak_fallback: true,
            flatpak_app_id: default_flatpak_app_id(),
        }
    }
}

/// `[diagnostics]` section: what is collected after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_journal_lines")]
    pub journal_lines: usize,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Follow the kernel ring buffer while each attempt runs.
    #[serde(default)]
    pub kernel_monitor: bool,
    #[serde(default = "default_monitor_grace_ms")]
    pub monitor_grace_ms: u64,
}

fn default_journal_lines() -> usize {
    200
}

fn default_command_timeout_secs() -> u64 {
    5
}

fn default_monitor_grace_ms() -> u64 {
    500
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            journal_lines: default_journal_lines(),
            command_timeout_secs: default_command_timeout_secs(),
            kernel_monitor: false,
            monitor_grace_ms: default_monitor_grace_ms(),
        }
    }
}

/// `[logging]` section: where the forensic record goes and how it looks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enable_sqlite: bool,
    #[serde(default = "default_true")]
    pub enable_json: bool,
    #[serde(default = "default_true")]
    pub color: bool,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Upper bound on the output tail kept per attempt.
    #[serde(default = "default_stderr_limit_bytes")]
    pub stderr_limit_bytes: usize,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_stderr_limit_bytes() -> usize {
    64 * 1024
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            base_dir: None,
            enable_sqlite: true,
            enable_json: true,
            color: true,
            level: default_level(),
            format: LogFormat::default(),
            stderr_limit_bytes: default_stderr_limit_bytes(),
        }
    }
}

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub launch: LaunchSection,
    #[serde(default)]
    pub diagnostics: DiagnosticsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).context("Failed to parse config.toml")?;
        config.clamp();
        Ok(config)
    }

    /// Load from `path`, or defaults when the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// `~/.config/chrome-troubleshooter/config.toml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_NAME)
            .join("config.toml")
    }

    /// Apply `CT_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply `CT_*` overrides using `lookup` as the environment.
    ///
    /// Unparseable values are ignored and the file value is kept.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = lookup("CT_LAUNCH_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.launch.stability_window_secs = secs;
        }
        if let Some(n) = lookup("CT_MAX_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            self.launch.max_attempts = n;
        }
        if let Some(flags) = lookup("CT_EXTRA_FLAGS") {
            self.launch.extra_flags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(path) = lookup("CT_CHROME_PATH").or_else(|| lookup("CHROME_PATH"))
            && !path.trim().is_empty()
        {
            self.launch.executable = Some(PathBuf::from(path.trim()));
        }
        if let Some(path) = lookup("CT_LOCK_PATH") {
            self.launch.lock_path = Some(PathBuf::from(path));
        }
        if let Some(on) = lookup("CT_FLATPAK_FALLBACK").and_then(|v| parse_bool(&v)) {
            self.launch.flatpak_fallback = on;
        }
        if let Some(n) = lookup("CT_JOURNAL_LINES").and_then(|v| v.trim().parse().ok()) {
            self.diagnostics.journal_lines = n;
        }
        if let Some(dir) = lookup("CT_BASE_DIR") {
            self.logging.base_dir = Some(PathBuf::from(dir));
        }
        if let Some(on) = lookup("CT_ENABLE_SQLITE").and_then(|v| parse_bool(&v)) {
            self.logging.enable_sqlite = on;
        }
        if let Some(on) = lookup("CT_ENABLE_JSON").and_then(|v| parse_bool(&v)) {
            self.logging.enable_json = on;
        }
        if let Some(on) = lookup("CT_COLOR").and_then(|v| parse_bool(&v)) {
            self.logging.color = on;
        }
        if let Some(level) = lookup("CT_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        self.clamp();
    }

    /// Force numeric settings into their supported ranges.
    pub fn clamp(&mut self) {
        let (lo, hi) = STABILITY_WINDOW_RANGE;
        self.launch.stability_window_secs = self.launch.stability_window_secs.clamp(lo, hi);
        let (lo, hi) = MAX_ATTEMPTS_RANGE;
        self.launch.max_attempts = self.launch.max_attempts.clamp(lo, hi);
        let (lo, hi) = GRACE_PERIOD_RANGE;
        self.launch.grace_period_secs = self.launch.grace_period_secs.clamp(lo, hi);
        let (lo, hi) = INTER_ATTEMPT_DELAY_MS_RANGE;
        self.launch.inter_attempt_delay_ms = self.launch.inter_attempt_delay_ms.clamp(lo, hi);
        let (lo, hi) = JOURNAL_LINES_RANGE;
        self.diagnostics.journal_lines = self.diagnostics.journal_lines.clamp(lo, hi);
        let (lo, hi) = COMMAND_TIMEOUT_RANGE;
        self.diagnostics.command_timeout_secs = self.diagnostics.command_timeout_secs.clamp(lo, hi);
        let (lo, hi) = MONITOR_GRACE_MS_RANGE;
        self.diagnostics.monitor_grace_ms = self.diagnostics.monitor_grace_ms.clamp(lo, hi);
    }

    /// Check for settings that load fine but will not behave as intended.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            warnings.push(format!(
                "Unknown logging.level '{}': expected trace, debug, info, warn or error",
                self.logging.level
            ));
        }

        if !self.logging.enable_json && !self.logging.enable_sqlite {
            warnings.push(
                "Both durable sinks are disabled; only launcher.log will be written".to_string(),
            );
        }

        for flag in self.launch.base_flags.iter().chain(&self.launch.extra_flags) {
            if !flag.starts_with("--") {
                warnings.push(format!("Flag '{}' does not start with '--'", flag));
            }
        }

        if let Some(ref exe) = self.launch.executable
            && !exe.exists()
        {
            warnings.push(format!("launch.executable {} does not exist", exe.display()));
        }

        if self.logging.stderr_limit_bytes == 0 {
            warnings.push("logging.stderr_limit_bytes is 0; no output will be kept".to_string());
        }

        warnings
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.launch.stability_window_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.launch.grace_period_secs)
    }

    pub fn inter_attempt_delay(&self) -> Duration {
        Duration::from_millis(self.launch.inter_attempt_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostics.command_timeout_secs)
    }

    pub fn monitor_grace(&self) -> Duration {
        Duration::from_millis(self.diagnostics.monitor_grace_ms)
    }

    /// Directory holding one subdirectory per session.
    pub fn base_dir(&self) -> PathBuf {
        self.logging.base_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_NAME)
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.launch
            .lock_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("{}.lock", APP_NAME)))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // =========================================
    // Parsing and defaults
    // =========================================

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.launch.stability_window_secs, 10);
        assert_eq!(config.launch.max_attempts, 4);
        assert_eq!(config.launch.base_flags, vec!["--enable-logging=stderr", "--v=1"]);
        assert!(config.logging.enable_sqlite);
        assert!(config.logging.enable_json);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::parse(
            r#"
            [launch]
            max_attempts = 2
            extra_flags = ["--force-dark-mode"]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.launch.max_attempts, 2);
        assert_eq!(config.launch.extra_flags, vec!["--force-dark-mode"]);
        assert_eq!(config.launch.stability_window_secs, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.diagnostics.journal_lines, 200);
    }

    #[test]
    fn test_parse_clamps_out_of_range_values() {
        let config = AppConfig::parse(
            r#"
            [launch]
            stability_window_secs = 0
            max_attempts = 50
            grace_period_secs = 600

            [diagnostics]
            journal_lines = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.launch.stability_window_secs, 1);
        assert_eq!(config.launch.max_attempts, 10);
        assert_eq!(config.launch.grace_period_secs, 60);
        assert_eq!(config.diagnostics.journal_lines, 10);
    }

    #[test]
    fn test_parse_bounds_every_timeout() {
        let config = AppConfig::parse(
            r#"
            [launch]
            inter_attempt_delay_ms = 86400000

            [diagnostics]
            monitor_grace_ms = 86400000
            command_timeout_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.inter_attempt_delay(), Duration::from_secs(60));
        assert_eq!(config.monitor_grace(), Duration::from_secs(10));
        assert_eq!(config.command_timeout(), Duration::from_secs(1));

        let config = AppConfig::parse("[diagnostics]\ncommand_timeout_secs = 9999\n").unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_rejects_invalid_toml() {
        let err = AppConfig::parse("[launch\nmax_attempts = ").unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.launch.max_attempts = 3;
        config.logging.base_dir = Some(PathBuf::from("/var/tmp/ct"));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    // =========================================
    // Environment layer
    // =========================================

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = AppConfig::default();
        config.apply_env_from(env(&[
            ("CT_LAUNCH_TIMEOUT", "25"),
            ("CT_MAX_ATTEMPTS", "6"),
            ("CT_EXTRA_FLAGS", "--foo  --bar=1"),
            ("CT_ENABLE_SQLITE", "false"),
            ("CT_COLOR", "0"),
            ("CT_LOG_LEVEL", "DEBUG"),
            ("CT_BASE_DIR", "/srv/ct"),
        ]));

        assert_eq!(config.launch.stability_window_secs, 25);
        assert_eq!(config.launch.max_attempts, 6);
        assert_eq!(config.launch.extra_flags, vec!["--foo", "--bar=1"]);
        assert!(!config.logging.enable_sqlite);
        assert!(!config.logging.color);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.base_dir(), PathBuf::from("/srv/ct"));
    }

    #[test]
    fn test_env_values_are_clamped() {
        let mut config = AppConfig::default();
        config.apply_env_from(env(&[
            ("CT_LAUNCH_TIMEOUT", "9999"),
            ("CT_MAX_ATTEMPTS", "0"),
            ("CT_JOURNAL_LINES", "999999"),
        ]));

        assert_eq!(config.launch.stability_window_secs, 300);
        assert_eq!(config.launch.max_attempts, 1);
        assert_eq!(config.diagnostics.journal_lines, 10_000);
    }

    #[test]
    fn test_env_garbage_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_env_from(env(&[
            ("CT_LAUNCH_TIMEOUT", "soon"),
            ("CT_ENABLE_JSON", "maybe"),
        ]));

        assert_eq!(config.launch.stability_window_secs, 10);
        assert!(config.logging.enable_json);
    }

    #[test]
    fn test_chrome_path_fallback_variable() {
        let mut config = AppConfig::default();
        config.apply_env_from(env(&[("CHROME_PATH", "/opt/chrome/chrome")]));
        assert_eq!(
            config.launch.executable,
            Some(PathBuf::from("/opt/chrome/chrome"))
        );

        let mut config = AppConfig::default();
        config.apply_env_from(env(&[
            ("CHROME_PATH", "/opt/chrome/chrome"),
            ("CT_CHROME_PATH", "/usr/bin/chromium"),
        ]));
        assert_eq!(
            config.launch.executable,
            Some(PathBuf::from("/usr/bin/chromium"))
        );
    }

    // =========================================
    // Validation and derived values
    // =========================================

    #[test]
    fn test_validate_default_is_clean() {
        assert!(AppConfig::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_problems() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        config.logging.enable_json = false;
        config.logging.enable_sqlite = false;
        config.launch.extra_flags = vec!["disable-gpu".to_string()];

        let warnings = config.validate();
        assert_eq!(warnings.len(), 3, "Unexpected warnings: {:?}", warnings);
        assert!(warnings.iter().any(|w| w.contains("logging.level")));
        assert!(warnings.iter().any(|w| w.contains("durable sinks")));
        assert!(warnings.iter().any(|w| w.contains("disable-gpu")));
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.stability_window(), Duration::from_secs(10));
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.inter_attempt_delay(), Duration::from_millis(2000));
    }

    #[test]
    fn test_lock_path_default_is_in_temp_dir() {
        let config = AppConfig::default();
        assert_eq!(
            config.lock_path(),
            std::env::temp_dir().join("chrome-troubleshooter.lock")
        );
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
