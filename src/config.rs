use crate::alerts::{AlertRule, ChannelKind};
use crate::error::{MonitorError, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const MIN_LOG_RETENTION_DAYS: i64 = 90;
pub const MIN_SUMMARY_RETENTION_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub log_level: String,
    /// "text" or "json"
    pub log_format: String,
    /// SQLite database file
    pub storage_path: PathBuf,
    /// Prefix of the daily-rolled human readable mirror log
    pub text_log_path: PathBuf,
    pub log_retention_days: i64,
    pub summary_retention_days: i64,
    pub performance_threshold_multiplier: f64,
    pub error_rate_threshold: f64,
    pub error_rate_window_minutes: i64,
    /// Relative slope below which a trend is reported as stable
    pub trend_dead_band: f64,
    /// Upper bound for parameter / result snapshots
    pub max_snapshot_bytes: usize,
    /// Hour of day (UTC) for the retention sweep
    pub cleanup_hour: u32,
    pub webhook_url: Option<String>,
    pub writer: WriterConfig,
    /// Explicit rules; when absent the built-in rules are derived from the
    /// thresholds above
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Vec<AlertRule>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 100,
            max_retries: 5,
            retry_base_ms: 100,
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            storage_path: PathBuf::from("data/monitoring.db"),
            text_log_path: PathBuf::from("data/monitoring.log"),
            log_retention_days: MIN_LOG_RETENTION_DAYS,
            summary_retention_days: MIN_SUMMARY_RETENTION_DAYS,
            performance_threshold_multiplier: 1.5,
            error_rate_threshold: 0.1,
            error_rate_window_minutes: 10,
            trend_dead_band: 0.05,
            max_snapshot_bytes: 200,
            cleanup_hour: 3,
            webhook_url: None,
            writer: WriterConfig::default(),
            alerts: None,
        }
    }
}

impl MonitorConfig {
    /// Directory holding the database, emergency log and alert log
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Rules in effect for this snapshot
    pub fn alert_rules(&self) -> Vec<AlertRule> {
        match &self.alerts {
            Some(rules) => rules.clone(),
            None => AlertRule::defaults(
                self.performance_threshold_multiplier,
                self.error_rate_threshold,
                self.error_rate_window_minutes,
            ),
        }
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.storage_path.display())
    }

    pub fn emergency_log_path(&self) -> PathBuf {
        self.storage_dir().join("emergency.log")
    }

    pub fn alert_log_path(&self) -> PathBuf {
        self.storage_dir().join("alerts.log")
    }
}

/// Environment overrides (`CALLWATCH_LOG_LEVEL`, `CALLWATCH_STORAGE_PATH`, ...)
///
/// Kept snake_case because the `config` crate lowercases environment keys.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    log_level: Option<String>,
    log_format: Option<String>,
    storage_path: Option<PathBuf>,
    text_log_path: Option<PathBuf>,
    log_retention_days: Option<i64>,
    summary_retention_days: Option<i64>,
    webhook_url: Option<String>,
}

fn apply_env_overrides(cfg: &mut MonitorConfig) -> Result<()> {
    let env = config::Config::builder()
        .add_source(config::Environment::with_prefix("CALLWATCH").try_parsing(true))
        .build()?;
    let overrides: EnvOverrides = env.try_deserialize()?;

    if let Some(v) = overrides.log_level {
        cfg.log_level = v;
    }
    if let Some(v) = overrides.log_format {
        cfg.log_format = v;
    }
    if let Some(v) = overrides.storage_path {
        cfg.storage_path = v;
    }
    if let Some(v) = overrides.text_log_path {
        cfg.text_log_path = v;
    }
    if let Some(v) = overrides.log_retention_days {
        cfg.log_retention_days = v;
    }
    if let Some(v) = overrides.summary_retention_days {
        cfg.summary_retention_days = v;
    }
    if let Some(v) = overrides.webhook_url {
        cfg.webhook_url = Some(v);
    }
    Ok(())
}

/// Parse a JSON configuration document and validate it
pub fn parse_config(json: &str) -> Result<MonitorConfig> {
    let cfg: MonitorConfig = serde_json::from_str(json)
        .map_err(|e| MonitorError::ConfigValidation(format!("malformed configuration: {}", e)))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Load configuration from a JSON file plus environment overrides
///
/// A missing file yields the documented defaults.
pub fn load_config(path: &Path) -> Result<MonitorConfig> {
    let mut cfg = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str::<MonitorConfig>(&raw).map_err(|e| {
            MonitorError::ConfigValidation(format!("{}: malformed configuration: {}", path.display(), e))
        })?
    } else {
        info!(path = %path.display(), "Configuration file not found, using defaults");
        MonitorConfig::default()
    };

    apply_env_overrides(&mut cfg)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn validate_config(cfg: &MonitorConfig) -> Result<()> {
    fn reject(msg: String) -> Result<()> {
        Err(MonitorError::ConfigValidation(msg))
    }

    match cfg.log_level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => return reject(format!("logLevel '{}' is not one of trace/debug/info/warn/error", other)),
    }

    if cfg.log_format != "text" && cfg.log_format != "json" {
        return reject(format!("logFormat '{}' must be 'text' or 'json'", cfg.log_format));
    }

    if cfg.storage_path.as_os_str().is_empty() {
        return reject("storagePath cannot be empty".to_string());
    }

    if cfg.log_retention_days < MIN_LOG_RETENTION_DAYS {
        return reject(format!(
            "logRetentionDays must be >= {} (got {})",
            MIN_LOG_RETENTION_DAYS, cfg.log_retention_days
        ));
    }

    if cfg.summary_retention_days < MIN_SUMMARY_RETENTION_DAYS {
        return reject(format!(
            "summaryRetentionDays must be >= {} (got {})",
            MIN_SUMMARY_RETENTION_DAYS, cfg.summary_retention_days
        ));
    }

    if cfg.summary_retention_days < cfg.log_retention_days {
        return reject("summaryRetentionDays must not be shorter than logRetentionDays".to_string());
    }

    if !cfg.performance_threshold_multiplier.is_finite() || cfg.performance_threshold_multiplier <= 1.0 {
        return reject(format!(
            "performanceThresholdMultiplier must be > 1.0 (got {})",
            cfg.performance_threshold_multiplier
        ));
    }

    if !(cfg.error_rate_threshold > 0.0 && cfg.error_rate_threshold <= 1.0) {
        return reject(format!(
            "errorRateThreshold must be in (0, 1] (got {})",
            cfg.error_rate_threshold
        ));
    }

    if cfg.error_rate_window_minutes <= 0 {
        return reject("errorRateWindowMinutes must be positive".to_string());
    }

    if !cfg.trend_dead_band.is_finite() || cfg.trend_dead_band < 0.0 {
        return reject("trendDeadBand must be a non-negative number".to_string());
    }

    if cfg.max_snapshot_bytes == 0 {
        return reject("maxSnapshotBytes must be positive".to_string());
    }

    if cfg.cleanup_hour > 23 {
        return reject(format!("cleanupHour must be 0-23 (got {})", cfg.cleanup_hour));
    }

    if cfg.writer.batch_size == 0 || cfg.writer.flush_interval_ms == 0 {
        return reject("writer.batchSize and writer.flushIntervalMs must be positive".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for rule in &cfg.alert_rules() {
        if rule.name.trim().is_empty() {
            return reject("alert rule name cannot be empty".to_string());
        }
        if !seen.insert(rule.name.as_str()) {
            return reject(format!("duplicate alert rule '{}'", rule.name));
        }
        if rule.window_minutes <= 0 {
            return reject(format!("alert '{}': windowMinutes must be positive", rule.name));
        }
        if rule.cooldown_minutes < 0 {
            return reject(format!("alert '{}': cooldownMinutes cannot be negative", rule.name));
        }
        if !rule.threshold.is_finite() {
            return reject(format!("alert '{}': threshold must be finite", rule.name));
        }
        if rule.channels.is_empty() {
            return reject(format!("alert '{}' has no notification channels", rule.name));
        }
        if rule.channels.contains(&ChannelKind::Webhook) && cfg.webhook_url.is_none() {
            return reject(format!(
                "alert '{}' uses the webhook channel but webhookUrl is not set",
                rule.name
            ));
        }
    }

    Ok(())
}

/// Process-wide configuration state
///
/// Readers take a complete snapshot with [`ConfigManager::current`]; reloads
/// validate first and then swap the whole snapshot atomically.
pub struct ConfigManager {
    path: Option<PathBuf>,
    current: ArcSwap<MonitorConfig>,
    notify: watch::Sender<Arc<MonitorConfig>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigManager {
    /// Load, validate and activate the configuration at `path`
    ///
    /// Writes the defaults to `path` when the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let existed = path.exists();
        let cfg = load_config(&path)?;

        let manager = Self::build(Some(path.clone()), cfg);
        if !existed {
            if let Err(e) = manager.save() {
                warn!(path = %path.display(), error = %e, "Failed to write default configuration");
            }
        }
        *manager.last_modified.lock().unwrap_or_else(|p| p.into_inner()) = modified_time(&path);
        Ok(manager)
    }

    /// Activate an in-memory configuration (no backing file)
    pub fn from_config(cfg: MonitorConfig) -> Result<Self> {
        validate_config(&cfg)?;
        Ok(Self::build(None, cfg))
    }

    fn build(path: Option<PathBuf>, cfg: MonitorConfig) -> Self {
        let snapshot = Arc::new(cfg);
        let (notify, _) = watch::channel(snapshot.clone());
        Self {
            path,
            current: ArcSwap::new(snapshot),
            notify,
            last_modified: Mutex::new(None),
        }
    }

    /// Complete snapshot of the active configuration
    pub fn current(&self) -> Arc<MonitorConfig> {
        self.current.load_full()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Receive every snapshot that gets activated
    pub fn subscribe(&self) -> watch::Receiver<Arc<MonitorConfig>> {
        self.notify.subscribe()
    }

    /// Validate and atomically activate a new configuration
    ///
    /// On failure the previously active snapshot stays in place.
    pub fn apply(&self, cfg: MonitorConfig) -> Result<Arc<MonitorConfig>> {
        if let Err(e) = validate_config(&cfg) {
            error!(error = %e, "Rejecting configuration, keeping the active snapshot");
            return Err(e);
        }

        let snapshot = Arc::new(cfg);
        self.current.store(snapshot.clone());
        self.notify.send_replace(snapshot.clone());
        info!(
            log_level = %snapshot.log_level,
            alert_rules = snapshot.alert_rules().len(),
            "Configuration activated"
        );
        Ok(snapshot)
    }

    /// Re-read the backing file and activate it if valid
    pub fn reload(&self) -> Result<Arc<MonitorConfig>> {
        let Some(path) = &self.path else {
            return Ok(self.current());
        };

        info!(path = %path.display(), "Reloading configuration");
        let cfg = match load_config(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "Configuration reload rejected, keeping the active snapshot");
                return Err(e);
            }
        };
        *self.last_modified.lock().unwrap_or_else(|p| p.into_inner()) = modified_time(path);
        self.apply(cfg)
    }

    /// Persist the active snapshot as pretty JSON
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self.current().as_ref())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reload whenever the backing file's modification time changes
    pub fn spawn_watcher(self: Arc<Self>, poll_interval: Duration) -> Option<tokio::task::JoinHandle<()>> {
        let path = self.path.clone()?;

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let modified = modified_time(&path);
                let changed = {
                    let last = self.last_modified.lock().unwrap_or_else(|p| p.into_inner());
                    modified.is_some() && modified != *last
                };

                if changed {
                    info!(path = %path.display(), "Configuration file changed");
                    // A rejected reload leaves the old snapshot active; remember the
                    // mtime so the same broken file is not retried every tick.
                    if self.reload().is_err() {
                        *self.last_modified.lock().unwrap_or_else(|p| p.into_inner()) = modified;
                    }
                }
            }
        }))
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = MonitorConfig::default();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.alert_rules().len(), 3);
    }

    #[test]
    fn test_validate_rejects_short_retention() {
        let mut cfg = MonitorConfig::default();
        cfg.log_retention_days = 30;

        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("logRetentionDays must be >= 90"));
    }

    #[test]
    fn test_validate_rejects_webhook_without_url() {
        let mut cfg = MonitorConfig::default();
        let mut rules = cfg.alert_rules();
        rules[0].channels.push(ChannelKind::Webhook);
        cfg.alerts = Some(rules);

        let result = validate_config(&cfg);
        assert!(result.unwrap_err().to_string().contains("webhookUrl"));
    }

    #[test]
    fn test_parse_camel_case_document() {
        let cfg = parse_config(
            r#"{
                "logLevel": "debug",
                "storagePath": "/tmp/x/monitor.db",
                "logRetentionDays": 120,
                "summaryRetentionDays": 400,
                "errorRateThreshold": 0.2
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.log_retention_days, 120);
        assert_eq!(cfg.error_rate_threshold, 0.2);
        assert_eq!(cfg.storage_dir(), PathBuf::from("/tmp/x"));
        // Unspecified fields fall back to defaults
        assert_eq!(cfg.performance_threshold_multiplier, 1.5);
    }

    #[test]
    fn test_rejected_apply_keeps_previous_snapshot() {
        let manager = ConfigManager::from_config(MonitorConfig::default()).unwrap();

        let mut bad = MonitorConfig::default();
        bad.log_retention_days = -5;
        assert!(manager.apply(bad).is_err());
        assert_eq!(manager.current().log_retention_days, 90);

        let mut good = MonitorConfig::default();
        good.log_retention_days = 180;
        manager.apply(good).unwrap();
        assert_eq!(manager.current().log_retention_days, 180);
    }

    #[test]
    fn test_load_missing_file_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitoring_config.json");

        let manager = ConfigManager::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(manager.current().log_retention_days, MIN_LOG_RETENTION_DAYS);

        let written: MonitorConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.alerts.is_none());
        assert_eq!(written.alert_rules().len(), 3);
    }

    fn rule_threshold(cfg: &MonitorConfig, name: &str) -> f64 {
        cfg.alert_rules()
            .into_iter()
            .find(|r| r.name == name)
            .map(|r| r.threshold)
            .unwrap()
    }

    #[test]
    fn test_default_rules_follow_configured_thresholds() {
        let cfg = parse_config(r#"{"errorRateThreshold": 0.5, "performanceThresholdMultiplier": 3.0}"#).unwrap();
        assert_eq!(rule_threshold(&cfg, "high_error_rate"), 0.5);
        assert_eq!(rule_threshold(&cfg, "performance_degradation"), 3.0);

        let manager = ConfigManager::from_config(MonitorConfig::default()).unwrap();
        let mut updated = MonitorConfig::default();
        updated.error_rate_threshold = 0.25;
        updated.error_rate_window_minutes = 30;
        manager.apply(updated).unwrap();

        let rules = manager.current().alert_rules();
        let error_rule = rules.iter().find(|r| r.name == "high_error_rate").unwrap();
        assert_eq!(error_rule.threshold, 0.25);
        assert_eq!(error_rule.window_minutes, 30);
    }

    #[test]
    fn test_explicit_rules_replace_defaults() {
        let cfg = parse_config(
            r#"{
                "errorRateThreshold": 0.5,
                "alerts": [{
                    "name": "slow_scoring",
                    "condition": { "type": "latency_above" },
                    "comparison": "gt",
                    "threshold": 2500,
                    "windowMinutes": 15,
                    "channels": ["console"]
                }]
            }"#,
        )
        .unwrap();
        let rules = cfg.alert_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "slow_scoring");
    }

    #[test]
    fn test_reload_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitoring_config.json");
        std::fs::write(&path, r#"{"logRetentionDays": 100}"#).unwrap();

        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.current().log_retention_days, 100);

        std::fs::write(&path, r#"{"logRetentionDays": -1}"#).unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.current().log_retention_days, 100);

        std::fs::write(&path, r#"{"logRetentionDays": 200}"#).unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.current().log_retention_days, 200);
    }

    #[tokio::test]
    async fn test_subscribers_see_new_snapshot() {
        let manager = ConfigManager::from_config(MonitorConfig::default()).unwrap();
        let mut rx = manager.subscribe();

        let mut cfg = MonitorConfig::default();
        cfg.log_level = "debug".to_string();
        manager.apply(cfg).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().log_level, "debug");
    }
}
