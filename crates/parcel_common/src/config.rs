use serde::{Deserialize, Serialize};

/// Top-level process configuration (`parcel.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParcelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub item: ItemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl ParcelConfig {
    /// Reject settings that would break store or gate invariants.
    pub fn validate(&self) -> Result<(), String> {
        self.item.validate()?;
        self.admission.validate()?;
        self.audit.validate()?;
        self.sweeper.validate()?;
        if self.storage.backend == StorageBackend::Snapshot
            && self.storage.snapshot_path.is_empty()
        {
            return Err("storage.snapshot_path must be set for the snapshot backend".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admin HTTP listen address (health, status, memory).
    pub admin_listen_addr: String,
    /// Prometheus exporter listen address. Empty disables the exporter.
    #[serde(default)]
    pub metrics_listen_addr: String,
    /// Upper bound in seconds on the final sweep + flush at shutdown.
    #[serde(default = "default_shutdown_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,
}

fn default_shutdown_drain_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_listen_addr: "0.0.0.0:8080".to_string(),
            metrics_listen_addr: String::new(),
            shutdown_drain_timeout_secs: default_shutdown_drain_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    /// Lifetime of a shared item in seconds. 86400 (1 day) by default;
    /// week-long deployments use 604800.
    pub ttl_secs: u64,
    /// Number of decimal digits in a pickup code.
    pub code_length: usize,
    /// Fresh codes tried before a share gives up on collisions.
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
}

fn default_max_code_attempts() -> u32 {
    8
}

/// Ten years.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

impl ItemConfig {
    fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 || self.ttl_secs > MAX_TTL_SECS {
            return Err(format!("item.ttl_secs must be in 1..={MAX_TTL_SECS}"));
        }
        if self.code_length == 0 || self.code_length > 18 {
            return Err("item.code_length must be in 1..=18".into());
        }
        if self.max_code_attempts == 0 {
            return Err("item.max_code_attempts must be >= 1".into());
        }
        Ok(())
    }
}

impl Default for ItemConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 3600,
            code_length: 6,
            max_code_attempts: default_max_code_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory only; everything is lost on restart.
    #[default]
    Memory,
    /// Memory plus a JSON snapshot file rewritten on every flush.
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Snapshot file, only read by the `snapshot` backend.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

fn default_snapshot_path() -> String {
    "./parcel_data/items_backup.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            snapshot_path: default_snapshot_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSourceKind {
    /// Bytes accounted by the store and the audit log.
    #[default]
    Tracked,
    /// Resident set size of the whole process (`VmRSS` in `/proc/self/status`).
    Process,
}

/// Memory-pressure write gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Usage ceiling in bytes. 0 disables admission control.
    pub memory_ceiling_bytes: u64,
    /// Close the gate when usage / ceiling reaches this ratio.
    pub disable_threshold: f64,
    /// Reopen a closed gate once usage / ceiling falls to this ratio.
    pub enable_threshold: f64,
    /// Sampler period in milliseconds.
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub usage_source: UsageSourceKind,
    /// Back-off hint returned with rejected shares.
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

fn default_retry_after_ms() -> u64 {
    5_000
}

impl AdmissionConfig {
    pub fn is_enabled(&self) -> bool {
        self.memory_ceiling_bytes > 0
    }

    fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(self.disable_threshold) || !in_unit(self.enable_threshold) {
            return Err("admission thresholds must be in (0, 1]".into());
        }
        if self.enable_threshold >= self.disable_threshold {
            return Err(format!(
                "admission.enable_threshold ({}) must be below disable_threshold ({})",
                self.enable_threshold, self.disable_threshold
            ));
        }
        if self.sample_interval_ms == 0 {
            return Err("admission.sample_interval_ms must be > 0".into());
        }
        Ok(())
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 1024 * 1024 * 1024,
            disable_threshold: 0.8,
            enable_threshold: 0.7,
            sample_interval_ms: 30_000,
            usage_source: UsageSourceKind::Tracked,
            retry_after_ms: default_retry_after_ms(),
        }
    }
}

/// Audit trail retention and suspicion tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record count that triggers trimming.
    pub capacity: usize,
    /// Newest records kept after a trim.
    pub trim_to: usize,
    /// Records older than this many days are pruned.
    pub retention_days: u32,
    /// Attempt counters idle for this many days are pruned.
    pub attempt_retention_days: u32,
    /// A claim is flagged once its code already has more attempts than this.
    pub suspicious_attempt_threshold: u64,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Where the retained trail is written at shutdown. Empty disables export.
    #[serde(default)]
    pub export_path: String,
}

impl AuditConfig {
    fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("audit.capacity must be >= 1".into());
        }
        if self.trim_to > self.capacity {
            return Err(format!(
                "audit.trim_to ({}) must not exceed audit.capacity ({})",
                self.trim_to, self.capacity
            ));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err("audit.default_page_size must be in 1..=max_page_size".into());
        }
        Ok(())
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            trim_to: 5_000,
            retention_days: 30,
            attempt_retention_days: 7,
            suspicious_attempt_threshold: 3,
            default_page_size: 10,
            max_page_size: 100,
            export_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Sweep + prune + flush period in seconds.
    pub fast_interval_secs: u64,
    /// Backstop sweep period in seconds.
    pub slow_interval_secs: u64,
}

impl SweeperConfig {
    fn validate(&self) -> Result<(), String> {
        if self.enabled && (self.fast_interval_secs == 0 || self.slow_interval_secs == 0) {
            return Err("sweeper intervals must be > 0".into());
        }
        Ok(())
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_interval_secs: 300,
            slow_interval_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ParcelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut cfg = ParcelConfig::default();
        cfg.admission.enable_threshold = 0.8;
        cfg.admission.disable_threshold = 0.7;
        assert!(cfg.validate().is_err());

        cfg.admission.enable_threshold = 0.8;
        cfg.admission.disable_threshold = 0.8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut cfg = ParcelConfig::default();
        cfg.item.ttl_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_code_length_rejected() {
        let mut cfg = ParcelConfig::default();
        cfg.item.code_length = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_trim_above_capacity_rejected() {
        let mut cfg = ParcelConfig::default();
        cfg.audit.capacity = 100;
        cfg.audit.trim_to = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_snapshot_backend_needs_path() {
        let mut cfg = ParcelConfig::default();
        cfg.storage.backend = StorageBackend::Snapshot;
        cfg.storage.snapshot_path.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_ceiling_disables_admission() {
        let mut cfg = AdmissionConfig::default();
        assert!(cfg.is_enabled());
        cfg.memory_ceiling_bytes = 0;
        assert!(!cfg.is_enabled());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: ParcelConfig = toml::from_str(
            r#"
[item]
ttl_secs = 604800
code_length = 6

[storage]
backend = "snapshot"
"#,
        )
        .unwrap();
        assert_eq!(cfg.item.ttl_secs, 604_800);
        assert_eq!(cfg.item.max_code_attempts, 8);
        assert_eq!(cfg.storage.backend, StorageBackend::Snapshot);
        assert_eq!(cfg.storage.snapshot_path, "./parcel_data/items_backup.json");
        assert_eq!(cfg.audit.capacity, 10_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_default_config_toml_roundtrip() {
        let text = toml::to_string_pretty(&ParcelConfig::default()).unwrap();
        let back: ParcelConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.admission.disable_threshold, 0.8);
        assert_eq!(back.sweeper.slow_interval_secs, 3600);
    }
}
