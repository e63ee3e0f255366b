//! Audit trail records and the query/page shapes used to read them back.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParcelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Share,
    Claim,
    InvalidCode,
    DuplicateCode,
    ExpiredCode,
    Error,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Share => "share",
            Self::Claim => "claim",
            Self::InvalidCode => "invalid_code",
            Self::DuplicateCode => "duplicate_code",
            Self::ExpiredCode => "expired_code",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = ParcelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "share" => Ok(Self::Share),
            "claim" => Ok(Self::Claim),
            "invalid_code" => Ok(Self::InvalidCode),
            "duplicate_code" => Ok(Self::DuplicateCode),
            "expired_code" => Ok(Self::ExpiredCode),
            "error" => Ok(Self::Error),
            other => Err(ParcelError::validation(format!("unknown audit action '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
    /// Suspicious activity; needs a human look.
    Alert,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditLevel {
    type Err = ParcelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "alert" => Ok(Self::Alert),
            other => Err(ParcelError::validation(format!("unknown audit level '{other}'"))),
        }
    }
}

/// Request metadata of the caller that triggered an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub ip: String,
    pub user_agent: String,
}

impl ClientMeta {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// An event as submitted to the audit log, before id assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Stamped with the log's clock when `None`.
    pub timestamp: Option<DateTime<Utc>>,
    pub action: AuditAction,
    pub level: AuditLevel,
    pub actor_id: String,
    pub pickup_code: Option<String>,
    pub item_id: Option<String>,
    pub message: String,
    pub client: ClientMeta,
    pub status_code: Option<u16>,
    pub suspicious: bool,
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, level: AuditLevel, actor_id: &str, message: &str) -> Self {
        Self {
            timestamp: None,
            action,
            level,
            actor_id: actor_id.to_string(),
            pickup_code: None,
            item_id: None,
            message: message.to_string(),
            client: ClientMeta::default(),
            status_code: None,
            suspicious: false,
            reason: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.pickup_code = Some(code.to_string());
        self
    }

    pub fn with_item(mut self, item_id: &str) -> Self {
        self.item_id = Some(item_id.to_string());
        self
    }

    pub fn with_client(mut self, client: &ClientMeta) -> Self {
        self.client = client.clone();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn flagged(mut self, reason: impl Into<String>) -> Self {
        self.suspicious = true;
        self.reason = Some(reason.into());
        self
    }
}

/// A stored, append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub level: AuditLevel,
    pub actor_id: String,
    pub pickup_code: Option<String>,
    pub item_id: Option<String>,
    pub message: String,
    pub client: ClientMeta,
    pub status_code: Option<u16>,
    pub suspicious: bool,
    pub reason: Option<String>,
}

impl AuditRecord {
    pub fn from_event(event_id: u64, timestamp: DateTime<Utc>, ev: AuditEvent) -> Self {
        Self {
            event_id,
            timestamp,
            action: ev.action,
            level: ev.level,
            actor_id: ev.actor_id,
            pickup_code: ev.pickup_code,
            item_id: ev.item_id,
            message: ev.message,
            client: ev.client,
            status_code: ev.status_code,
            suspicious: ev.suspicious,
            reason: ev.reason,
        }
    }

    /// Rough heap footprint, for memory accounting.
    pub fn approx_size_bytes(&self) -> u64 {
        let strings = self.actor_id.len()
            + self.pickup_code.as_ref().map_or(0, String::len)
            + self.item_id.as_ref().map_or(0, String::len)
            + self.message.len()
            + self.client.ip.len()
            + self.client.user_agent.len()
            + self.reason.as_ref().map_or(0, String::len);
        (std::mem::size_of::<AuditRecord>() + strings) as u64
    }
}

/// Look-back window for audit queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "1h")]
    LastHour,
    #[serde(rename = "6h")]
    LastSixHours,
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[default]
    #[serde(rename = "all")]
    All,
}

impl TimeWindow {
    /// Oldest timestamp still inside the window, `None` for `All`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let span = match self {
            Self::LastHour => Duration::hours(1),
            Self::LastSixHours => Duration::hours(6),
            Self::LastDay => Duration::hours(24),
            Self::LastWeek => Duration::days(7),
            Self::All => return None,
        };
        Some(now - span)
    }
}

impl FromStr for TimeWindow {
    type Err = ParcelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::LastHour),
            "6h" => Ok(Self::LastSixHours),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "all" | "" => Ok(Self::All),
            other => Err(ParcelError::validation(format!("unknown time range '{other}'"))),
        }
    }
}

/// Filters and paging for [`AuditPage`] reads. Out-of-range paging values
/// are clamped by the log rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    /// 1-based; values below 1 read page 1.
    pub page: i64,
    /// Values below 1 select the default size; values above the max are capped.
    pub page_size: i64,
    pub action: Option<AuditAction>,
    pub level: Option<AuditLevel>,
    /// Case-insensitive substring of the actor id.
    pub actor: Option<String>,
    /// Case-insensitive substring of the pickup code.
    pub code: Option<String>,
    pub window: TimeWindow,
}

impl AuditQuery {
    pub fn page(page: i64, page_size: i64) -> Self {
        Self {
            page,
            page_size,
            ..Self::default()
        }
    }

    /// Whether `record` passes every filter. `cutoff` comes from
    /// [`TimeWindow::cutoff`] evaluated once per query.
    pub fn matches(&self, record: &AuditRecord, cutoff: Option<DateTime<Utc>>) -> bool {
        if self.action.is_some_and(|a| a != record.action) {
            return false;
        }
        if self.level.is_some_and(|l| l != record.level) {
            return false;
        }
        if let Some(needle) = non_empty(&self.actor) {
            if !contains_ignore_case(&record.actor_id, needle) {
                return false;
            }
        }
        if let Some(needle) = non_empty(&self.code) {
            match &record.pickup_code {
                Some(code) if contains_ignore_case(code, needle) => {}
                _ => return false,
            }
        }
        if let Some(cutoff) = cutoff {
            if record.timestamp < cutoff {
                return false;
            }
        }
        true
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// One page of audit records, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPage {
    /// Matching records across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub records: Vec<AuditRecord>,
}
