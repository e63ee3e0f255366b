//! Share / claim facade over the store, audit log and admission gate.
//!
//! Every request that reaches the store leaves exactly one audit record,
//! so attempt counters track real traffic on a code.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use parcel_common::audit::{AuditAction, AuditPage, AuditQuery, ClientMeta};
use parcel_common::clock::Clock;
use parcel_common::config::ItemConfig;
use parcel_common::error::{ParcelError, ParcelResult, StorageError};
use parcel_common::item::{format_item_id, ClaimOutcome, Durability, Item, PickupCode};

use crate::admission::{AdmissionController, AdmissionStatus};
use crate::audit::AuditLog;
use crate::codegen::CodeSource;
use crate::repository::ItemRepository;

pub const SHARE_OK_MESSAGE: &str = "Item shared successfully! Quack!";
pub const CLAIM_OK_MESSAGE: &str = "Item claimed successfully! Quack!";
pub const NOT_FOUND_MESSAGE: &str = "Item not found with this pickup code";
pub const ALREADY_CLAIMED_MESSAGE: &str = "Item has already been claimed";
pub const EXPIRED_MESSAGE: &str = "Item has expired";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShareRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub type_id: i32,
    #[serde(rename = "num")]
    pub quantity: i64,
    #[serde(default)]
    pub durability: Option<i64>,
    #[serde(default)]
    pub durability_loss: Option<i64>,
    #[serde(rename = "sharer_id")]
    pub owner_id: String,
}

/// Checked form of a [`ShareRequest`].
struct ValidShare {
    name: String,
    description: String,
    type_id: i32,
    quantity: u32,
    durability: Option<Durability>,
    owner_id: String,
}

impl ShareRequest {
    fn validate(self) -> ParcelResult<ValidShare> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ParcelError::validation("name is required"));
        }
        let owner_id = self.owner_id.trim();
        if owner_id.is_empty() {
            return Err(ParcelError::validation("sharer_id is required"));
        }
        if self.quantity < 1 {
            return Err(ParcelError::validation("num must be >= 1"));
        }
        let quantity = u32::try_from(self.quantity)
            .map_err(|_| ParcelError::validation("num is out of range"))?;
        let durability = match (self.durability, self.durability_loss) {
            (None, None) => None,
            (Some(value), Some(loss)) => Some(Durability {
                value: non_negative("durability", value)?,
                loss: non_negative("durability_loss", loss)?,
            }),
            _ => {
                return Err(ParcelError::validation(
                    "durability and durability_loss must be given together",
                ))
            }
        };
        Ok(ValidShare {
            name: name.to_string(),
            description: self.description,
            type_id: self.type_id,
            quantity,
            durability,
            owner_id: owner_id.to_string(),
        })
    }
}

fn non_negative(field: &str, value: i64) -> ParcelResult<u32> {
    if value < 0 {
        return Err(ParcelError::validation(format!("{field} must be >= 0")));
    }
    u32::try_from(value).map_err(|_| ParcelError::validation(format!("{field} is out of range")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareReceipt {
    pub message: String,
    pub pickup_code: PickupCode,
    pub expires_at: DateTime<Utc>,
    pub item_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub pickup_code: String,
    pub claimer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Success,
    InvalidRequest,
    NotFound,
    AlreadyClaimed,
    Expired,
    InternalFailure,
}

impl ClaimStatus {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Success => 200,
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::AlreadyClaimed => 409,
            Self::Expired => 410,
            Self::InternalFailure => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::AlreadyClaimed => "already_claimed",
            Self::Expired => "expired",
            Self::InternalFailure => "internal_failure",
        }
    }
}

/// Claim outcomes other than success are carried as a [`ParcelError`];
/// this is the status a caller sees for each.
impl From<&ParcelError> for ClaimStatus {
    fn from(err: &ParcelError) -> Self {
        match err {
            ParcelError::Validation(_) => Self::InvalidRequest,
            ParcelError::NotFound { .. } => Self::NotFound,
            ParcelError::Conflict { .. } => Self::AlreadyClaimed,
            ParcelError::Gone { .. } => Self::Expired,
            ParcelError::ResourceExhausted { .. }
            | ParcelError::Storage(_)
            | ParcelError::Internal(_) => Self::InternalFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub status: ClaimStatus,
    pub status_code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Item>,
}

impl ClaimResponse {
    fn new(status: ClaimStatus, message: impl Into<String>, item: Option<Item>) -> Self {
        Self {
            status,
            status_code: status.status_code(),
            message: message.into(),
            item,
        }
    }

    fn rejected(err: &ParcelError, message: impl Into<String>) -> Self {
        Self::new(ClaimStatus::from(err), message, None)
    }

    pub fn is_success(&self) -> bool {
        self.status == ClaimStatus::Success
    }
}

/// Advisory counters for the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub claimed: usize,
    pub live: usize,
    pub processed_last_hour: usize,
}

pub struct ParcelService {
    store: Arc<dyn ItemRepository>,
    audit: Arc<dyn AuditLog>,
    admission: Arc<AdmissionController>,
    codes: Arc<dyn CodeSource>,
    clock: Arc<dyn Clock>,
    config: ItemConfig,
}

impl ParcelService {
    pub fn new(
        store: Arc<dyn ItemRepository>,
        audit: Arc<dyn AuditLog>,
        admission: Arc<AdmissionController>,
        codes: Arc<dyn CodeSource>,
        clock: Arc<dyn Clock>,
        config: ItemConfig,
    ) -> Self {
        Self {
            store,
            audit,
            admission,
            codes,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ItemRepository> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Register a new item and hand back its pickup code.
    ///
    /// The admission gate is consulted first; a closed gate rejects the
    /// share before the request is even validated.
    pub fn share(&self, req: ShareRequest, client: &ClientMeta) -> ParcelResult<ShareReceipt> {
        if let Err(e) = self.admission.check_write() {
            self.audit.log_error(
                &req.owner_id,
                AuditAction::Share,
                &e.to_string(),
                e.status_code(),
                client,
            );
            return Err(e);
        }
        let share = req.validate()?;

        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.ttl_secs.min(i64::MAX as u64 / 1000) as i64);
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| ParcelError::Internal("item expiry overflows the calendar".into()))?;
        let item_id = format_item_id(now, &share.owner_id);

        let mut item = Item {
            id: item_id.clone(),
            name: share.name,
            description: share.description,
            type_id: share.type_id,
            quantity: share.quantity,
            durability: share.durability,
            sharer_id: share.owner_id.clone(),
            pickup_code: self.codes.generate(),
            created_at: now,
            expires_at,
            claimed: false,
            claimer_id: None,
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.store.create(item.clone()) {
                Ok(()) => break,
                Err(StorageError::DuplicateCode(code)) if attempts < self.config.max_code_attempts => {
                    tracing::debug!(code = %code, attempts, "pickup code collision, retrying");
                    item.pickup_code = self.codes.generate();
                }
                Err(StorageError::DuplicateCode(_)) => {
                    let err = ParcelError::Storage(StorageError::Unavailable(format!(
                        "no free pickup code after {attempts} attempts"
                    )));
                    tracing::error!(owner = %share.owner_id, attempts, "pickup code space exhausted");
                    self.audit.log_error(
                        &share.owner_id,
                        AuditAction::Share,
                        &err.to_string(),
                        err.status_code(),
                        client,
                    );
                    return Err(err);
                }
                Err(e) => {
                    let err = ParcelError::Storage(e).with_context("share");
                    tracing::error!(owner = %share.owner_id, error = %err, "share failed");
                    self.audit.log_error(
                        &share.owner_id,
                        AuditAction::Share,
                        &err.to_string(),
                        err.status_code(),
                        client,
                    );
                    return Err(err);
                }
            }
        }

        self.audit
            .log_share(&share.owner_id, item.pickup_code.as_str(), &item_id, client);
        parcel_observability::record_share();
        tracing::info!(
            item_id = %item_id,
            owner = %share.owner_id,
            expires_at = %expires_at,
            "item shared"
        );
        Ok(ShareReceipt {
            message: SHARE_OK_MESSAGE.to_string(),
            pickup_code: item.pickup_code,
            expires_at,
            item_id,
        })
    }

    /// Redeem a pickup code. Never fails: the outcome is carried in the
    /// response status.
    pub fn claim(&self, req: ClaimRequest, client: &ClientMeta) -> ClaimResponse {
        let response = self.claim_inner(req, client);
        parcel_observability::record_claim(response.status.as_str());
        response
    }

    fn claim_inner(&self, req: ClaimRequest, client: &ClientMeta) -> ClaimResponse {
        let claimer = req.claimer_id.trim();
        let code = match PickupCode::parse(&req.pickup_code) {
            Ok(code) if !claimer.is_empty() => code,
            Ok(_) => return self.reject_claim(claimer, "claimer_id is required", client),
            Err(e) => return self.reject_claim(claimer, &e.to_string(), client),
        };

        match self.store.claim(&code, claimer) {
            Ok(ClaimOutcome::Claimed(item)) => {
                self.audit
                    .log_claim(claimer, code.as_str(), Some(&item.id), true, client);
                tracing::info!(code = %code, claimer, item_id = %item.id, "item claimed");
                ClaimResponse::new(ClaimStatus::Success, CLAIM_OK_MESSAGE, Some(item))
            }
            Ok(ClaimOutcome::NotFound) => {
                self.audit.log_invalid_code(claimer, code.as_str(), client);
                let err = ParcelError::NotFound { code: code.to_string() };
                tracing::debug!(claimer, error = %err, "claim rejected");
                ClaimResponse::rejected(&err, NOT_FOUND_MESSAGE)
            }
            Ok(ClaimOutcome::AlreadyClaimed) => {
                self.audit.log_duplicate_code(claimer, code.as_str(), client);
                let err = ParcelError::Conflict { code: code.to_string() };
                tracing::debug!(claimer, error = %err, "claim rejected");
                ClaimResponse::rejected(&err, ALREADY_CLAIMED_MESSAGE)
            }
            Ok(ClaimOutcome::Expired) => {
                self.audit.log_expired_code(claimer, code.as_str(), client);
                let err = ParcelError::Gone { code: code.to_string() };
                tracing::debug!(claimer, error = %err, "claim rejected");
                ClaimResponse::rejected(&err, EXPIRED_MESSAGE)
            }
            Err(e) => {
                let err = ParcelError::Storage(e).with_context("claim");
                let message = format!("Failed to claim item: {err}");
                tracing::error!(code = %code, claimer, error = %err, "claim failed");
                let response = ClaimResponse::rejected(&err, message);
                self.audit.log_error(
                    claimer,
                    AuditAction::Claim,
                    &response.message,
                    response.status_code,
                    client,
                );
                response
            }
        }
    }

    fn reject_claim(&self, claimer: &str, reason: &str, client: &ClientMeta) -> ClaimResponse {
        let response = ClaimResponse::rejected(&ParcelError::validation(reason), reason);
        self.audit.log_error(
            claimer,
            AuditAction::Claim,
            reason,
            response.status_code,
            client,
        );
        response
    }

    pub fn memory_status(&self) -> AdmissionStatus {
        self.admission.status()
    }

    pub fn audit_page(&self, query: &AuditQuery) -> AuditPage {
        self.audit.query(query)
    }

    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let now = self.clock.now();
        let stats = StoreStats {
            total: self.store.total_count()?,
            claimed: self.store.claimed_count()?,
            live: self.store.list_live()?.len(),
            processed_last_hour: self
                .store
                .count_created_between(now - Duration::hours(1), now)?,
        };
        parcel_observability::record_item_counts(stats.total, stats.claimed);
        Ok(stats)
    }
}
