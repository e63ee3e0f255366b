//! Shared item records and the outcome of a claim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParcelError, ParcelResult};

/// Short decimal code handed to the sharer and presented by the claimer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PickupCode(String);

impl PickupCode {
    /// Wrap a generator-produced code without checking it.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Parse caller input. Surrounding whitespace is ignored; an empty code
    /// is a validation error.
    pub fn parse(input: &str) -> ParcelResult<Self> {
        let code = input.trim();
        if code.is_empty() {
            return Err(ParcelError::validation("pickup code is required"));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PickupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PickupCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Item wear: both values are recorded or neither is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Durability {
    pub value: u32,
    pub loss: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub description: String,
    pub type_id: i32,
    pub quantity: u32,
    pub durability: Option<Durability>,
    pub sharer_id: String,
    pub pickup_code: PickupCode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub claimed: bool,
    #[serde(default)]
    pub claimer_id: Option<String>,
}

impl Item {
    /// An item stays redeemable through the instant `expires_at` itself.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Eligible for removal by a sweep at `now`.
    pub fn is_sweepable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Rough heap footprint, for memory accounting.
    pub fn approx_size_bytes(&self) -> u64 {
        let strings = self.id.len()
            + self.name.len()
            + self.description.len()
            + self.sharer_id.len()
            + 2 * self.pickup_code.as_str().len()
            + self.claimer_id.as_ref().map_or(0, String::len);
        (std::mem::size_of::<Item>() + strings) as u64
    }
}

/// `<created_at as YYYYMMDDHHMMSS><sharer_id>`.
pub fn format_item_id(created_at: DateTime<Utc>, sharer_id: &str) -> String {
    format!("{}{}", created_at.format("%Y%m%d%H%M%S"), sharer_id)
}

/// Result of a single claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller won; carries the item as it looks after the claim.
    Claimed(Item),
    AlreadyClaimed,
    NotFound,
    /// The record had expired; it has been removed.
    Expired,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed(_) => "claimed",
            ClaimOutcome::AlreadyClaimed => "already_claimed",
            ClaimOutcome::NotFound => "not_found",
            ClaimOutcome::Expired => "expired",
        }
    }
}
