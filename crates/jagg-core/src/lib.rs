//! Core domain model for the job aggregation pipeline: canonical postings,
//! timestamp normalization and the reconcile-on-url merge rule.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jagg-core";

/// Title used when the upstream platform sends an empty one.
pub const UNTITLED_ROLE: &str = "(Untitled role)";

/// Location used when the upstream platform sends none.
pub const UNKNOWN_LOCATION: &str = "n/a";

/// Epoch values above this are millisecond-resolution.
pub const MILLIS_THRESHOLD: i64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Lever,
    Greenhouse,
}

impl Platform {
    /// Detection priority order.
    pub const ALL: [Platform; 2] = [Platform::Lever, Platform::Greenhouse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Lever => "lever",
            Platform::Greenhouse => "greenhouse",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown platform `{0}`")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lever" => Ok(Platform::Lever),
            "greenhouse" => Ok(Platform::Greenhouse),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

/// Canonical job posting. `url` is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub source: Platform,
    pub organization_key: String,
    pub title: String,
    pub location: String,
    pub url: String,
    pub remote: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub ts: i64,
}

impl JobPosting {
    pub fn id(&self) -> Uuid {
        posting_id(&self.url)
    }

    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty() && self.title != UNTITLED_ROLE
    }

    pub fn has_location(&self) -> bool {
        !self.location.trim().is_empty() && self.location != UNKNOWN_LOCATION
    }

    /// Reconcile an incoming copy of the same posting into `self`.
    ///
    /// Fields are only overwritten by non-empty incoming values. When neither
    /// side carries a timestamp the stored `ts` is kept, so a later pass with
    /// a newer wall-clock fallback does not reorder the record. Returns
    /// whether anything changed.
    pub fn merge_from(&mut self, incoming: &JobPosting) -> bool {
        let before = self.clone();

        self.source = incoming.source;
        if !incoming.organization_key.is_empty() {
            self.organization_key = incoming.organization_key.clone();
        }
        if incoming.has_title() {
            self.title = incoming.title.clone();
        }
        if incoming.has_location() {
            self.location = incoming.location.clone();
            self.remote = incoming.remote;
        } else if incoming.remote {
            self.remote = true;
        }
        if incoming.created_at > 0 {
            self.created_at = incoming.created_at;
        }
        if incoming.updated_at > 0 {
            self.updated_at = incoming.updated_at;
        }
        self.ts = ordering_ts(self.updated_at, self.created_at, self.ts);

        *self != before
    }
}

/// Deterministic posting id derived from its URL.
pub fn posting_id(url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes())
}

/// Adapter-side handoff before the canonical defaults and `ts` are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingDraft {
    pub title: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    /// Free text such as Lever's `workplaceType`, used only for remote inference.
    pub workplace_hint: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PostingDraft {
    /// Finalize into a canonical posting. Drafts without a URL are dropped.
    pub fn into_posting(
        self,
        source: Platform,
        organization_key: &str,
        fetched_at: DateTime<Utc>,
    ) -> Option<JobPosting> {
        let url = non_empty(self.url)?;
        let title = non_empty(self.title).unwrap_or_else(|| UNTITLED_ROLE.to_string());
        let location = non_empty(self.location).unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
        let remote = infer_remote(&[Some(location.as_str()), self.workplace_hint.as_deref()]);
        let created_at = self.created_at.max(0);
        let updated_at = self.updated_at.max(0);
        Some(JobPosting {
            source,
            organization_key: organization_key.to_string(),
            title,
            location,
            url,
            remote,
            created_at,
            updated_at,
            ts: ordering_ts(updated_at, created_at, fetched_at.timestamp()),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `updated_at`, else `created_at`, else the fallback (run wall clock).
pub fn ordering_ts(updated_at: i64, created_at: i64, fallback: i64) -> i64 {
    if updated_at > 0 {
        updated_at
    } else if created_at > 0 {
        created_at
    } else {
        fallback.max(0)
    }
}

pub fn infer_remote(texts: &[Option<&str>]) -> bool {
    texts
        .iter()
        .flatten()
        .any(|t| t.to_ascii_lowercase().contains("remote"))
}

/// Convert an upstream timestamp of any supported shape into unix seconds.
///
/// Accepts epoch seconds or milliseconds (as numbers or digit-only strings)
/// and ISO-8601 date-times. Anything else, including a missing value,
/// yields `0`.
pub fn normalize_timestamp(value: Option<&JsonValue>) -> i64 {
    match value {
        None | Some(JsonValue::Null) => 0,
        Some(JsonValue::Number(n)) => {
            if let Some(i) = n.as_i64() {
                normalize_epoch(i)
            } else {
                n.as_f64().map(normalize_epoch_f64).unwrap_or(0)
            }
        }
        Some(JsonValue::String(s)) => normalize_timestamp_str(s),
        Some(_) => 0,
    }
}

pub fn normalize_epoch(value: i64) -> i64 {
    let secs = if value > MILLIS_THRESHOLD {
        value / 1000
    } else {
        value
    };
    secs.max(0)
}

fn normalize_epoch_f64(value: f64) -> i64 {
    if !value.is_finite() {
        return 0;
    }
    let secs = if value > MILLIS_THRESHOLD as f64 {
        value / 1000.0
    } else {
        value
    };
    (secs.trunc() as i64).max(0)
}

pub fn normalize_timestamp_str(raw: &str) -> i64 {
    let s = raw.trim();
    if s.is_empty() {
        return 0;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().map(normalize_epoch).unwrap_or(0);
    }
    parse_iso8601(s).map(|dt| dt.timestamp().max(0)).unwrap_or(0)
}

fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    // No offset: assume UTC.
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
