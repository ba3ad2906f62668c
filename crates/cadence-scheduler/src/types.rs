use cadence_core::types::{ItemId, OwnerId, Platform};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db::is_storable,
    error::{Result, SchedulerError},
};

/// How far in the past a requested schedule time may be before create rejects it.
pub const SCHEDULE_GRACE_SECS: i64 = 60;

/// Unit applied to `Custom` intervals when the caller does not supply one (hours).
pub const DEFAULT_CUSTOM_UNIT_SECS: u64 = 3_600;

/// One-shot items publish once; recurring items re-arm after every success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    OneShot,
    Recurring,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemKind::OneShot => "one_shot",
            ItemKind::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_shot" => Ok(ItemKind::OneShot),
            "recurring" => Ok(ItemKind::Recurring),
            other => Err(format!("unknown item kind: {other}")),
        }
    }
}

/// Lifecycle state of a schedule item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Created and waiting for its first run.
    Pending,
    /// Recurring item armed for its next occurrence.
    Active,
    /// Recurring item suspended by its owner; `next_run_at` is frozen.
    Paused,
    /// Claimed by a scanner; a publish worker owns it.
    InFlight,
    /// Retry budget for the current occurrence is exhausted.
    Failed,
    /// Published (one-shot) or recurrence window exhausted.
    Completed,
    /// Cancelled by its owner. Sticky.
    Cancelled,
}

impl ItemStatus {
    /// Completed and Cancelled never change again (short of deletion).
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Cancelled)
    }

    /// States the scanner may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Active => "active",
            ItemStatus::Paused => "paused",
            ItemStatus::InFlight => "in_flight",
            ItemStatus::Failed => "failed",
            ItemStatus::Completed => "completed",
            ItemStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "active" => Ok(ItemStatus::Active),
            "paused" => Ok(ItemStatus::Paused),
            "in_flight" => Ok(ItemStatus::InFlight),
            "failed" => Ok(ItemStatus::Failed),
            "completed" => Ok(ItemStatus::Completed),
            "cancelled" => Ok(ItemStatus::Cancelled),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

/// Defines how often a recurring item fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    /// A single occurrence; the item completes after its first success.
    Once,
    /// Every `interval` days.
    Daily,
    /// Every `interval` weeks, same weekday and time of day.
    Weekly,
    /// Every `interval` calendar months, day clamped to the month's length.
    Monthly,
    /// Every `interval` × `unit_secs`.
    Custom,
}

impl std::fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecurrencePattern::Once => "once",
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RecurrencePattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(RecurrencePattern::Once),
            "daily" => Ok(RecurrencePattern::Daily),
            "weekly" => Ok(RecurrencePattern::Weekly),
            "monthly" => Ok(RecurrencePattern::Monthly),
            "custom" => Ok(RecurrencePattern::Custom),
            other => Err(format!("unknown recurrence pattern: {other}")),
        }
    }
}

/// Recurrence rule carried by recurring items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub pattern: RecurrencePattern,
    /// Positive multiplier applied to the pattern's unit.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Length of one `Custom` unit in seconds. Ignored by other patterns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_secs: Option<u64>,
    /// No occurrence is generated after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
}

fn default_interval() -> u32 {
    1
}

impl Recurrence {
    pub fn new(pattern: RecurrencePattern, interval: u32) -> Self {
        Self {
            pattern,
            interval,
            unit_secs: None,
            end_at: None,
        }
    }

    pub fn until(mut self, end_at: DateTime<Utc>) -> Self {
        self.end_at = Some(end_at);
        self
    }

    pub fn with_unit_secs(mut self, secs: u64) -> Self {
        self.unit_secs = Some(secs);
        self
    }

    /// Effective `Custom` unit.
    pub fn unit(&self) -> Duration {
        let secs = self.unit_secs.unwrap_or(DEFAULT_CUSTOM_UNIT_SECS);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
    }

    fn validate(&self, first_run: DateTime<Utc>) -> Result<()> {
        if self.interval == 0 {
            return Err(SchedulerError::Validation(
                "recurrence interval must be at least 1".into(),
            ));
        }
        if self.pattern == RecurrencePattern::Custom && self.unit_secs == Some(0) {
            return Err(SchedulerError::Validation(
                "custom recurrence unit must be at least 1 second".into(),
            ));
        }
        if let Some(end) = self.end_at {
            if !is_storable(end) {
                return Err(SchedulerError::Validation(
                    "recurrence end must be no later than 9999-12-31".into(),
                ));
            }
            if end <= first_run {
                return Err(SchedulerError::Validation(
                    "recurrence end must be after the first scheduled run".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A persisted publication request.
///
/// The claim token is not part of this type; it never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: ItemId,
    pub owner_id: OwnerId,
    pub content: String,
    pub media_refs: Vec<String>,
    pub platforms: Vec<Platform>,
    pub kind: ItemKind,
    pub status: ItemStatus,
    /// Next (or only) execution time; `None` once completed or cancelled.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Nominal time of the current occurrence; the recurrence anchor.
    pub occurrence_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
    pub occurrence_count: u32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduleItem {
    pub fn is_recurring(&self) -> bool {
        self.kind == ItemKind::Recurring
    }
}

/// An item won by a scanner, together with the token proving ownership.
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub item: ScheduleItem,
    pub claim_token: String,
    /// Status to fall back to if dispatch fails or the attempt is retried.
    pub pre_claim_status: ItemStatus,
}

/// Owner request to create an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewItem {
    pub owner_id: OwnerId,
    pub content: String,
    #[serde(default)]
    pub media_refs: Vec<String>,
    pub platforms: Vec<Platform>,
    pub schedule_time: DateTime<Utc>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

impl NewItem {
    pub fn one_shot(
        owner_id: impl Into<OwnerId>,
        content: &str,
        platforms: &[&str],
        schedule_time: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            content: content.to_string(),
            media_refs: Vec::new(),
            platforms: platforms.iter().map(|p| Platform::new(p)).collect(),
            schedule_time,
            recurrence: None,
        }
    }

    pub fn recurring(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_media(mut self, refs: &[&str]) -> Self {
        self.media_refs = refs.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Check the request and normalise its platform list.
    pub(crate) fn validate(mut self, now: DateTime<Utc>) -> Result<Self> {
        if self.owner_id.as_str().trim().is_empty() {
            return Err(SchedulerError::Validation("owner_id is required".into()));
        }
        validate_content(&self.content)?;
        self.platforms = normalise_platforms(&self.platforms)?;
        check_schedule_time(self.schedule_time, now)?;
        if let Some(rec) = &self.recurrence {
            rec.validate(self.schedule_time)?;
        }
        Ok(self)
    }
}

/// Owner request to edit a pending item. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_refs: Option<Vec<String>>,
    #[serde(default)]
    pub platforms: Option<Vec<Platform>>,
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
    /// Replaces the recurrence rule; turns a one-shot item into a recurring one.
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

impl ItemUpdate {
    /// Merge into `item`, validating the result as a whole.
    pub(crate) fn apply_to(self, item: &mut ScheduleItem, now: DateTime<Utc>) -> Result<()> {
        if let Some(content) = self.content {
            validate_content(&content)?;
            item.content = content;
        }
        if let Some(refs) = self.media_refs {
            item.media_refs = refs;
        }
        if let Some(platforms) = self.platforms {
            item.platforms = normalise_platforms(&platforms)?;
        }
        if let Some(at) = self.schedule_time {
            check_schedule_time(at, now)?;
            item.next_run_at = Some(at);
            item.occurrence_at = Some(at);
        }
        if let Some(rec) = self.recurrence {
            item.kind = ItemKind::Recurring;
            item.recurrence = Some(rec);
        }
        if let (Some(rec), Some(first)) = (&item.recurrence, item.next_run_at) {
            rec.validate(first)?;
        }
        Ok(())
    }
}

fn check_schedule_time(at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if at < now - Duration::seconds(SCHEDULE_GRACE_SECS) {
        return Err(SchedulerError::Validation(
            "schedule_time must not be in the past".into(),
        ));
    }
    if !is_storable(at) {
        return Err(SchedulerError::Validation(
            "schedule_time must be no later than 9999-12-31".into(),
        ));
    }
    Ok(())
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(SchedulerError::Validation("content must not be empty".into()));
    }
    Ok(())
}

/// Lowercase, drop duplicates (first occurrence wins), reject empties.
fn normalise_platforms(platforms: &[Platform]) -> Result<Vec<Platform>> {
    let mut out: Vec<Platform> = Vec::with_capacity(platforms.len());
    for p in platforms {
        let p = Platform::new(p.as_str());
        if p.is_empty() {
            return Err(SchedulerError::Validation(
                "platform identifiers must not be empty".into(),
            ));
        }
        if !out.contains(&p) {
            out.push(p);
        }
    }
    if out.is_empty() {
        return Err(SchedulerError::Validation(
            "at least one platform is required".into(),
        ));
    }
    Ok(out)
}

/// Filter for listing items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemFilter {
    pub owner_id: Option<OwnerId>,
    pub status: Option<ItemStatus>,
}

/// Per-status counts plus the total number of publications produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStats {
    pub total: u64,
    pub pending: u64,
    pub active: u64,
    pub paused: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub total_published: u64,
}

/// Result of publishing one occurrence to one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform: Platform,
    /// Identifier the platform assigned to the post, when it reports one.
    pub external_post_id: Option<String>,
    /// `None` on success.
    pub error: Option<String>,
}

impl PlatformResult {
    pub fn ok(platform: Platform, external_post_id: Option<String>) -> Self {
        Self {
            platform,
            external_post_id,
            error: None,
        }
    }

    pub fn failed(platform: Platform, error: impl Into<String>) -> Self {
        Self {
            platform,
            external_post_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One row of the publish attempt log: the result of one platform call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAttempt {
    pub id: i64,
    pub item_id: ItemId,
    /// Occurrence number this attempt belonged to (1-based).
    pub occurrence: u32,
    /// Attempt number within the occurrence (1-based).
    pub attempt: u32,
    pub platform: Platform,
    pub success: bool,
    pub external_post_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
