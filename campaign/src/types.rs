use serde::{Deserialize, Serialize};

/// The lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CampaignStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed")]
    Failed,
}

impl CampaignStatus {
    /// Terminal statuses admit no further transitions other
    /// than the reconciler marking a campaign as failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }
}

/// How contacts within a campaign are prioritised relative to each other.
/// This is configuration surfaced to the authoring tier; the admission
/// fairness ratio itself is deployment-level configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PriorityMode {
    #[serde(rename = "weighted")]
    #[default]
    Weighted,
    #[serde(rename = "highFirst")]
    HighFirst,
}

/// The priority class of a contact, which selects the waitlist
/// the contact is queued on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Priority {
    #[serde(rename = "high")]
    High,
    #[serde(rename = "normal")]
    Normal,
}

impl Priority {
    /// Single-character prefix used when a priority class needs to be
    /// encoded alongside an id (e.g. reservation ledger members).
    pub fn prefix(&self) -> &'static str {
        match self {
            Priority::High => "H",
            Priority::Normal => "N",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Priority> {
        match prefix {
            "H" => Some(Priority::High),
            "N" => Some(Priority::Normal),
            _ => None,
        }
    }
}

/// The per-campaign retry behaviour configured by the campaign author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// When true, voicemail outcomes are terminal instead of retryable.
    pub exclude_voicemail: bool,
    /// When true, retry fire times are clamped to the next allowed
    /// calling window.
    pub respect_off_peak_hours: bool,
    /// The hour of day (0-23, UTC) at which the off-peak window begins.
    pub off_peak_start_hour: u8,
    /// The hour of day (0-23, UTC) at which the off-peak window ends.
    pub off_peak_end_hour: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            exclude_voicemail: false,
            respect_off_peak_hours: false,
            off_peak_start_hour: 21,
            off_peak_end_hour: 8,
        }
    }
}

/// A campaign as persisted in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    /// The maximum number of simultaneous in-flight calls for the
    /// campaign across all workers. Must be at least 1.
    pub limit: u32,
    pub status: CampaignStatus,
    pub priority_mode: PriorityMode,
    pub retry_policy: RetryPolicy,
    /// Reference to the AI agent configuration used for calls
    /// placed by this campaign.
    pub agent_ref: String,
    /// Reference to the pool of outbound caller numbers.
    pub phone_pool_ref: String,
    /// When set, the campaign activates once this time elapses.
    /// UNIX timestamp in milliseconds.
    pub scheduled_for: Option<u64>,
    /// Monotonic version bumped on every status change, used for
    /// idempotent updates.
    pub version: u64,
}

/// The status of a contact within a campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContactStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "calling")]
    Calling,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "voicemail")]
    Voicemail,
    #[serde(rename = "skipped")]
    Skipped,
}

impl ContactStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContactStatus::Completed
                | ContactStatus::Failed
                | ContactStatus::Voicemail
                | ContactStatus::Skipped
        )
    }
}

/// A contact as persisted in the durable store.
/// Contacts are unique per `(campaign_id, phone_number)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub campaign_id: String,
    /// E.164 formatted phone number.
    pub phone_number: String,
    pub priority: Priority,
    pub status: ContactStatus,
    pub retry_count: u32,
    /// UNIX timestamp in milliseconds of the next scheduled retry,
    /// if one is pending.
    pub next_retry_at: Option<u64>,
    pub failure_reason: Option<String>,
    pub version: u64,
}

/// The terminal outcome of a single call attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallOutcome {
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "noAnswer")]
    NoAnswer,
    #[serde(rename = "busy")]
    Busy,
    #[serde(rename = "voicemail")]
    Voicemail,
    #[serde(rename = "canceled")]
    Canceled,
}

/// A record of a single call attempt, persisted for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub id: String,
    pub campaign_id: String,
    pub contact_id: String,
    /// The correlation id used across the carrier and voice pipeline.
    pub call_id: String,
    /// The carrier's own identifier for the call, when one was issued.
    pub carrier_id: Option<String>,
    pub outcome: CallOutcome,
    pub failure_reason: Option<String>,
    /// UNIX timestamp in milliseconds when the dial was placed.
    pub started: u64,
    /// UNIX timestamp in milliseconds when the call reached a
    /// terminal state.
    pub completed: Option<u64>,
}

/// The status of a scheduled retry job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetryAttemptStatus {
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "fired")]
    Fired,
    #[serde(rename = "cancelled")]
    Cancelled,
}

/// A scheduled retry recorded in the durable store so that operators
/// can inspect the retry chain for a contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub id: String,
    pub campaign_id: String,
    pub contact_id: String,
    pub original_call_id: String,
    pub attempt_number: u32,
    /// UNIX timestamp in milliseconds at which the retry fires.
    pub scheduled_for: u64,
    pub failure_kind: String,
    pub status: RetryAttemptStatus,
}
