//! Core domain types: campaigns, scheduled sends, and tracking events.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type CampaignId = Uuid;
pub type ContactId = Uuid;
pub type TemplateId = Uuid;
pub type SendId = Uuid;

// =============================================================================
// Tracking id
// =============================================================================

/// Opaque, unguessable identifier correlating tracking pixel and redirect
/// requests back to a [`CampaignSend`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingId(String);

impl TrackingId {
    /// Generate a fresh tracking id from 16 random bytes, hex-encoded.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackingId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TrackingId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Campaign
// =============================================================================

/// Lifecycle state of a campaign.
///
/// Transitions are forward-only, with two exceptions: `Paused → Active`
/// (resume) and any non-cancelled state `→ Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Scheduled => 1,
            Self::Active => 2,
            Self::Paused => 3,
            Self::Completed => 4,
            Self::Cancelled => 5,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return false;
        }
        match (self, next) {
            (Self::Cancelled, _) => false,
            (_, Self::Cancelled) => true,
            (Self::Completed, _) => false,
            (Self::Paused, Self::Active) => true,
            _ => next.rank() > self.rank(),
        }
    }

    /// Whether the Sequencer may compute due steps and the Executor may
    /// claim rows for a campaign in this state.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Scheduled | Self::Active)
    }
}

/// One `(template, delay)` pair within a campaign's ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub template_id: TemplateId,
    /// Days after the occurrence start at which this step becomes due.
    pub send_delay_days: i64,
}

/// Contact selection for a campaign: declarative filters or explicit ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Audience {
    /// Field/value equality filters resolved by the contact directory.
    Filters { filters: serde_json::Value },
    /// Explicit contact id list.
    Contacts { contact_ids: Vec<ContactId> },
}

/// Running engagement counters maintained on the campaign row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignTotals {
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
    pub failed: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CampaignValidationError {
    #[error("template sequence must not be empty")]
    EmptySequence,
    #[error("send delays must be non-decreasing (violated at step {index})")]
    DelaysNotMonotonic { index: usize },
    #[error("send delays must not be negative (step {index})")]
    NegativeDelay { index: usize },
    #[error("recurring campaigns require a positive recurrence interval")]
    MissingRecurrenceInterval,
}

/// One marketing campaign: a template sequence dispatched to an audience,
/// optionally repeating on a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailCampaign {
    pub id: CampaignId,
    pub name: String,
    pub audience: Audience,
    pub sequence: Vec<TemplateStep>,
    pub is_recurring: bool,
    pub recurrence_interval_days: Option<i64>,
    pub first_send_date: DateTime<Utc>,
    pub stop_on_reply: bool,
    pub status: CampaignStatus,
    #[serde(default)]
    pub totals: CampaignTotals,
    pub created_at: DateTime<Utc>,
}

impl EmailCampaign {
    /// Check the structural invariants: non-empty sequence, non-negative and
    /// non-decreasing delays, and an interval when recurring.
    pub fn validate(&self) -> Result<(), CampaignValidationError> {
        if self.sequence.is_empty() {
            return Err(CampaignValidationError::EmptySequence);
        }
        let mut prev = 0;
        for (index, step) in self.sequence.iter().enumerate() {
            if step.send_delay_days < 0 {
                return Err(CampaignValidationError::NegativeDelay { index });
            }
            if step.send_delay_days < prev {
                return Err(CampaignValidationError::DelaysNotMonotonic { index });
            }
            prev = step.send_delay_days;
        }
        if self.is_recurring && !matches!(self.recurrence_interval_days, Some(d) if d > 0) {
            return Err(CampaignValidationError::MissingRecurrenceInterval);
        }
        Ok(())
    }
}

// =============================================================================
// Campaign send
// =============================================================================

/// One scheduled delivery of one sequence step to one contact.
///
/// Created by the Sequencer when a step becomes due, claimed exactly once by
/// the Executor, and later mutated by the tracking recorder or a reply
/// detector. `(campaign_id, contact_id, sequence_index, occurrence)` is
/// unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSend {
    pub id: SendId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub template_id: TemplateId,
    pub sequence_index: usize,
    /// Full-sequence pass counter for recurring campaigns; always 0 otherwise.
    pub occurrence: u32,
    pub scheduled_date: DateTime<Utc>,
    pub sent_date: Option<DateTime<Utc>>,

    pub is_sent: bool,
    pub is_opened: bool,
    pub is_clicked: bool,
    pub is_replied: bool,
    pub is_failed: bool,
    pub is_cancelled: bool,

    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub failure_reason: Option<String>,
    /// Rendered content captured at send time for audit.
    pub rendered_subject: Option<String>,
    pub rendered_body: Option<String>,
    pub tracking_id: Option<TrackingId>,
}

impl CampaignSend {
    /// Build a fresh, unclaimed send row for a scheduled step.
    pub fn scheduled(
        campaign_id: CampaignId,
        contact_id: ContactId,
        template_id: TemplateId,
        sequence_index: usize,
        occurrence: u32,
        scheduled_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id,
            template_id,
            sequence_index,
            occurrence,
            scheduled_date,
            sent_date: None,
            is_sent: false,
            is_opened: false,
            is_clicked: false,
            is_replied: false,
            is_failed: false,
            is_cancelled: false,
            opened_at: None,
            clicked_at: None,
            replied_at: None,
            failed_at: None,
            cancelled_at: None,
            failure_reason: None,
            rendered_subject: None,
            rendered_body: None,
            tracking_id: None,
        }
    }

    /// Uniqueness key within a campaign.
    pub fn slot(&self) -> (CampaignId, ContactId, usize, u32) {
        (
            self.campaign_id,
            self.contact_id,
            self.sequence_index,
            self.occurrence,
        )
    }
}

// =============================================================================
// Tracking event
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Click,
}

/// Immutable append-only record of one pixel open or link click.
///
/// Duplicates for the same `(tracking_id, kind, target_url)` are expected;
/// only the first flips the corresponding [`CampaignSend`] flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub tracking_id: TrackingId,
    pub kind: EventKind,
    pub target_url: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

// =============================================================================
// Contacts and templates
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// A recipient as resolved by the contact directory collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Free-form custom fields available to template substitution.
    #[serde(default)]
    pub fields: HashMap<String, String>,
    pub subscription_status: SubscriptionStatus,
}

impl Contact {
    pub fn is_unsubscribed(&self) -> bool {
        self.subscription_status == SubscriptionStatus::Unsubscribed
    }

    /// Substitution variables for template rendering. Built-in fields win
    /// over custom fields of the same name.
    pub fn variables(&self) -> HashMap<String, String> {
        let mut vars = self.fields.clone();
        vars.insert("email".to_string(), self.email.clone());
        vars.insert(
            "first_name".to_string(),
            self.first_name.clone().unwrap_or_default(),
        );
        vars.insert(
            "last_name".to_string(),
            self.last_name.clone().unwrap_or_default(),
        );
        vars
    }
}

/// An authored email template referenced by campaign sequence steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
}
