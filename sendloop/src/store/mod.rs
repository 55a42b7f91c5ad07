//! Persistent store seam.
//!
//! The engine consumes a transactional relational store through
//! [`CampaignStore`]. Every cross-cutting mutation the dispatch and tracking
//! protocols rely on (claim-to-send, first-event flag flips) is expressed as
//! an atomic conditional single-row update so concurrent scheduler replicas
//! and tracking requests cannot corrupt state. [`MemoryStore`] is the
//! in-process implementation used by the standalone daemon and the tests;
//! production deployments implement the trait over their database.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    CampaignId, CampaignSend, CampaignStatus, EmailCampaign, EmailTemplate, SendId, TemplateId,
    TrackingEvent, TrackingId,
};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("campaign {0} not found")]
    CampaignNotFound(CampaignId),
    #[error("send {0} not found")]
    SendNotFound(SendId),
    #[error("illegal campaign status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },
}

/// Rendered content persisted on a send row at dispatch time for audit.
#[derive(Debug, Clone)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
}

/// Storage operations required by the sequencer, executor, and recorder.
///
/// Implementations must make [`claim_send`](CampaignStore::claim_send),
/// [`mark_opened_if_first`](CampaignStore::mark_opened_if_first),
/// [`mark_clicked_if_first`](CampaignStore::mark_clicked_if_first), and
/// [`mark_replied_if_first`](CampaignStore::mark_replied_if_first) atomic
/// conditional updates: under concurrent callers at most one may observe
/// `true` per row.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: EmailCampaign) -> Result<(), StoreError>;

    async fn campaign(&self, id: CampaignId) -> Result<Option<EmailCampaign>, StoreError>;

    /// Campaigns in a dispatchable state (`Scheduled` or `Active`).
    async fn dispatchable_campaigns(&self) -> Result<Vec<EmailCampaign>, StoreError>;

    /// Apply a validated status transition. Transitioning to `Cancelled`
    /// also cancels every unclaimed send row of the campaign.
    async fn transition_campaign(
        &self,
        id: CampaignId,
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_template(&self, template: EmailTemplate) -> Result<(), StoreError>;

    async fn template(&self, id: TemplateId) -> Result<Option<EmailTemplate>, StoreError>;

    async fn sends_for_campaign(&self, id: CampaignId) -> Result<Vec<CampaignSend>, StoreError>;

    /// Insert freshly scheduled rows, skipping any whose
    /// `(campaign, contact, sequence_index, occurrence)` slot already
    /// exists. Returns the number actually inserted; the skip makes
    /// overlapping sequencer passes harmless.
    async fn insert_sends(&self, sends: Vec<CampaignSend>) -> Result<usize, StoreError>;

    /// Due rows not yet claimed or cancelled, ordered by
    /// `(scheduled_date, campaign_id, contact_id)`, capped at `limit`.
    async fn due_unclaimed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CampaignSend>, StoreError>;

    /// Atomically claim a row for dispatch: sets `is_sent`/`sent_date` only
    /// if the row is currently unsent and uncancelled. Returns whether this
    /// caller won the claim.
    async fn claim_send(&self, id: SendId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Persist the rendered content and tracking id after the transport
    /// accepted the message, and bump the campaign's `total_sent`.
    async fn record_dispatch_success(
        &self,
        id: SendId,
        content: RenderedContent,
        tracking_id: TrackingId,
        provider_message_id: Option<String>,
    ) -> Result<(), StoreError>;

    /// Mark a claimed row failed. The claim is not rolled back: a failed
    /// send consumes its scheduled slot.
    async fn record_dispatch_failure(
        &self,
        id: SendId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn send_by_tracking_id(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<CampaignSend>, StoreError>;

    async fn append_event(&self, event: TrackingEvent) -> Result<(), StoreError>;

    /// Flip `is_opened` and bump `total_opened` only if the row has never
    /// been opened. Returns whether this was the first open.
    async fn mark_opened_if_first(&self, id: SendId, at: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Flip `is_clicked` and bump `total_clicked` only if the row has never
    /// been clicked. Returns whether this was the first click.
    async fn mark_clicked_if_first(
        &self,
        id: SendId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Flip `is_replied` and bump `total_replied` only on the first reply.
    /// Invoked by the external reply-detection collaborator.
    async fn mark_replied_if_first(
        &self,
        id: SendId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Append-only event log for one tracking id, oldest first.
    async fn events_for(&self, tracking_id: &TrackingId) -> Result<Vec<TrackingEvent>, StoreError>;
}
