//! Dispatch executor: claims due send rows and drives them through
//! render → inject → transport.
//!
//! The claim is an atomic conditional update, so concurrent executor
//! replicas can process the same due set without duplicate sends: losing a
//! claim is a normal race outcome, not an error. A claim is never rolled
//! back — a transport failure marks the row failed and consumes its slot
//! (claimed ≠ delivered; retries are an explicit re-schedule).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::contacts::ContactDirectory;
use crate::model::{CampaignId, CampaignSend, CampaignStatus, EmailCampaign, TrackingId};
use crate::render::render_template;
use crate::store::{CampaignStore, RenderedContent, StoreError};
use crate::tracking::inject;
use crate::transport::{MailTransport, OutboundEmail};

/// Outcome counts for one executor batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rows this executor claimed.
    pub claimed: usize,
    /// Claimed rows the transport accepted.
    pub sent: usize,
    /// Claimed rows that failed (transport or missing collaborator data).
    pub failed: usize,
    /// Rows another executor claimed first.
    pub conflicts: usize,
    /// Rows refused before claim because their campaign was no longer
    /// dispatchable.
    pub vetoed: usize,
    /// Campaigns transitioned to `Completed` by this batch.
    pub completed_campaigns: Vec<CampaignId>,
}

enum Outcome {
    Sent(CampaignId),
    Failed(CampaignId),
    Conflict,
    Vetoed,
}

pub struct DispatchExecutor {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn ContactDirectory>,
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    base_tracking_url: String,
    site_base_url: Option<String>,
    concurrency: usize,
}

impl DispatchExecutor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        directory: Arc<dyn ContactDirectory>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        base_tracking_url: String,
        site_base_url: Option<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            directory,
            transport,
            clock,
            base_tracking_url,
            site_base_url,
            concurrency: concurrency.max(1),
        }
    }

    /// Claim and dispatch up to `batch_limit` due sends with bounded
    /// parallelism, then run the campaign completion check for every
    /// campaign the batch touched.
    pub async fn process_due(&self, batch_limit: usize) -> Result<DispatchReport, StoreError> {
        let now = self.clock.now();
        let due = self.store.due_unclaimed(now, batch_limit).await?;

        if due.is_empty() {
            return Ok(DispatchReport::default());
        }

        debug!(
            due = due.len(),
            concurrency = self.concurrency,
            "dispatch_batch_starting"
        );

        let outcomes: Vec<Outcome> = stream::iter(due)
            .map(|send| self.dispatch_one(send, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = DispatchReport::default();
        let mut touched: Vec<CampaignId> = Vec::new();
        for outcome in outcomes {
            match outcome {
                Outcome::Sent(campaign_id) => {
                    report.claimed += 1;
                    report.sent += 1;
                    touched.push(campaign_id);
                }
                Outcome::Failed(campaign_id) => {
                    report.claimed += 1;
                    report.failed += 1;
                    touched.push(campaign_id);
                }
                Outcome::Conflict => report.conflicts += 1,
                Outcome::Vetoed => report.vetoed += 1,
            }
        }

        touched.sort();
        touched.dedup();
        for campaign_id in touched {
            match self.check_completion(campaign_id, now).await {
                Ok(true) => report.completed_campaigns.push(campaign_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(campaign_id = %campaign_id, error = %e, "completion_check_failed")
                }
            }
        }

        info!(
            claimed = report.claimed,
            sent = report.sent,
            failed = report.failed,
            conflicts = report.conflicts,
            vetoed = report.vetoed,
            completed = report.completed_campaigns.len(),
            "dispatch_batch_complete"
        );

        Ok(report)
    }

    /// Dispatch a single due row. Per-send failures are isolated: every
    /// error path is recorded on the row (or logged) and never aborts the
    /// batch.
    async fn dispatch_one(&self, send: CampaignSend, now: DateTime<Utc>) -> Outcome {
        let campaign_id = send.campaign_id;

        // Refuse to claim rows of a campaign no longer dispatchable, even
        // when the row was already materialized as due.
        match self.store.campaign(campaign_id).await {
            Ok(Some(campaign)) if campaign.status.is_dispatchable() => {}
            Ok(_) => {
                debug!(send_id = %send.id, campaign_id = %campaign_id, "dispatch_vetoed");
                return Outcome::Vetoed;
            }
            Err(e) => {
                error!(send_id = %send.id, error = %e, "dispatch_campaign_lookup_failed");
                return Outcome::Vetoed;
            }
        }

        match self.store.claim_send(send.id, now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(send_id = %send.id, "dispatch_claim_conflict");
                return Outcome::Conflict;
            }
            Err(e) => {
                error!(send_id = %send.id, error = %e, "dispatch_claim_failed");
                return Outcome::Vetoed;
            }
        }

        info!(
            send_id = %send.id,
            campaign_id = %campaign_id,
            contact_id = %send.contact_id,
            sequence_index = send.sequence_index,
            occurrence = send.occurrence,
            "dispatch_claimed"
        );

        match self.deliver(&send).await {
            Ok(()) => Outcome::Sent(campaign_id),
            Err(reason) => {
                if let Err(e) = self
                    .store
                    .record_dispatch_failure(send.id, &reason, now)
                    .await
                {
                    error!(send_id = %send.id, error = %e, "dispatch_failure_record_failed");
                }
                warn!(send_id = %send.id, reason = %reason, "dispatch_failed");
                Outcome::Failed(campaign_id)
            }
        }
    }

    /// Render, inject, and hand the claimed send to the transport.
    async fn deliver(&self, send: &CampaignSend) -> Result<(), String> {
        let contact = self
            .directory
            .contact(send.contact_id)
            .await
            .map_err(|e| format!("contact lookup failed: {e}"))?
            .ok_or_else(|| "contact no longer exists".to_string())?;

        // A veto arriving after claim does not unclaim, but we still must
        // not deliver to an unsubscribed address.
        if contact.is_unsubscribed() {
            return Err("recipient unsubscribed".to_string());
        }

        let template = self
            .store
            .template(send.template_id)
            .await
            .map_err(|e| format!("template lookup failed: {e}"))?
            .ok_or_else(|| "template no longer exists".to_string())?;

        let rendered = render_template(&template, &contact);
        let tracking_id = TrackingId::generate();
        let tracked_body = inject(
            &rendered.html_body,
            &tracking_id,
            &self.base_tracking_url,
            self.site_base_url.as_deref(),
        );

        let message = OutboundEmail {
            to: contact.email.clone(),
            subject: rendered.subject.clone(),
            html_body: tracked_body.clone(),
            text_body: rendered.text_body,
        };

        let receipt = self
            .transport
            .send(&message)
            .await
            .map_err(|e| e.to_string())?;

        self.store
            .record_dispatch_success(
                send.id,
                RenderedContent {
                    subject: rendered.subject,
                    body: tracked_body,
                },
                tracking_id.clone(),
                receipt.provider_message_id,
            )
            .await
            .map_err(|e| format!("success bookkeeping failed: {e}"))?;

        info!(
            send_id = %send.id,
            campaign_id = %send.campaign_id,
            tracking_id = %tracking_id,
            "dispatch_sent"
        );
        Ok(())
    }

    /// Transition a non-recurring campaign to `Completed` once every
    /// eligible contact has finished its full sequence. Recurring campaigns
    /// never auto-complete.
    async fn check_completion(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(campaign) = self.store.campaign(campaign_id).await? else {
            return Ok(false);
        };
        if campaign.is_recurring || !campaign.status.is_dispatchable() {
            return Ok(false);
        }

        if !self.all_contacts_finished(&campaign).await? {
            return Ok(false);
        }

        self.store
            .transition_campaign(campaign_id, CampaignStatus::Completed, now)
            .await?;
        info!(campaign_id = %campaign_id, "campaign_completed");
        Ok(true)
    }

    async fn all_contacts_finished(&self, campaign: &EmailCampaign) -> Result<bool, StoreError> {
        let contacts = match self.directory.resolve(&campaign.audience).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(campaign_id = %campaign.id, error = %e, "completion_audience_unresolvable");
                return Ok(false);
            }
        };

        let sends = self.store.sends_for_campaign(campaign.id).await?;

        for contact in contacts {
            // Unsubscribed contacts will never receive further steps.
            if contact.is_unsubscribed() {
                continue;
            }
            let rows: Vec<&CampaignSend> = sends
                .iter()
                .filter(|s| s.contact_id == contact.id)
                .collect();

            // A replied contact under stop_on_reply has finished early.
            if campaign.stop_on_reply && rows.iter().any(|s| s.is_replied) {
                continue;
            }

            for index in 0..campaign.sequence.len() {
                let terminal = rows
                    .iter()
                    .any(|s| s.sequence_index == index && (s.is_sent || s.is_cancelled));
                if !terminal {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}
