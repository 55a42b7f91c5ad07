//! Scheduler loop: the periodic driver for sequencing and dispatch.
//!
//! One owned task, one pass per tick: ask the sequencer for newly-due work,
//! materialize it, then let the executor process everything currently due.
//! A pass always finishes (or fails) before the next tick fires, so a
//! single loop never overlaps itself; overlap across replicas is harmless
//! because materialization and claiming are conditional storage updates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::contacts::ContactDirectory;
use crate::executor::{DispatchExecutor, DispatchReport};
use crate::model::{CampaignStatus, EmailCampaign};
use crate::sequencer::{compute_due_steps, PendingSend, SequencerError};
use crate::store::CampaignStore;

/// Summary of one scheduler pass.
#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    pub campaigns_polled: usize,
    pub sends_scheduled: usize,
    pub report: DispatchReport,
}

pub struct Scheduler {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn ContactDirectory>,
    executor: DispatchExecutor,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    batch_limit: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        directory: Arc<dyn ContactDirectory>,
        executor: DispatchExecutor,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            directory,
            executor,
            clock,
            poll_interval,
            batch_limit,
        }
    }

    /// Drive passes until `shutdown` completes. Systemic pass failures are
    /// logged and retried at the next tick.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut ticker = interval(self.poll_interval);
        // A slow pass delays the next tick instead of bursting to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_seconds = self.poll_interval.as_secs_f64(),
            batch_limit = self.batch_limit,
            "scheduler_started"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler_stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_pass().await {
                        Ok(summary) => {
                            debug!(
                                campaigns_polled = summary.campaigns_polled,
                                sends_scheduled = summary.sends_scheduled,
                                sent = summary.report.sent,
                                failed = summary.report.failed,
                                "scheduler_pass_complete"
                            );
                        }
                        Err(e) => {
                            // Store outage: abandon this pass, retry next tick.
                            error!(error = %e, "scheduler_pass_failed");
                        }
                    }
                }
            }
        }

        info!("scheduler_shutdown_complete");
    }

    /// One sequencing + dispatch pass.
    pub async fn run_pass(&self) -> Result<PassSummary, SequencerError> {
        let now = self.clock.now();
        let campaigns = self.store.dispatchable_campaigns().await?;

        let mut summary = PassSummary {
            campaigns_polled: campaigns.len(),
            ..Default::default()
        };

        for campaign in &campaigns {
            self.promote_if_started(campaign, now).await;
            summary.sends_scheduled += self.schedule_campaign(campaign, now).await?;
        }

        summary.report = self.executor.process_due(self.batch_limit).await?;
        Ok(summary)
    }

    /// A `Scheduled` campaign whose first send date has arrived becomes
    /// `Active`.
    async fn promote_if_started(&self, campaign: &EmailCampaign, now: DateTime<Utc>) {
        if campaign.status == CampaignStatus::Scheduled && campaign.first_send_date <= now {
            if let Err(e) = self
                .store
                .transition_campaign(campaign.id, CampaignStatus::Active, now)
                .await
            {
                warn!(campaign_id = %campaign.id, error = %e, "campaign_activation_failed");
            } else {
                info!(campaign_id = %campaign.id, "campaign_activated");
            }
        }
    }

    /// Compute and materialize this campaign's newly due steps. Directory
    /// failures are isolated per campaign; store failures abort the pass.
    async fn schedule_campaign(
        &self,
        campaign: &EmailCampaign,
        now: DateTime<Utc>,
    ) -> Result<usize, SequencerError> {
        let pending =
            match compute_due_steps(&*self.store, &*self.directory, campaign, now).await {
                Ok(pending) => pending,
                Err(SequencerError::Directory(e)) => {
                    warn!(campaign_id = %campaign.id, error = %e, "sequencer_campaign_skipped");
                    return Ok(0);
                }
                Err(e) => return Err(e),
            };

        if pending.is_empty() {
            return Ok(0);
        }

        let rows = pending.into_iter().map(PendingSend::into_send).collect();
        let inserted = self.store.insert_sends(rows).await?;
        debug!(campaign_id = %campaign.id, inserted, "sends_materialized");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;
    use crate::clock::FixedClock;
    use crate::contacts::StaticDirectory;
    use crate::model::{
        Audience, CampaignTotals, Contact, EmailTemplate, SubscriptionStatus, TemplateStep,
    };
    use crate::store::MemoryStore;
    use crate::transport::{DeliveryReceipt, MailTransport, OutboundEmail, TransportError};

    struct NullTransport;

    #[async_trait::async_trait]
    impl MailTransport for NullTransport {
        async fn send(&self, _message: &OutboundEmail) -> Result<DeliveryReceipt, TransportError> {
            Ok(DeliveryReceipt::default())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn scheduler_at(
        store: Arc<MemoryStore>,
        directory: Arc<StaticDirectory>,
        at: DateTime<Utc>,
    ) -> Scheduler {
        let clock = Arc::new(FixedClock(at));
        let executor = DispatchExecutor::new(
            store.clone(),
            directory.clone(),
            Arc::new(NullTransport),
            clock.clone(),
            "https://track.example.com/t".to_string(),
            None,
            4,
        );
        Scheduler::new(
            store,
            directory,
            executor,
            clock,
            Duration::from_secs(60),
            100,
        )
    }

    #[tokio::test]
    async fn test_pass_schedules_dispatches_and_activates() {
        let store = Arc::new(MemoryStore::new());
        let template = EmailTemplate {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            subject: "s".to_string(),
            html_body: "<body><p>hi</p></body>".to_string(),
            text_body: None,
        };
        let contact = Contact {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            first_name: None,
            last_name: None,
            fields: Default::default(),
            subscription_status: SubscriptionStatus::Subscribed,
        };
        let campaign = EmailCampaign {
            id: Uuid::new_v4(),
            name: "launch".to_string(),
            audience: Audience::Contacts {
                contact_ids: vec![contact.id],
            },
            sequence: vec![TemplateStep {
                template_id: template.id,
                send_delay_days: 0,
            }],
            is_recurring: false,
            recurrence_interval_days: None,
            first_send_date: now(),
            stop_on_reply: false,
            status: CampaignStatus::Scheduled,
            totals: CampaignTotals::default(),
            created_at: now(),
        };
        let campaign_id = campaign.id;
        store.insert_template(template).await.unwrap();
        store.insert_campaign(campaign).await.unwrap();

        let directory = Arc::new(StaticDirectory::new(vec![contact]));
        let scheduler = scheduler_at(store.clone(), directory, now());

        let summary = scheduler.run_pass().await.unwrap();
        assert_eq!(summary.campaigns_polled, 1);
        assert_eq!(summary.sends_scheduled, 1);
        assert_eq!(summary.report.sent, 1);

        // One step, one contact: the campaign finished in the same pass.
        let campaign = store.campaign(campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.totals.sent, 1);

        // A second pass is a no-op.
        let scheduler = scheduler_at(
            store.clone(),
            Arc::new(StaticDirectory::default()),
            now() + chrono::Duration::hours(1),
        );
        let summary = scheduler.run_pass().await.unwrap();
        assert_eq!(summary.campaigns_polled, 0);
        assert_eq!(summary.sends_scheduled, 0);
    }

    #[tokio::test]
    async fn test_future_first_send_date_stays_scheduled() {
        let store = Arc::new(MemoryStore::new());
        let campaign = EmailCampaign {
            id: Uuid::new_v4(),
            name: "later".to_string(),
            audience: Audience::Contacts { contact_ids: vec![] },
            sequence: vec![TemplateStep {
                template_id: Uuid::new_v4(),
                send_delay_days: 0,
            }],
            is_recurring: false,
            recurrence_interval_days: None,
            first_send_date: now() + chrono::Duration::days(2),
            stop_on_reply: false,
            status: CampaignStatus::Scheduled,
            totals: CampaignTotals::default(),
            created_at: now(),
        };
        let campaign_id = campaign.id;
        store.insert_campaign(campaign).await.unwrap();

        let scheduler = scheduler_at(store.clone(), Arc::new(StaticDirectory::default()), now());
        let summary = scheduler.run_pass().await.unwrap();
        assert_eq!(summary.sends_scheduled, 0);

        let campaign = store.campaign(campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_run_terminates_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler_at(store, Arc::new(StaticDirectory::default()), now());

        // Completed shutdown future: the loop must exit promptly.
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(async {}))
            .await
            .expect("scheduler did not stop");
    }
}
