//! In-memory `CampaignStore` backed by sharded concurrent maps.
//!
//! DashMap's per-shard locking gives each `get_mut` exclusive access to the
//! row while the closure runs, which is exactly the single-row conditional
//! update primitive the claim and first-event protocols need.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::model::{
    CampaignId, CampaignSend, CampaignStatus, ContactId, EmailCampaign, EmailTemplate, SendId,
    TemplateId, TrackingEvent, TrackingId,
};
use crate::store::{CampaignStore, RenderedContent, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    campaigns: DashMap<CampaignId, EmailCampaign>,
    templates: DashMap<TemplateId, EmailTemplate>,
    sends: DashMap<SendId, CampaignSend>,
    by_tracking: DashMap<TrackingId, SendId>,
    /// Occupied `(campaign, contact, sequence_index, occurrence)` slots.
    slots: DashSet<(CampaignId, ContactId, usize, u32)>,
    events: Mutex<Vec<TrackingEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_campaign<F>(&self, id: CampaignId, f: F)
    where
        F: FnOnce(&mut EmailCampaign),
    {
        if let Some(mut campaign) = self.campaigns.get_mut(&id) {
            f(&mut campaign);
        }
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: EmailCampaign) -> Result<(), StoreError> {
        self.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<EmailCampaign>, StoreError> {
        Ok(self.campaigns.get(&id).map(|c| c.clone()))
    }

    async fn dispatchable_campaigns(&self) -> Result<Vec<EmailCampaign>, StoreError> {
        let mut campaigns: Vec<EmailCampaign> = self
            .campaigns
            .iter()
            .filter(|c| c.status.is_dispatchable())
            .map(|c| c.clone())
            .collect();
        campaigns.sort_by_key(|c| c.id);
        Ok(campaigns)
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        {
            let mut campaign = self
                .campaigns
                .get_mut(&id)
                .ok_or(StoreError::CampaignNotFound(id))?;
            if !campaign.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    from: campaign.status,
                    to,
                });
            }
            campaign.status = to;
        }

        if to == CampaignStatus::Cancelled {
            // Cancellation halts all future dispatch: unclaimed rows become
            // terminally cancelled so no executor can claim them.
            for mut send in self.sends.iter_mut() {
                if send.campaign_id == id && !send.is_sent && !send.is_cancelled {
                    send.is_cancelled = true;
                    send.cancelled_at = Some(at);
                }
            }
        }

        debug!(campaign_id = %id, status = ?to, "campaign_transitioned");
        Ok(())
    }

    async fn insert_template(&self, template: EmailTemplate) -> Result<(), StoreError> {
        self.templates.insert(template.id, template);
        Ok(())
    }

    async fn template(&self, id: TemplateId) -> Result<Option<EmailTemplate>, StoreError> {
        Ok(self.templates.get(&id).map(|t| t.clone()))
    }

    async fn sends_for_campaign(&self, id: CampaignId) -> Result<Vec<CampaignSend>, StoreError> {
        Ok(self
            .sends
            .iter()
            .filter(|s| s.campaign_id == id)
            .map(|s| s.clone())
            .collect())
    }

    async fn insert_sends(&self, sends: Vec<CampaignSend>) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for send in sends {
            // DashSet::insert is atomic, so two overlapping sequencer passes
            // cannot both materialize the same slot.
            if self.slots.insert(send.slot()) {
                self.sends.insert(send.id, send);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn due_unclaimed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CampaignSend>, StoreError> {
        let mut due: Vec<CampaignSend> = self
            .sends
            .iter()
            .filter(|s| !s.is_sent && !s.is_cancelled && s.scheduled_date <= now)
            .map(|s| s.clone())
            .collect();
        due.sort_by(|a, b| {
            (a.scheduled_date, a.campaign_id, a.contact_id)
                .cmp(&(b.scheduled_date, b.campaign_id, b.contact_id))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_send(&self, id: SendId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut send = self.sends.get_mut(&id).ok_or(StoreError::SendNotFound(id))?;
        if send.is_sent || send.is_cancelled {
            return Ok(false);
        }
        send.is_sent = true;
        send.sent_date = Some(now);
        Ok(true)
    }

    async fn record_dispatch_success(
        &self,
        id: SendId,
        content: RenderedContent,
        tracking_id: TrackingId,
        _provider_message_id: Option<String>,
    ) -> Result<(), StoreError> {
        let campaign_id = {
            let mut send = self.sends.get_mut(&id).ok_or(StoreError::SendNotFound(id))?;
            send.rendered_subject = Some(content.subject);
            send.rendered_body = Some(content.body);
            send.tracking_id = Some(tracking_id.clone());
            send.campaign_id
        };
        self.by_tracking.insert(tracking_id, id);
        self.bump_campaign(campaign_id, |c| c.totals.sent += 1);
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        id: SendId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let campaign_id = {
            let mut send = self.sends.get_mut(&id).ok_or(StoreError::SendNotFound(id))?;
            send.is_failed = true;
            send.failed_at = Some(at);
            send.failure_reason = Some(reason.to_string());
            send.campaign_id
        };
        self.bump_campaign(campaign_id, |c| c.totals.failed += 1);
        Ok(())
    }

    async fn send_by_tracking_id(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<CampaignSend>, StoreError> {
        let Some(id) = self.by_tracking.get(tracking_id).map(|e| *e) else {
            return Ok(None);
        };
        Ok(self.sends.get(&id).map(|s| s.clone()))
    }

    async fn append_event(&self, event: TrackingEvent) -> Result<(), StoreError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }

    async fn mark_opened_if_first(
        &self,
        id: SendId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let campaign_id = {
            let mut send = self.sends.get_mut(&id).ok_or(StoreError::SendNotFound(id))?;
            if send.is_opened {
                return Ok(false);
            }
            send.is_opened = true;
            send.opened_at = Some(at);
            send.campaign_id
        };
        self.bump_campaign(campaign_id, |c| c.totals.opened += 1);
        Ok(true)
    }

    async fn mark_clicked_if_first(
        &self,
        id: SendId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let campaign_id = {
            let mut send = self.sends.get_mut(&id).ok_or(StoreError::SendNotFound(id))?;
            if send.is_clicked {
                return Ok(false);
            }
            send.is_clicked = true;
            send.clicked_at = Some(at);
            send.campaign_id
        };
        self.bump_campaign(campaign_id, |c| c.totals.clicked += 1);
        Ok(true)
    }

    async fn mark_replied_if_first(
        &self,
        id: SendId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let campaign_id = {
            let mut send = self.sends.get_mut(&id).ok_or(StoreError::SendNotFound(id))?;
            if send.is_replied {
                return Ok(false);
            }
            send.is_replied = true;
            send.replied_at = Some(at);
            send.campaign_id
        };
        self.bump_campaign(campaign_id, |c| c.totals.replied += 1);
        Ok(true)
    }

    async fn events_for(&self, tracking_id: &TrackingId) -> Result<Vec<TrackingEvent>, StoreError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| &e.tracking_id == tracking_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;
    use crate::model::{Audience, CampaignTotals, TemplateStep};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn campaign(status: CampaignStatus) -> EmailCampaign {
        EmailCampaign {
            id: Uuid::new_v4(),
            name: "spring".to_string(),
            audience: Audience::Contacts { contact_ids: vec![] },
            sequence: vec![TemplateStep {
                template_id: Uuid::new_v4(),
                send_delay_days: 0,
            }],
            is_recurring: false,
            recurrence_interval_days: None,
            first_send_date: now(),
            stop_on_reply: false,
            status,
            totals: CampaignTotals::default(),
            created_at: now(),
        }
    }

    async fn seeded_send(store: &MemoryStore) -> CampaignSend {
        let c = campaign(CampaignStatus::Active);
        let send = CampaignSend::scheduled(
            c.id,
            Uuid::new_v4(),
            c.sequence[0].template_id,
            0,
            0,
            now(),
        );
        store.insert_campaign(c).await.unwrap();
        store.insert_sends(vec![send.clone()]).await.unwrap();
        send
    }

    #[tokio::test]
    async fn test_concurrent_claims_only_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let send = seeded_send(&store).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = send.id;
            handles.push(tokio::spawn(async move {
                store.claim_send(id, now()).await.unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_claim_refused_on_cancelled_row() {
        let store = MemoryStore::new();
        let send = seeded_send(&store).await;

        store
            .transition_campaign(send.campaign_id, CampaignStatus::Cancelled, now())
            .await
            .unwrap();
        assert!(!store.claim_send(send.id, now()).await.unwrap());

        let row = store
            .sends_for_campaign(send.campaign_id)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert!(row.is_cancelled);
        assert!(!row.is_sent);
    }

    #[tokio::test]
    async fn test_insert_sends_skips_occupied_slots() {
        let store = MemoryStore::new();
        let send = seeded_send(&store).await;

        let mut duplicate = send.clone();
        duplicate.id = Uuid::new_v4();
        let inserted = store.insert_sends(vec![duplicate]).await.unwrap();
        assert_eq!(inserted, 0);
    }

    #[tokio::test]
    async fn test_first_open_bumps_totals_once() {
        let store = MemoryStore::new();
        let send = seeded_send(&store).await;
        let first_at = now();

        assert!(store.mark_opened_if_first(send.id, first_at).await.unwrap());
        for i in 1..5 {
            let later = first_at + chrono::Duration::minutes(i);
            assert!(!store.mark_opened_if_first(send.id, later).await.unwrap());
        }

        let campaign = store.campaign(send.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.totals.opened, 1);

        let row = store
            .sends_for_campaign(send.campaign_id)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(row.opened_at, Some(first_at));
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_claim() {
        let store = MemoryStore::new();
        let send = seeded_send(&store).await;

        assert!(store.claim_send(send.id, now()).await.unwrap());
        store
            .record_dispatch_failure(send.id, "provider rejected", now())
            .await
            .unwrap();

        let row = store
            .sends_for_campaign(send.campaign_id)
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert!(row.is_sent);
        assert!(row.is_failed);
        assert_eq!(row.failure_reason.as_deref(), Some("provider rejected"));

        let campaign = store.campaign(send.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.totals.failed, 1);
    }

    #[tokio::test]
    async fn test_due_unclaimed_ordering_and_limit() {
        let store = MemoryStore::new();
        let c = campaign(CampaignStatus::Active);
        store.insert_campaign(c.clone()).await.unwrap();

        let template_id = c.sequence[0].template_id;
        let later = CampaignSend::scheduled(c.id, Uuid::new_v4(), template_id, 1, 0, now());
        let earlier = CampaignSend::scheduled(
            c.id,
            Uuid::new_v4(),
            template_id,
            0,
            0,
            now() - chrono::Duration::days(1),
        );
        let future = CampaignSend::scheduled(
            c.id,
            Uuid::new_v4(),
            template_id,
            2,
            0,
            now() + chrono::Duration::days(1),
        );
        store
            .insert_sends(vec![later.clone(), earlier.clone(), future])
            .await
            .unwrap();

        let due = store.due_unclaimed(now(), 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, earlier.id);

        let capped = store.due_unclaimed(now(), 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = MemoryStore::new();
        let c = campaign(CampaignStatus::Completed);
        let id = c.id;
        store.insert_campaign(c).await.unwrap();

        let err = store
            .transition_campaign(id, CampaignStatus::Active, now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_tracking_lookup_after_success() {
        let store = MemoryStore::new();
        let send = seeded_send(&store).await;
        let tid = TrackingId::generate();

        store.claim_send(send.id, now()).await.unwrap();
        store
            .record_dispatch_success(
                send.id,
                RenderedContent {
                    subject: "s".to_string(),
                    body: "<p>b</p>".to_string(),
                },
                tid.clone(),
                Some("prov-1".to_string()),
            )
            .await
            .unwrap();

        let found = store.send_by_tracking_id(&tid).await.unwrap().unwrap();
        assert_eq!(found.id, send.id);
        assert_eq!(found.rendered_subject.as_deref(), Some("s"));

        let campaign = store.campaign(send.campaign_id).await.unwrap().unwrap();
        assert_eq!(campaign.totals.sent, 1);
    }
}
