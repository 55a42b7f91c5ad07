//! Campaign sequencer: computes which sequence steps have become due.
//!
//! Pure planning, no mutation: given a campaign's configuration and the send
//! rows that already exist, produce the `PendingSend` rows the scheduler
//! should materialize. Vetoes applied here: campaign not dispatchable,
//! contact unsubscribed (absolute), and `stop_on_reply` per contact.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::contacts::{ContactDirectory, DirectoryError};
use crate::model::{CampaignId, CampaignSend, ContactId, EmailCampaign, TemplateId};
use crate::store::{CampaignStore, StoreError};

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// A step the sequencer has determined is due and unmaterialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub template_id: TemplateId,
    pub sequence_index: usize,
    pub occurrence: u32,
    pub scheduled_date: DateTime<Utc>,
}

impl PendingSend {
    pub fn into_send(self) -> CampaignSend {
        CampaignSend::scheduled(
            self.campaign_id,
            self.contact_id,
            self.template_id,
            self.sequence_index,
            self.occurrence,
            self.scheduled_date,
        )
    }
}

/// Compute the due, unmaterialized steps for one campaign at `now`.
///
/// Output is ordered by `(scheduled_date, campaign_id, contact_id)` so the
/// executor serves the oldest work first.
pub async fn compute_due_steps(
    store: &dyn CampaignStore,
    directory: &dyn ContactDirectory,
    campaign: &EmailCampaign,
    now: DateTime<Utc>,
) -> Result<Vec<PendingSend>, SequencerError> {
    if !campaign.status.is_dispatchable() || campaign.sequence.is_empty() {
        return Ok(Vec::new());
    }

    let interval = if campaign.is_recurring {
        match campaign.recurrence_interval_days {
            Some(days) if days > 0 => Some(days),
            _ => {
                warn!(campaign_id = %campaign.id, "recurring_campaign_missing_interval");
                return Ok(Vec::new());
            }
        }
    } else {
        None
    };

    let contacts = directory.resolve(&campaign.audience).await?;
    let existing = store.sends_for_campaign(campaign.id).await?;

    // Per contact: occupied (sequence_index, occurrence) slots and reply state.
    let mut slots: HashMap<ContactId, HashSet<(usize, u32)>> = HashMap::new();
    let mut replied: HashSet<ContactId> = HashSet::new();
    for send in &existing {
        slots
            .entry(send.contact_id)
            .or_default()
            .insert((send.sequence_index, send.occurrence));
        if send.is_replied {
            replied.insert(send.contact_id);
        }
    }

    let mut pending = Vec::new();

    for contact in &contacts {
        // Unsubscribe is an absolute veto, regardless of stop_on_reply.
        if contact.is_unsubscribed() {
            continue;
        }
        if campaign.stop_on_reply && replied.contains(&contact.id) {
            debug!(
                campaign_id = %campaign.id,
                contact_id = %contact.id,
                "sequencer_contact_replied_skip"
            );
            continue;
        }

        let occupied = slots.get(&contact.id);
        let has_slot =
            |index: usize, occ: u32| occupied.is_some_and(|s| s.contains(&(index, occ)));

        match interval {
            None => {
                push_due_steps(campaign, contact.id, 0, campaign.first_send_date, now, &has_slot, &mut pending);
            }
            Some(interval_days) => {
                // Latest occurrence that has any materialized row.
                let current = occupied
                    .and_then(|s| s.iter().map(|&(_, occ)| occ).max())
                    .unwrap_or(0);

                let start = campaign.first_send_date
                    + Duration::days(i64::from(current) * interval_days);
                push_due_steps(campaign, contact.id, current, start, now, &has_slot, &mut pending);

                // Generate at most one occurrence of lookahead, and only
                // once the current one is fully materialized.
                let complete = (0..campaign.sequence.len()).all(|i| has_slot(i, current));
                if complete {
                    let next_start = start + Duration::days(interval_days);
                    push_due_steps(
                        campaign,
                        contact.id,
                        current + 1,
                        next_start,
                        now,
                        &has_slot,
                        &mut pending,
                    );
                }
            }
        }
    }

    pending.sort_by(|a, b| {
        (a.scheduled_date, a.campaign_id, a.contact_id)
            .cmp(&(b.scheduled_date, b.campaign_id, b.contact_id))
    });

    debug!(
        campaign_id = %campaign.id,
        contacts = contacts.len(),
        pending = pending.len(),
        "sequencer_pass_complete"
    );

    Ok(pending)
}

fn push_due_steps(
    campaign: &EmailCampaign,
    contact_id: ContactId,
    occurrence: u32,
    occurrence_start: DateTime<Utc>,
    now: DateTime<Utc>,
    has_slot: &dyn Fn(usize, u32) -> bool,
    pending: &mut Vec<PendingSend>,
) {
    for (index, step) in campaign.sequence.iter().enumerate() {
        if has_slot(index, occurrence) {
            continue;
        }
        let scheduled_date = occurrence_start + Duration::days(step.send_delay_days);
        if scheduled_date > now {
            // Delays are non-decreasing, so nothing later is due either.
            break;
        }
        pending.push(PendingSend {
            campaign_id: campaign.id,
            contact_id,
            template_id: step.template_id,
            sequence_index: index,
            occurrence,
            scheduled_date,
        });
    }
}
