//! Tracking event recorder.
//!
//! Records pixel opens and redirect clicks against their campaign sends.
//! Every failure path is fail-open: an unrecognized tracking id or a store
//! error is logged and swallowed so the recipient-facing pixel/redirect is
//! never affected.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::model::{EventKind, TrackingEvent, TrackingId};
use crate::store::CampaignStore;

/// Best-effort client metadata captured from the incoming request.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

pub struct EventRecorder {
    store: Arc<dyn CampaignStore>,
    clock: Arc<dyn Clock>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn CampaignStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a pixel open. The first open per send flips `is_opened` and
    /// bumps the campaign's opened total; repeats only append to the event
    /// log (image proxies and pre-fetchers open repeatedly).
    pub async fn record_open(&self, tracking_id: &TrackingId, meta: ClientMeta) {
        let now = self.clock.now();

        let send = match self.store.send_by_tracking_id(tracking_id).await {
            Ok(Some(send)) => send,
            Ok(None) => {
                debug!(tracking_id = %tracking_id, "tracking_open_unrecognized");
                return;
            }
            Err(e) => {
                warn!(tracking_id = %tracking_id, error = %e, "tracking_open_lookup_failed");
                return;
            }
        };

        let event = TrackingEvent {
            tracking_id: tracking_id.clone(),
            kind: EventKind::Open,
            target_url: None,
            occurred_at: now,
            client_ip: meta.ip,
            user_agent: meta.user_agent,
        };
        if let Err(e) = self.store.append_event(event).await {
            warn!(tracking_id = %tracking_id, error = %e, "tracking_open_append_failed");
        }

        match self.store.mark_opened_if_first(send.id, now).await {
            Ok(true) => {
                info!(
                    tracking_id = %tracking_id,
                    send_id = %send.id,
                    campaign_id = %send.campaign_id,
                    "tracking_first_open_recorded"
                );
            }
            Ok(false) => {
                debug!(tracking_id = %tracking_id, "tracking_repeat_open");
            }
            Err(e) => {
                warn!(tracking_id = %tracking_id, error = %e, "tracking_open_flag_failed");
            }
        }
    }

    /// Record a redirect click for `target`. Same first-event semantics as
    /// opens. The caller redirects regardless of what happens here.
    pub async fn record_click(&self, tracking_id: &TrackingId, target: &str, meta: ClientMeta) {
        let now = self.clock.now();

        let send = match self.store.send_by_tracking_id(tracking_id).await {
            Ok(Some(send)) => send,
            Ok(None) => {
                debug!(tracking_id = %tracking_id, "tracking_click_unrecognized");
                return;
            }
            Err(e) => {
                warn!(tracking_id = %tracking_id, error = %e, "tracking_click_lookup_failed");
                return;
            }
        };

        let event = TrackingEvent {
            tracking_id: tracking_id.clone(),
            kind: EventKind::Click,
            target_url: Some(target.to_string()),
            occurred_at: now,
            client_ip: meta.ip,
            user_agent: meta.user_agent,
        };
        if let Err(e) = self.store.append_event(event).await {
            warn!(tracking_id = %tracking_id, error = %e, "tracking_click_append_failed");
        }

        match self.store.mark_clicked_if_first(send.id, now).await {
            Ok(true) => {
                info!(
                    tracking_id = %tracking_id,
                    send_id = %send.id,
                    campaign_id = %send.campaign_id,
                    target_url = %target,
                    "tracking_first_click_recorded"
                );
            }
            Ok(false) => {
                debug!(tracking_id = %tracking_id, "tracking_repeat_click");
            }
            Err(e) => {
                warn!(tracking_id = %tracking_id, error = %e, "tracking_click_flag_failed");
            }
        }
    }
}
