//! Sendloop - Email campaign scheduling, dispatch, and engagement tracking.
//!
//! This library provides the building blocks for the `sendloop` daemon:
//! - `sequencer`: decides which sequence steps are due for which contacts
//! - `executor`: claims due sends and delivers them through the mail provider
//! - `scheduler`: the periodic loop driving sequencing and dispatch
//! - `tracking` + `web`: link/pixel injection and the recipient-facing
//!   tracking endpoints
//!
//! ## Architecture
//!
//! ```text
//! Campaigns → Sequencer → campaign_sends → Executor → Mail Provider
//!                                              ↓
//! Recipients → /t/open, /t/click → Recorder → tracking_events
//! ```

pub mod clock;
pub mod config;
pub mod contacts;
pub mod executor;
pub mod model;
pub mod render;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod tracking;
pub mod transport;
pub mod web;

// Re-export commonly used types
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use executor::DispatchExecutor;
pub use model::{CampaignSend, CampaignStatus, EmailCampaign, TrackingEvent, TrackingId};
pub use scheduler::Scheduler;
pub use store::{CampaignStore, MemoryStore};
pub use tracking::EventRecorder;
pub use web::AppState;
