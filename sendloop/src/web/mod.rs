//! Tracking web surface.
//!
//! Two recipient-facing endpoints, both fail-open: `/t/open` always answers
//! with a valid pixel and `/t/click` always redirects, no matter what the
//! tracking id looks like or what the store is doing. Recipients must never
//! see a tracking failure.

pub mod handlers;

pub use handlers::{health, router, track_click, track_open, AppState, HealthResponse};
