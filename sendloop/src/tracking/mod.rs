//! Engagement tracking: link/pixel injection into outbound HTML and
//! fail-open recording of the resulting open and click events.

pub mod injector;
pub mod recorder;

pub use injector::inject;
pub use recorder::{ClientMeta, EventRecorder};
