//! Data model shared by every pipeline stage.
//!
//! ```text
//! Event ──▶ RiskAssessment ──▶ SessionState ──▶ Alert ──▶ NotificationAttempt
//!              ▲                                  ▲
//!        DetectionRule                        AlertRule
//! ```

pub mod alert;
pub mod assessment;
pub mod event;
pub mod notification;
pub mod rule;
pub mod session;

pub use alert::*;
pub use assessment::*;
pub use event::*;
pub use notification::*;
pub use rule::*;
pub use session::*;
