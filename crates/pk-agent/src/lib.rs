//! pk-agent: keeps this host logged in to a captive portal
//!
//! A run takes the instance lock, checks that the host sits on an allowed
//! network, then reconciles the portal session by logging in if needed.

pub mod http_client;
pub mod reconciler;
pub mod run;

pub use http_client::HttpPortalClient;
pub use reconciler::{FailureCause, ReconcileOutcome, ReconcileReport, SessionReconciler};
pub use run::{Run, RunError, RunOutcome};
