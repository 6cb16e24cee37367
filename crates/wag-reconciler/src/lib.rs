//! Dataplane reconciliation for the wag control plane.
//!
//! Three pieces: the [`Dataplane`] trait the packet-forwarding plane
//! implements, the per-device authorisation state (classification plus the
//! session expiry sweep), and the [`Reconciler`] that replays store events
//! into dataplane operations and couples its lifecycle to cluster health.

pub mod dataplane;
pub mod reconciler;
pub mod sessions;

pub use dataplane::Dataplane;
pub use dataplane::DataplaneCall;
pub use dataplane::DataplaneError;
pub use dataplane::RuleRecord;
pub use dataplane::SessionRecord;
pub use dataplane::TrackingDataplane;
pub use reconciler::Reconciler;
pub use reconciler::ReconcilerError;
pub use reconciler::ReconcilerMetrics;
pub use sessions::classify;
pub use sessions::DeviceState;
pub use sessions::SessionTracker;
