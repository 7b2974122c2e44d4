//! Services - alert policy, rendering and link supervision
//!
//! - `policy` - Distance to blink interval mapping
//! - `alert_driver` - Render thread that owns the outputs
//! - `link_supervisor` - Connect, subscribe, receive and reconnect loop

pub mod alert_driver;
pub mod link_supervisor;
pub mod policy;

// Re-export commonly used types
pub use alert_driver::{AlertDriver, AlertError, AlertHandle, AlertSink};
pub use link_supervisor::{
    LinkState, LinkSupervisor, SupervisorConfig, SupervisorError, SupervisorExit,
};
pub use policy::{compute_interval, target_for_sample};
