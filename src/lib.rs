//! MQTT dashboard core: one broker session, widget-driven subscriptions and
//! routing of inbound messages to the widgets that asked for them.

pub mod config;
pub mod dashboard;
pub mod mqtt;
pub mod persistence;

pub use dashboard::{Dashboard, DashboardSettings};
