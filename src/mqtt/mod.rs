//! # MQTT Session Module
//!
//! Owns the broker side of the dashboard: one session per process, the topic
//! subscriptions the widgets need and the routing of inbound messages back to
//! those widgets.
//!
//! ## Why This Module Exists
//!
//! Widgets come and go while the broker connection drops and returns on its own
//! schedule. Something has to keep the broker's view of "what we are subscribed
//! to" in line with the widget list across both kinds of change, and it has to
//! ignore callbacks from clients that were already replaced.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection config, QoS, protocol
//! ├── error.rs            - Error enums and UI error events
//! ├── topic.rs            - Filter matching and validation
//! ├── registry.rs         - Topic filter to interested widgets
//! ├── transport.rs        - Transport traits and the generation-tagged event sink
//! ├── rumqtt.rs           - rumqttc implementation of the transport
//! ├── session.rs          - Session state machine and event dispatcher
//! ├── message_manager.rs  - Inbound routing and latest-message map
//! └── reconcile.rs        - Subscription reconciliation loop
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! widget store ──watch──► reconcile ──subscribe/unsubscribe──► session ──► transport
//!                             ▲                                   │
//!                             └──────────state changes────────────┤
//!                                                                 ▼
//!                       UI ◄──broadcast── message_manager ◄── dispatcher
//! ```

pub mod config;
pub mod error;
pub mod message_manager;
pub mod reconcile;
pub mod registry;
pub mod rumqtt;
pub mod session;
pub mod topic;
pub mod transport;

#[cfg(test)]
pub mod testing;
