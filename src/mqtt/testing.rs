//! Recording transport for unit tests

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::config::QoS;
use super::error::TransportError;
use super::transport::{ClientOptions, EventSink, Transport, TransportHandle};

/// Polls an async condition until it holds, failing the test after two seconds
macro_rules! wait_until {
    ($condition:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !($condition) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met in time: {}",
                stringify!($condition)
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}
pub(crate) use wait_until;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create {
        generation: u64,
    },
    Connect {
        generation: u64,
    },
    Publish {
        generation: u64,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        generation: u64,
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        generation: u64,
        filter: String,
    },
    Disconnect {
        generation: u64,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    sinks: Vec<EventSink>,
    options: Vec<ClientOptions>,
    auto_connect: bool,
    fail_create: Option<String>,
    hang_create: bool,
    fail_disconnect: bool,
    fail_subscribe: BTreeSet<String>,
    drop_on_subscribe: BTreeSet<String>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Fire the connect callback as soon as `connect` is called
    pub fn set_auto_connect(&self, enabled: bool) {
        self.lock().auto_connect = enabled;
    }

    pub fn fail_create(&self, message: &str) {
        self.lock().fail_create = Some(message.to_string());
    }

    /// Make `create_client` never return
    pub fn set_hang_create(&self, enabled: bool) {
        self.lock().hang_create = enabled;
    }

    pub fn set_fail_disconnect(&self, enabled: bool) {
        self.lock().fail_disconnect = enabled;
    }

    pub fn fail_subscribe(&self, filter: &str) {
        self.lock().fail_subscribe.insert(filter.to_string());
    }

    /// Report a lost connection while a subscribe to `filter` is in flight
    pub fn drop_connection_on_subscribe(&self, filter: &str) {
        self.lock().drop_on_subscribe.insert(filter.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Subscribe and unsubscribe calls only, as `("+filter" | "-filter")`
    pub fn subscription_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Subscribe { filter, .. } => Some(format!("+{}", filter)),
                Call::Unsubscribe { filter, .. } => Some(format!("-{}", filter)),
                _ => None,
            })
            .collect()
    }

    pub fn last_options(&self) -> Option<ClientOptions> {
        self.lock().options.last().cloned()
    }

    pub fn sink(&self, generation: u64) -> Option<EventSink> {
        self.lock()
            .sinks
            .iter()
            .find(|sink| sink.generation() == generation)
            .cloned()
    }

    pub async fn wait_for_sink(&self, generation: u64) -> EventSink {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(sink) = self.sink(generation) {
                return sink;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no client created for generation {}",
                generation
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_client(
        &self,
        options: ClientOptions,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let generation = sink.generation();
        let hang = {
            let mut state = self.lock();
            state.calls.push(Call::Create { generation });
            if let Some(message) = &state.fail_create {
                return Err(TransportError::new(message.clone()));
            }
            state.hang_create
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        state.options.push(options);
        state.sinks.push(sink.clone());
        Ok(Box::new(MockHandle {
            generation,
            state: self.state.clone(),
            sink,
        }))
    }
}

struct MockHandle {
    generation: u64,
    state: Arc<Mutex<MockState>>,
    sink: EventSink,
}

impl MockHandle {
    fn record(&self, call: Call) -> MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let auto_connect = self
            .record(Call::Connect {
                generation: self.generation,
            })
            .auto_connect;
        if auto_connect {
            self.sink.on_connect().await;
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.record(Call::Publish {
            generation: self.generation,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let (fail, drop_connection) = {
            let state = self.record(Call::Subscribe {
                generation: self.generation,
                filter: filter.to_string(),
                qos,
            });
            (
                state.fail_subscribe.contains(filter),
                state.drop_on_subscribe.contains(filter),
            )
        };
        if drop_connection {
            self.sink.on_error("network down").await;
            // Let the dispatcher queue up on the session lock before we return
            tokio::task::yield_now().await;
        }
        if fail {
            return Err(TransportError::new(format!("subscribe {} refused", filter)));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.record(Call::Unsubscribe {
            generation: self.generation,
            filter: filter.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let state = self.record(Call::Disconnect {
            generation: self.generation,
        });
        if state.fail_disconnect {
            return Err(TransportError::new("socket already closed"));
        }
        Ok(())
    }
}
