//! rumqttc-backed [`Transport`]
//!
//! Each handle owns an `AsyncClient` plus a polling task that drives its
//! `EventLoop` and turns broker packets into [`EventSink`] callbacks. The event
//! loop reconnects on its own when polled after an error; the task keeps polling
//! with a delay until the handle is disconnected or dropped.
//!
//! A disconnect runs while the session lock is held, and the session cannot
//! drain callbacks without that lock. The handle therefore marks itself closing
//! first: the polling task stops delivering callbacks but keeps polling, so the
//! DISCONNECT packet still reaches the broker.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::QoS;
use super::error::TransportError;
use super::transport::{ClientOptions, EventSink, Transport, TransportHandle};

const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

pub struct RumqttTransport {
    request_capacity: usize,
    reconnect_delay: Duration,
}

impl RumqttTransport {
    pub fn new(request_capacity: usize, reconnect_delay: Duration) -> Self {
        Self {
            request_capacity,
            reconnect_delay,
        }
    }
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(1))
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn create_client(
        &self,
        options: ClientOptions,
        sink: EventSink,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        info!(
            "Creating MQTT client {} for {} (generation {})",
            options.client_id,
            options.uri,
            sink.generation()
        );

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &options.credentials {
            mqtt_options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        if options.tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, self.request_capacity);

        Ok(Box::new(RumqttHandle {
            client,
            event_loop: Some(event_loop),
            sink,
            closing: CancellationToken::new(),
            cancel: CancellationToken::new(),
            poller: None,
            reconnect_delay: self.reconnect_delay,
        }))
    }
}

struct RumqttHandle {
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    sink: EventSink,
    closing: CancellationToken,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
    reconnect_delay: Duration,
}

#[async_trait]
impl TransportHandle for RumqttHandle {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| TransportError::new("Client was already started"))?;

        self.poller = Some(tokio::spawn(poll_events(
            event_loop,
            self.sink.clone(),
            self.closing.clone(),
            self.cancel.clone(),
            self.reconnect_delay,
        )));
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(|e| TransportError::new(format!("Publish to {} failed: {}", topic, e)))
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, qos.into())
            .await
            .map_err(|e| TransportError::new(format!("Subscribe to {} failed: {}", filter, e)))
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::new(format!("Unsubscribe from {} failed: {}", filter, e)))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.closing.cancel();
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::new(format!("Disconnect failed: {}", e)));

        // The disconnect request only leaves once the event loop is polled again
        if let Some(mut poller) = self.poller.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut poller)
                .await
                .is_err()
            {
                debug!("Event loop did not stop within grace period, cancelling");
                self.cancel.cancel();
                poller.abort();
            }
        }
        self.cancel.cancel();
        result
    }
}

impl Drop for RumqttHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_events(
    mut event_loop: EventLoop,
    sink: EventSink,
    closing: CancellationToken,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    debug!("Event loop started for generation {}", sink.generation());
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    deliver(&closing, sink.on_connect()).await;
                } else {
                    let reason = format!("Broker refused connection: {:?}", ack.code);
                    deliver(&closing, sink.on_error(reason)).await;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = publish.payload.to_vec();
                deliver(&closing, sink.on_message(publish.topic, payload)).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                deliver(&closing, sink.on_close()).await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT event loop error: {}", e);
                deliver(&closing, sink.on_error(e.to_string())).await;
                // Nothing left to flush once the network is gone
                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }

        if sink.is_closed() {
            break;
        }
    }
    debug!("Event loop stopped for generation {}", sink.generation());
}

/// Runs a sink callback unless the handle started closing
async fn deliver(closing: &CancellationToken, callback: impl Future<Output = ()>) {
    tokio::select! {
        biased;
        _ = closing.cancelled() => {}
        _ = callback => {}
    }
}
