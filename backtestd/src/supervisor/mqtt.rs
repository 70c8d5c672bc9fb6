//! MQTT transport for the Core link.
//!
//! Request/response over the broker, patterned after the command/response
//! topics of the rest of the platform:
//! - requests go out on versioned topics (`core/plugins/register@v1`, ...)
//! - every request carries a correlation id and a `reply_to` topic
//! - a background router task polls the event loop, tracks connection
//!   readiness from ConnAck, and completes the matching in-flight call
//!   when a reply arrives

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    HeartbeatAck, HeartbeatRequest, RegisterAck, RegisterRequest, SupervisorClient,
    SupervisorError, UnregisterAck, UnregisterRequest,
};

const TOPIC_REGISTER: &str = "core/plugins/register@v1";
const TOPIC_HEARTBEAT: &str = "core/plugins/heartbeat@v1";
const TOPIC_UNREGISTER: &str = "core/plugins/unregister@v1";

/// Outgoing request wrapper.
#[derive(Debug, Serialize)]
struct RequestEnvelope<T> {
    request_id: String,
    reply_to: String,
    body: T,
}

/// Incoming reply wrapper.
#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    request_id: String,
    body: serde_json::Value,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>;

/// Broker-backed `SupervisorClient`.
pub struct MqttSupervisorClient {
    client: AsyncClient,
    reply_topic: String,
    request_timeout: Duration,
    pending: PendingMap,
    ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl MqttSupervisorClient {
    /// Open the broker connection and start the reply router.
    ///
    /// `address` is `host:port` of the broker the Core listens behind.
    pub fn connect(
        address: &str,
        plugin_id: &str,
        request_timeout: Duration,
    ) -> Result<Self, SupervisorError> {
        let (host, port) = split_address(address)?;

        let client_id = format!("backtestd-{}", plugin_id);
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 16);
        let reply_topic = format!("core/plugins/reply/{}@v1", plugin_id);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_router(
            eventloop,
            client.clone(),
            reply_topic.clone(),
            pending.clone(),
            ready_tx,
            shutdown_rx,
        );

        Ok(Self {
            client,
            reply_topic,
            request_timeout,
            pending,
            ready_rx,
            shutdown_tx,
        })
    }

    async fn call<B, R>(&self, topic: &str, body: B) -> Result<R, SupervisorError>
    where
        B: Serialize + Send,
        R: DeserializeOwned,
    {
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), reply_tx);

        let envelope = RequestEnvelope {
            request_id: request_id.clone(),
            reply_to: self.reply_topic.clone(),
            body,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| SupervisorError::Transport(format!("encode request: {e}")))?;

        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.pending.lock().remove(&request_id);
            return Err(SupervisorError::Transport(format!("publish {topic}: {e}")));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(SupervisorError::Timeout(self.request_timeout))
            }
            Ok(Err(_)) => Err(SupervisorError::Closed),
            Ok(Ok(value)) => serde_json::from_value(value)
                .map_err(|e| SupervisorError::Transport(format!("decode reply: {e}"))),
        }
    }
}

#[async_trait::async_trait]
impl SupervisorClient for MqttSupervisorClient {
    async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready_rx = self.ready_rx.clone();
        let wait = async {
            loop {
                if *ready_rx.borrow() {
                    return;
                }
                if ready_rx.changed().await.is_err() {
                    // Router gone; never becomes ready.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, SupervisorError> {
        self.call(TOPIC_REGISTER, request).await
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatAck, SupervisorError> {
        self.call(TOPIC_HEARTBEAT, request).await
    }

    async fn unregister(
        &self,
        request: UnregisterRequest,
    ) -> Result<UnregisterAck, SupervisorError> {
        self.call(TOPIC_UNREGISTER, request).await
    }
}

impl Drop for MqttSupervisorClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn spawn_router(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    reply_topic: String,
    pending: PendingMap,
    ready_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("core link router stopping");
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // (Re)subscribe after every (re)connect.
                        if let Err(e) = client.subscribe(&reply_topic, QoS::AtLeastOnce).await {
                            warn!("core link subscribe failed: {e}");
                            continue;
                        }
                        let _ = ready_tx.send(true);
                        debug!("core link ready, replies on {reply_topic}");
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish)))
                        if publish.topic == reply_topic =>
                    {
                        match serde_json::from_slice::<ReplyEnvelope>(&publish.payload) {
                            Ok(reply) => {
                                if let Some(tx) = pending.lock().remove(&reply.request_id) {
                                    let _ = tx.send(reply.body);
                                } else {
                                    debug!("late or unknown reply {}", reply.request_id);
                                }
                            }
                            Err(e) => warn!("invalid reply payload on {}: {e}", publish.topic),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = ready_tx.send(false);
                        warn!("core link MQTT error: {e:?}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    });
}

fn split_address(address: &str) -> Result<(String, u16), SupervisorError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SupervisorError::Transport(format!("invalid core address: {address}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| SupervisorError::Transport(format!("invalid core port in: {address}")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(
            split_address("localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert!(split_address("no-port").is_err());
        assert!(split_address("host:notaport").is_err());
    }
}
