//! MQTT channel: feeds the job queue from a topic, and publishes jobs.
//!
//! The subscriber never blocks on downstream work: a decoded job is pushed
//! onto the queue and the event loop goes straight back to polling.
//! Reconnection is left to rumqttc, which reconnects on the next poll after
//! a connection error. The topic is re-subscribed on every `ConnAck`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use secrecy::ExposeSecret;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::pipeline::queue::ConcurrentQueue;
use crate::pipeline::types::Job;

/// Topic used when none is given on the command line.
pub const DEFAULT_TOPIC: &str = "queue";

/// Request channel capacity between `AsyncClient` and `EventLoop`.
const REQUEST_CAPACITY: usize = 16;

/// Keep-alive interval sent to the broker.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long a graceful disconnect may take.
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Build client options from the broker config.
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(KEEP_ALIVE);
    if !config.username.is_empty() {
        options.set_credentials(&config.username, config.password.expose_secret());
    }
    options
}

/// Decode one inbound payload and enqueue it.
///
/// Malformed payloads are logged and dropped. Returns whether a job was queued.
pub fn handle_payload(queue: &ConcurrentQueue<Job>, topic: &str, payload: &[u8]) -> bool {
    match Job::from_payload(payload) {
        Ok(job) => {
            info!(
                topic = %topic,
                name = %job.name,
                location = %job.location,
                "Received job"
            );
            queue.enqueue(job);
            true
        }
        Err(e) => {
            warn!(
                topic = %topic,
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "Dropping malformed message"
            );
            false
        }
    }
}

/// Subscribe to `topic` and enqueue every job received until `shutdown`
/// resolves, then disconnect.
///
/// Fails only if the very first connection attempt fails; later connection
/// losses are logged and retried.
pub async fn subscribe<S>(
    config: &BrokerConfig,
    topic: &str,
    queue: Arc<ConcurrentQueue<Job>>,
    shutdown: S,
) -> Result<(), BrokerError>
where
    S: Future<Output = ()>,
{
    info!(host = %config.host, port = config.port, "Connecting to broker");
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
    let mut connected_once = false;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(topic = %topic, "Ending the subscription");
                disconnect(&client, &mut eventloop).await;
                return Ok(());
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker");
                    connected_once = true;
                    client.subscribe(topic, QoS::AtLeastOnce).await?;
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    info!(topic = %topic, "Subscribed to topic");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_payload(&queue, &publish.topic, &publish.payload);
                }
                Ok(event) => {
                    debug!(?event, "MQTT event");
                }
                Err(e) if !connected_once => {
                    return Err(connection_error(config, e));
                }
                Err(e) => {
                    error!(error = %e, "Connection lost, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// Publish one job to `topic` (QoS 0) and disconnect once it is on the wire.
pub async fn publish(config: &BrokerConfig, topic: &str, job: &Job) -> Result<(), BrokerError> {
    let payload = job.to_payload()?;
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);

    client
        .publish(topic, QoS::AtMostOnce, false, payload)
        .await?;

    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(_))) => break,
            Ok(_) => {}
            Err(e) => return Err(connection_error(config, e)),
        }
    }

    info!(topic = %topic, name = %job.name, "Published job");
    disconnect(&client, &mut eventloop).await;
    Ok(())
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "Failed to request disconnect");
        return;
    }

    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("Disconnect not acknowledged within grace period");
    }
}

fn connection_error(config: &BrokerConfig, e: ConnectionError) -> BrokerError {
    BrokerError::Connection {
        host: config.host.clone(),
        port: config.port,
        reason: e.to_string(),
    }
}
