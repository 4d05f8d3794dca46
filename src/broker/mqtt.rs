use crate::broker::Publisher;
use crate::config::AppConfig;
use crate::error::PublishError;
use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEUE_DELAY: Duration = Duration::from_millis(100);

/// MQTT publisher. All messages go out with QoS 1 and are not retained.
///
/// A background task drives the client event loop and counts broker
/// acknowledgments. Publishes are numbered in the order they are queued, so
/// waiting for one message means waiting until the ack count reaches its
/// number.
///
/// Queueing never waits: when the client request queue is full (the broker
/// has been unreachable for a while) the publish fails and the caller logs
/// it.
pub struct MqttPublisher {
    client: AsyncClient,
    queued: Mutex<u64>,
    acked: watch::Receiver<u64>,
}

impl MqttPublisher {
    /// Connects to `host` and waits for the broker to accept the session.
    pub async fn connect(config: &AppConfig, host: &str) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, host, config.mqtt_broker_port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            config.state_topic(),
            "OFF",
            QoS::AtLeastOnce,
            false,
        ));
        if let Some(user) = &config.mqtt_user {
            options.set_credentials(user, config.mqtt_password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop))
            .await
            .context(format!(
                "Timed out connecting to {}:{}",
                host, config.mqtt_broker_port
            ))?
            .context(format!(
                "Failed to connect to {}:{}",
                host, config.mqtt_broker_port
            ))?;
        info!("Connected to {}:{}", host, config.mqtt_broker_port);

        let (acked_tx, acked) = watch::channel(0);
        tokio::spawn(drive(eventloop, acked_tx));

        Ok(Self {
            client,
            queued: Mutex::new(0),
            acked,
        })
    }

    /// Queues one message and returns its sequence number.
    fn enqueue(&self, topic: &str, payload: String) -> Result<u64, PublishError> {
        let mut queued = self.queued.lock().map_err(|_| PublishError::Closed)?;
        debug!("Publishing to {}: {}", topic, payload);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| PublishError::Client {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        *queued += 1;
        Ok(*queued)
    }

    /// Keeps retrying until the request queue has room. Callers bound it
    /// with a timeout.
    async fn enqueue_when_ready(&self, topic: &str, payload: &str) -> u64 {
        loop {
            match self.enqueue(topic, payload.to_string()) {
                Ok(sequence) => return sequence,
                Err(e) => {
                    debug!("{e}, retrying");
                    time::sleep(REQUEUE_DELAY).await;
                }
            }
        }
    }

    async fn send_and_wait(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        let sequence = self.enqueue_when_ready(topic, payload).await;
        let mut acked = self.acked.clone();
        acked
            .wait_for(|count| *count >= sequence)
            .await
            .map(|_| ())
            .map_err(|_| PublishError::Closed)
    }
}

impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        self.enqueue(topic, payload).map(|_| ())
    }

    async fn publish_and_wait(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        match time::timeout(ACK_TIMEOUT, self.send_and_wait(topic, &payload)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::AckTimeout {
                topic: topic.to_string(),
                seconds: ACK_TIMEOUT.as_secs(),
            }),
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(_)) => return Ok(()),
            Event::Incoming(Packet::Disconnect) => bail!("Broker closed the connection"),
            _ => {}
        }
    }
}

async fn drive(mut eventloop: EventLoop, acked: watch::Sender<u64>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(_))) => acked.send_modify(|count| *count += 1),
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Reconnected to broker"),
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {e}");
                time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 0x10;
    const PUBLISH: u8 = 0x30;
    const PINGREQ: u8 = 0xC0;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Broker {
        /// Acknowledges every publish.
        Acking,
        /// Accepts publishes and never acknowledges them.
        Silent,
        /// Closes the session right after ConnAck and refuses reconnects.
        Vanishing,
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            length |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Packet id of a QoS 1 PUBLISH.
    fn packet_id(body: &[u8]) -> [u8; 2] {
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        [body[2 + topic_len], body[3 + topic_len]]
    }

    /// Serves one MQTT session on a local port and returns the port.
    async fn spawn_broker(behaviour: Broker) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            if behaviour == Broker::Vanishing {
                drop(listener);
            }
            while let Ok((header, body)) = read_packet(&mut stream).await {
                let reply = match header & 0xf0 {
                    CONNECT => vec![0x20, 0x02, 0x00, 0x00],
                    PUBLISH if behaviour == Broker::Acking => {
                        let id = packet_id(&body);
                        vec![0x40, 0x02, id[0], id[1]]
                    }
                    PINGREQ => vec![0xd0, 0x00],
                    _ => continue,
                };
                if stream.write_all(&reply).await.is_err() {
                    break;
                }
                if behaviour == Broker::Vanishing {
                    break;
                }
            }
        });
        port
    }

    fn config(port: u16) -> AppConfig {
        AppConfig {
            client_id: "nas".to_string(),
            prefix: "msm".to_string(),
            mqtt_broker_port: port,
            ..AppConfig::default()
        }
    }

    async fn connect(behaviour: Broker) -> MqttPublisher {
        let port = spawn_broker(behaviour).await;
        MqttPublisher::connect(&config(port), "127.0.0.1")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_wait_returns_once_acknowledged() {
        let publisher = connect(Broker::Acking).await;
        publisher
            .publish("msm/nas/state", "ON".to_string())
            .await
            .unwrap();
        publisher
            .publish_and_wait("msm/nas/state", "OFF".to_string())
            .await
            .unwrap();
        assert_eq!(*publisher.acked.borrow(), 2);
    }

    #[tokio::test]
    async fn test_publish_and_wait_times_out_without_ack() {
        let publisher = connect(Broker::Silent).await;
        let start = Instant::now();
        let result = publisher
            .publish_and_wait("msm/nas/state", "OFF".to_string())
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(PublishError::AckTimeout { seconds: 5, .. })));
        assert!(elapsed >= ACK_TIMEOUT - Duration::from_millis(100));
        assert!(elapsed < ACK_TIMEOUT + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_shutdown_publish_is_bounded_when_broker_is_gone() {
        let publisher = connect(Broker::Vanishing).await;

        // Far more than the request queue holds; none of these may block.
        time::timeout(Duration::from_secs(1), async {
            for _ in 0..REQUEST_CAPACITY + 32 {
                let _ = publisher
                    .publish("msm/nas/memory/memory_usage", "42.000".to_string())
                    .await;
            }
        })
        .await
        .expect("periodic publishes blocked on a full queue");

        let start = Instant::now();
        let result = time::timeout(
            ACK_TIMEOUT * 3,
            publisher.publish_and_wait("msm/nas/state", "OFF".to_string()),
        )
        .await
        .expect("offline publish ignored its timeout");

        assert!(result.is_err());
        assert!(start.elapsed() < ACK_TIMEOUT + Duration::from_secs(2));
    }
}
