//! MQTT telemetry publisher
//!
//! Subscribes to the supervisor's telemetry channel and forwards each record
//! as JSON. It never touches a device; when it falls behind, the channel
//! drops the oldest records instead of stalling the control loop.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::metrics;
use crate::telemetry::TelemetryRecord;

/// MQTT Publisher for telemetry records
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    qos: QoS,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    pub async fn new(config: &MqttConfig) -> Result<Self> {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);

        mqttoptions.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }

        let status_topic = status_topic(&config.topic_prefix);
        mqttoptions.set_last_will(rumqttc::LastWill::new(
            &status_topic,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn event loop handler
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        metrics::record_mqtt_connection(true);
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {:?}", e);
                        metrics::record_mqtt_connection(false);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => {
                warn!("Invalid QoS level {}, using 1", config.qos);
                QoS::AtLeastOnce
            }
        };

        Ok(Self {
            client,
            topic_prefix: config.topic_prefix.clone(),
            qos,
        })
    }

    /// Publish one telemetry record to `<prefix>/<device_id>`
    pub async fn publish(&self, record: &TelemetryRecord) -> Result<()> {
        let topic = record_topic(&self.topic_prefix, record.device_id());
        let payload_str = encode_record(record)?;

        self.client
            .publish(&topic, self.qos, false, payload_str.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to {}", topic))?;

        debug!("Published to {}: {} bytes", topic, payload_str.len());

        Ok(())
    }

    /// Publish bridge status (retained)
    pub async fn publish_status(&self, online: bool) -> Result<()> {
        let topic = status_topic(&self.topic_prefix);
        let payload = if online { "online" } else { "offline" };

        self.client
            .publish(&topic, self.qos, true, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish status to {}", topic))?;

        Ok(())
    }

    /// Forward records until the channel closes or shutdown is signalled
    pub async fn run(
        self,
        mut records: broadcast::Receiver<TelemetryRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.publish_status(true).await {
            warn!("{:#}", e);
        }

        loop {
            tokio::select! {
                received = records.recv() => match received {
                    Ok(record) => {
                        let result = self.publish(&record).await;
                        metrics::record_mqtt_publish(record.device_id(), result.is_ok());
                        if let Err(e) = result {
                            warn!("{:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("MQTT publisher lagging, dropped {} records", skipped);
                        metrics::record_mqtt_dropped(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        if let Err(e) = self.publish_status(false).await {
            warn!("{:#}", e);
        }
        info!("MQTT publisher stopped");
    }
}

fn record_topic(prefix: &str, device_id: &str) -> String {
    format!("{}/{}", prefix, device_id)
}

fn status_topic(prefix: &str) -> String {
    format!("{}/status", prefix)
}

fn encode_record(record: &TelemetryRecord) -> Result<String> {
    serde_json::to_string(record).with_context(|| "Failed to serialize payload")
}
