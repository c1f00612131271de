use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::mpsc;

use crate::{config, messages::Event};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("encoding event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"observer-bridge".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or("observer".to_string()),
                publisher_id: sanitize_name(&publisher_id),
            },
            eventloop,
        )
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}/{}", self.topic_path, self.publisher_id, leaf)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(self.topic("command"), QoS::AtLeastOnce)
            .await
    }

    /// Polls the connection forever, forwarding command payloads to `tx`.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, tx: mpsc::Sender<String>) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                        let payload = String::from_utf8_lossy(&p.payload).into_owned();
                        if tx.send(payload).await.is_err() {
                            debug!("Command receiver closed, leaving MQTT loop");
                            return;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    warn!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn publish(&self, leaf: &str, event: &Event) -> Result<(), PublishError> {
        let payload = event.to_json()?;
        self.client
            .publish(self.topic(leaf), QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Sightings, heartbeats and unsolicited status go to `events`.
    pub async fn publish_event(&self, event: &Event) -> Result<(), PublishError> {
        self.publish("events", event).await
    }

    pub async fn publish_response(&self, event: &Event) -> Result<(), PublishError> {
        self.publish("response", event).await
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn sanitize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect::<String>()
}
