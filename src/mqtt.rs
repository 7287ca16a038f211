//! Optional MQTT sink for decoded readings.

use crate::session::Reading;
use tokio_util::task::AbortOnDropHandle;
use tracing::{trace, warn};

#[derive(clap::Parser, Clone)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Publish every decoded reading as JSON to this MQTT broker
    /// (e.g. mqtt://broker.local:1883?client_id=eversolar).
    #[arg(long)]
    mqtt_url: Option<String>,

    /// Topic the readings are published to.
    #[arg(long, default_value = "pvsolar")]
    mqtt_topic: String,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not parse the MQTT broker url")]
    ParseUrl(#[source] rumqttc::OptionError),
}

pub struct Publisher {
    client: rumqttc::AsyncClient,
    topic: String,
    #[allow(unused)] // exists for its drop handler
    event_task: AbortOnDropHandle<()>,
}

impl Publisher {
    /// Returns `None` when no broker was configured.
    pub fn from_args(args: &Args) -> Result<Option<Publisher>, Error> {
        let Some(url) = &args.mqtt_url else {
            return Ok(None);
        };
        let options = rumqttc::MqttOptions::parse_url(url).map_err(Error::ParseUrl)?;
        let (client, mut event_loop) = rumqttc::AsyncClient::new(options, 16);
        let event_task = AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => trace!(message = "mqtt event", event = ?event),
                    Err(e) => {
                        warn!(
                            message = "mqtt connection error",
                            error = &e as &dyn std::error::Error,
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }));
        Ok(Some(Publisher { client, topic: args.mqtt_topic.clone(), event_task }))
    }

    /// Publish one reading. Failures are logged; the polling loop goes on.
    pub async fn publish(&self, reading: &Reading) {
        let payload = match serde_json::to_vec(reading) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    message = "could not serialize the reading",
                    error = &e as &dyn std::error::Error,
                );
                return;
            }
        };
        let publish =
            self.client.publish(self.topic.clone(), rumqttc::QoS::AtMostOnce, false, payload);
        if let Err(e) = publish.await {
            warn!(
                message = "could not publish the reading",
                topic = %self.topic,
                error = &e as &dyn std::error::Error,
            );
        }
    }
}
