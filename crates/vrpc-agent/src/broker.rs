//! Broker abstraction and MQTT binding
//!
//! The agent talks to the broker through the [`Broker`] trait; the real
//! implementation wraps an MQTT client, tests substitute recording mocks.

use crate::config::{AgentOptions, Auth, BrokerUrl};
use crate::{AgentError, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, LastWill, MqttOptions, QoS, SubscribeFilter, Transport};
use std::time::Duration;
use tracing::debug;

/// Publish/subscribe capability the agent session consumes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload; `retain` makes the broker keep it for late
    /// subscribers.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Subscribe to one or more topic filters.
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Drop a subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// [`Broker`] implementation over an MQTT client.
pub struct MqttBroker {
    client: AsyncClient,
    qos: QoS,
}

impl MqttBroker {
    /// Wrap an MQTT client; `best_effort` downgrades all traffic to QoS 0.
    pub fn new(client: AsyncClient, best_effort: bool) -> Self {
        Self {
            client,
            qos: qos_for(best_effort),
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload)
            .await
            .map_err(AgentError::from)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        debug!(count = topics.len(), "subscribing");
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), self.qos))
            .collect();
        self.client.subscribe_many(filters).await.map_err(AgentError::from)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await.map_err(AgentError::from)
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(AgentError::from)
    }
}

/// The QoS used for every publication and subscription.
pub(crate) fn qos_for(best_effort: bool) -> QoS {
    if best_effort {
        QoS::AtMostOnce
    } else {
        QoS::AtLeastOnce
    }
}

/// Assemble MQTT connection options for one connect attempt.
pub(crate) fn mqtt_options(
    options: &AgentOptions,
    client_id: &str,
    clean_session: bool,
    last_will: Option<LastWill>,
) -> Result<MqttOptions> {
    let url = BrokerUrl::parse(&options.broker)?;
    let mut mqtt = MqttOptions::new(client_id, url.host, url.port);
    mqtt.set_clean_session(clean_session);
    mqtt.set_keep_alive(Duration::from_secs(30));
    if url.tls {
        mqtt.set_transport(Transport::tls_with_default_config());
    }
    match &options.auth {
        Auth::Anonymous => {}
        Auth::Token(token) => {
            mqtt.set_credentials("__token__", token);
        }
        Auth::Credentials { username, password } => {
            mqtt.set_credentials(username, password);
        }
    }
    if let Some(will) = last_will {
        mqtt.set_last_will(will);
    }
    Ok(mqtt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_downgrade() {
        assert_eq!(qos_for(false), QoS::AtLeastOnce);
        assert_eq!(qos_for(true), QoS::AtMostOnce);
    }

    #[test]
    fn test_mqtt_options_assembly() {
        let options = AgentOptions::new("d", "a")
            .unwrap()
            .with_broker("mqtt://localhost:1884")
            .with_token("secret");
        let mqtt = mqtt_options(&options, "vrpca0123", true, None).unwrap();

        assert_eq!(mqtt.client_id(), "vrpca0123");
        assert_eq!(mqtt.broker_address(), ("localhost".to_string(), 1884));
        assert!(mqtt.clean_session());
        assert_eq!(
            mqtt.credentials(),
            Some(("__token__".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_mqtt_options_reject_bad_url() {
        let options = AgentOptions::new("d", "a").unwrap().with_broker("not-a-url");
        assert!(mqtt_options(&options, "id", false, None).is_err());
    }
}
