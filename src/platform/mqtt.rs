// ─── Transporte MQTT: EspMqttClient con start/stop por RAII ───
//
// El cliente existe solo mientras hay IP: start_transport() lo crea y
// stop_transport() lo dropea (drop = desconexión + liberar el task de
// esp-mqtt). El Mutex serializa start/stop (event loop del sistema),
// la telemetría (scheduler) y el clear del comando OTA (worker de OTA).

use anyhow::{bail, Result};
use esp_idf_svc::mqtt::client::{
    EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration,
};
use log::{error, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use soil_moisture_node::{Publish, SessionGate};
use soil_moisture_node::transport::QoS;

/// Mensajes entrantes: (topic, payload).
pub type Inbound = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Lo necesario para abrir la sesión. El password se borra al dropear.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Session {
    pub url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub will_topic: String,
    #[zeroize(skip)]
    pub will_payload: &'static [u8],
}

pub struct MqttTransport {
    session: Session,
    gate: Arc<SessionGate>,
    inbound: Inbound,
    client: Mutex<Option<EspMqttClient<'static>>>,
}

impl MqttTransport {
    pub fn new(session: Session, gate: Arc<SessionGate>, inbound: Inbound) -> Self {
        Self {
            session,
            gate,
            inbound,
            client: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut client = self.client();
        if client.is_some() {
            return Ok(());
        }

        let session = &self.session;
        info!("Connecting to MQTT broker: {}", session.url);

        let config = MqttClientConfiguration {
            client_id: Some(&session.client_id),
            username: non_empty(&session.username),
            password: non_empty(&session.password),
            lwt: Some(LwtConfiguration {
                topic: &session.will_topic,
                payload: session.will_payload,
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            keep_alive_interval: Some(Duration::from_secs(60)),
            network_timeout: Duration::from_secs(10),
            ..Default::default()
        };

        let gate = self.gate.clone();
        let inbound = self.inbound.clone();
        let mqtt = EspMqttClient::new_cb(&session.url, &config, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("MQTT_EVENT_CONNECTED");
                    gate.on_transport_connected();
                }
                EventPayload::Disconnected => {
                    info!("MQTT_EVENT_DISCONNECTED");
                    gate.on_transport_disconnected();
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    ..
                } => inbound(topic, data),
                EventPayload::Error(e) => error!("MQTT_EVENT_ERROR: {:?}", e),
                _ => {}
            }
        })?;

        *client = Some(mqtt);
        Ok(())
    }

    pub fn stop(&self) {
        if self.client().take().is_some() {
            info!("MQTT client stopped");
        }
    }

    fn client(&self) -> MutexGuard<'_, Option<EspMqttClient<'static>>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Publish for MqttTransport {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        let mut client = self.client();
        let Some(client) = client.as_mut() else {
            bail!("MQTT transport not started");
        };
        client.publish(topic, qos, retain, payload)?;
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let mut client = self.client();
        let Some(client) = client.as_mut() else {
            bail!("MQTT transport not started");
        };
        client.subscribe(topic, qos)?;
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
