// ─── Módulo Transport — Seams hacia el cliente MQTT y el reloj ───
//
// El núcleo nunca toca EspMqttClient ni FreeRtos directamente: habla con
// estos traits. En el firmware los implementan los adaptadores de
// src/platform/; en los tests, dobles que graban cada llamada.

use anyhow::Result;
use std::time::Duration;

pub use embedded_svc::mqtt::client::QoS;

/// Publicación sobre el handle MQTT compartido.
///
/// `&self` porque el handle lo comparten el scheduler (telemetría), el
/// worker de OTA y los eventos de red (start/stop): la implementación
/// sincroniza por dentro.
pub trait Publish: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
}

/// Espera bloqueante del hilo que llama.
pub trait Delay: Send + Sync {
    fn delay(&self, duration: Duration);
}

/// Delay real: duerme el thread (en ESP-IDF cede la CPU a FreeRTOS).
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
