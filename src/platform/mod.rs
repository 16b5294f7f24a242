// ─── Plataforma ESP-IDF ───
//
// Implementaciones reales de los traits del núcleo: driver WiFi, cliente
// MQTT, OTA por HTTP, sonda ADC y llamadas al sistema.

pub mod firmware;
pub mod mqtt;
pub mod probe;
pub mod system;
pub mod wifi;
