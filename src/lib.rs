// ─── soil-moisture-node: núcleo del ciclo de vida ───
//
// Nodo de humedad de suelo a batería: despierta, conecta WiFi + MQTT,
// publica una lectura, atiende un posible OTA y vuelve a deep sleep.
//
// Este crate de librería contiene toda la lógica que NO depende del
// hardware: máquina de estados de conectividad, latch de sesión MQTT,
// trigger/watchdog de OTA, scheduler del duty cycle, el publicador Homie
// y el nodo `sensor` con su worker de OTA.
// El binario (src/main.rs) conecta estas piezas con esp-idf-svc.

// ─── Módulos ───

pub mod config;
pub mod connectivity;
pub mod homie;
pub mod identity;
pub mod node;
pub mod ota;
pub mod remote_log;
pub mod scheduler;
pub mod sensor;
pub mod session;
pub mod transport;

// ─── Re-exports ───

pub use config::{DutyCycle, Settings};
pub use connectivity::{ConnectivityState, NetworkHooks, Supervisor, Verdict, WifiEvent};
pub use homie::{HomieDevice, PropertyHandler};
pub use identity::DeviceIdentity;
pub use node::SoilNode;
pub use ota::{FirmwareUpdater, OtaOutcome, OtaStatus, OtaTrigger, WatchResult};
pub use scheduler::{CycleReport, Scheduler, WakeReason};
pub use session::SessionGate;
pub use transport::{Delay, Publish, ThreadDelay};
