// ─── Módulo Node — El nodo Homie "sensor" y el worker de OTA ───
//
// Un solo nodo con dos propiedades:
//   sensor/moisture  integer %, retenida, solo lectura → telemetría
//   sensor/update    string, retenida, configurable   → trigger de OTA
//
// El comando `update` llega en el contexto de eventos MQTT. No se procesa
// ahí: se encola para un worker propio, así el cliente MQTT sigue
// despachando eventos (y publicando) mientras se descarga la imagen.
// El flag de OTA en curso sube al encolar: un comando aceptado pero
// todavía no tomado por el worker ya frena el deep sleep.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::homie::{
    Datatype, DeviceDescriptor, NodeDescriptor, PropertyDescriptor, PropertyHandler,
};
use crate::identity::DeviceIdentity;
use crate::ota::{FirmwareUpdater, OtaOutcome, OtaStatus, OtaTrigger};
use crate::sensor::{self, MoistureProbe};
use crate::transport::{Delay, Publish};

pub const DEVICE_NAME: &str = "Soil Moisture Sensor";
pub const NODE_ID: &str = "sensor";
pub const MOISTURE: &str = "moisture";
pub const UPDATE: &str = "update";

/// Stack del worker: HTTP + TLS + escritura en flash.
const OTA_WORKER_STACK: usize = 8 * 1024;

/// Árbol Homie del sensor de humedad.
pub fn describe(identity: &DeviceIdentity, firmware: &str, version: &str) -> Result<DeviceDescriptor> {
    DeviceDescriptor::builder(identity.device_id(), DEVICE_NAME)
        .mac(&identity.mac_string())
        .firmware(firmware, version)
        .stats_interval(0)
        .node(
            NodeDescriptor::new(NODE_ID, NODE_ID, "soilmoisture")
                .property(
                    PropertyDescriptor::new(MOISTURE, "Moisture")
                        .retained(true)
                        .unit("%")
                        .datatype(Datatype::Integer),
                )
                .property(
                    PropertyDescriptor::new(UPDATE, "update")
                        .settable(true)
                        .retained(true)
                        .datatype(Datatype::String),
                ),
        )
        .build()
}

/// Topic del comando OTA que hay que limpiar después de cada intento.
pub fn update_command_topic(identity: &DeviceIdentity) -> String {
    format!("homie/{}/{}/{}/set", identity.device_id(), NODE_ID, UPDATE)
}

// ─── Handler ───

pub struct SoilNode<P, D> {
    probe: Mutex<P>,
    delay: D,
    settle: Duration,
    updates: Sender<Vec<u8>>,
    ota: Arc<OtaStatus>,
}

impl<P: MoistureProbe, D: Delay> SoilNode<P, D> {
    pub fn new(
        probe: P,
        delay: D,
        settle: Duration,
        updates: Sender<Vec<u8>>,
        ota: Arc<OtaStatus>,
    ) -> Self {
        Self {
            probe: Mutex::new(probe),
            delay,
            settle,
            updates,
            ota,
        }
    }

    fn read_moisture(&self) -> Option<String> {
        let mut probe = match self.probe.lock() {
            Ok(probe) => probe,
            Err(poisoned) => poisoned.into_inner(),
        };
        match sensor::sample(&mut *probe, &self.delay, self.settle) {
            Ok(reading) => Some(reading.payload()),
            Err(e) => {
                error!("Moisture read failed: {:?}", e);
                None
            }
        }
    }
}

impl<P: MoistureProbe, D: Delay> PropertyHandler for SoilNode<P, D> {
    fn read(&self, node: &str, property: &str) -> Option<String> {
        match (node, property) {
            (NODE_ID, MOISTURE) => self.read_moisture(),
            _ => None,
        }
    }

    fn write(&self, node: &str, property: &str, payload: &[u8]) {
        if (node, property) != (NODE_ID, UPDATE) {
            warn!("Unexpected command for {}/{}", node, property);
            return;
        }
        // Vacío = nuestro propio borrado del comando retenido
        if !payload.is_empty() {
            self.ota.begin();
        }
        if self.updates.send(payload.to_vec()).is_err() {
            error!("OTA worker is gone, dropping update command");
            self.ota.finish();
        }
    }
}

// ─── Worker de OTA ───

/// Lanza el thread que procesa comandos `update` en orden de llegada.
///
/// Si un update se instala, llama a `on_installed` (en el firmware:
/// flush + reinicio) y termina.
pub fn spawn_ota_worker<U, P, F>(
    trigger: OtaTrigger<U, P>,
    commands: Receiver<Vec<u8>>,
    on_installed: F,
) -> Result<JoinHandle<()>>
where
    U: FirmwareUpdater + 'static,
    P: Publish + 'static,
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("ota".into())
        .stack_size(OTA_WORKER_STACK)
        .spawn(move || {
            for payload in commands {
                match trigger.on_update_command(&payload) {
                    OtaOutcome::Ignored => {}
                    OtaOutcome::Failed => info!("continuing normal cycle after failed OTA"),
                    OtaOutcome::Installed => {
                        on_installed();
                        return;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// Canal entre el handler (contexto MQTT) y el worker.
pub fn update_channel() -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
    mpsc::channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    struct NoDelay;

    impl Delay for NoDelay {
        fn delay(&self, _duration: Duration) {}
    }

    struct Fixed(u16);

    impl MoistureProbe for Fixed {
        fn power_on(&mut self) -> Result<()> {
            Ok(())
        }
        fn power_off(&mut self) -> Result<()> {
            Ok(())
        }
        fn read_raw(&mut self) -> Result<u16> {
            Ok(self.0)
        }
    }

    #[test]
    fn descriptor_has_moisture_and_update() {
        let identity = DeviceIdentity::from_mac(MAC);
        let descriptor = describe(&identity, "ota_0", "0.1.0").unwrap();
        assert_eq!(descriptor.id, "soil_moisture_sensor_AABBCCDDEEFF");
        let node = &descriptor.nodes[0];
        assert_eq!(node.node_type, "soilmoisture");
        assert!(!node.properties[0].settable);
        assert!(node.properties[1].settable);
    }

    #[test]
    fn command_topic_targets_update_set() {
        let identity = DeviceIdentity::from_mac(MAC);
        assert_eq!(
            update_command_topic(&identity),
            "homie/soil_moisture_sensor_AABBCCDDEEFF/sensor/update/set"
        );
    }

    fn soil(tx: Sender<Vec<u8>>, ota: &Arc<OtaStatus>) -> SoilNode<Fixed, NoDelay> {
        SoilNode::new(Fixed(512), NoDelay, Duration::ZERO, tx, ota.clone())
    }

    #[test]
    fn moisture_read_samples_probe() {
        let (tx, _rx) = update_channel();
        let node = soil(tx, &Arc::new(OtaStatus::new()));
        assert_eq!(node.read(NODE_ID, MOISTURE).as_deref(), Some("59"));
        assert_eq!(node.read(NODE_ID, UPDATE), None);
    }

    #[test]
    fn update_write_is_queued_for_worker() {
        let (tx, rx) = update_channel();
        let node = soil(tx, &Arc::new(OtaStatus::new()));
        node.write(NODE_ID, UPDATE, b"http://fw.local/soil.bin");
        node.write(NODE_ID, MOISTURE, b"12");
        assert_eq!(rx.try_recv().unwrap(), b"http://fw.local/soil.bin".to_vec());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queued_update_holds_off_sleep_before_worker_starts() {
        use crate::ota::WatchResult;

        let (tx, _rx) = update_channel();
        let ota = Arc::new(OtaStatus::new());
        let node = soil(tx, &ota);

        // Nadie consume la cola todavía
        node.write(NODE_ID, UPDATE, b"http://fw.local/soil.bin");
        assert!(ota.is_active());

        let polls = Mutex::new(0u32);
        struct Counting<'a>(&'a Mutex<u32>);
        impl Delay for Counting<'_> {
            fn delay(&self, _duration: Duration) {
                *self.0.lock().unwrap() += 1;
            }
        }
        let result = ota.await_idle_or_timeout(50, Duration::from_secs(5), &Counting(&polls));
        assert_eq!(result, WatchResult::TimedOut);
        assert_eq!(*polls.lock().unwrap(), 50);
    }

    #[test]
    fn empty_update_does_not_raise_flag() {
        let (tx, rx) = update_channel();
        let ota = Arc::new(OtaStatus::new());
        let node = soil(tx, &ota);

        node.write(NODE_ID, UPDATE, b"");
        assert!(!ota.is_active());
        assert_eq!(rx.try_recv().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn update_with_worker_gone_lowers_flag() {
        let (tx, rx) = update_channel();
        drop(rx);
        let ota = Arc::new(OtaStatus::new());
        let node = soil(tx, &ota);

        node.write(NODE_ID, UPDATE, b"http://fw.local/soil.bin");
        assert!(!ota.is_active());
    }
}
