// ─── Módulo OTA — Trigger por comando retenido + watchdog acotado ───
//
// El comando llega por la propiedad Homie `sensor/update` (retenida): el
// payload es la URL de la imagen. El trigger:
//   1. payload vacío → no-op (así se ve nuestro propio "borrado")
//   2. marca OTA en curso
//   3. delega la descarga+flash (bloquea hasta terminar)
//   4. SIEMPRE publica "" retenido en el topic del comando, si no el broker
//      lo re-entrega en cada conexión y el nodo se actualiza en loop
//   5. éxito → el firmware reinicia tras un flush; fallo → se loguea y el
//      ciclo normal sigue
//
// El watchdog deja al scheduler esperar un OTA en curso sin quedarse
// colgado para siempre si la descarga se traba.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{Delay, Publish, QoS};

/// Descarga, valida y flashea una imagen. En caso de error la imagen que
/// está corriendo no se toca.
pub trait FirmwareUpdater: Send + Sync {
    fn apply_update(&self, url: &str) -> Result<()>;
}

// ─── Flag compartido ───

/// "Hay un OTA en curso". Lo escribe solo el trigger, lo lee el watchdog.
#[derive(Debug, Default)]
pub struct OtaStatus {
    in_progress: AtomicBool,
}

/// Resultado del watchdog previo al deep sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
    Idle,
    TimedOut,
}

impl OtaStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Marca un OTA en curso. Se llama apenas se acepta el comando, antes
    /// de que el worker lo tome.
    pub(crate) fn begin(&self) {
        self.in_progress.store(true, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    /// Consulta el flag hasta `max_polls` veces, esperando `poll_interval`
    /// entre consultas. `Idle` apenas el flag baja; `TimedOut` si sigue
    /// arriba después de `max_polls × poll_interval`.
    pub fn await_idle_or_timeout(
        &self,
        max_polls: u32,
        poll_interval: Duration,
        delay: &dyn Delay,
    ) -> WatchResult {
        for _ in 0..max_polls {
            if !self.is_active() {
                return WatchResult::Idle;
            }
            info!("OTA ongoing -> wait until finish");
            delay.delay(poll_interval);
        }

        if self.is_active() {
            // Si el OTA sigue colgado, al menos el nodo vuelve a dormir
            self.finish();
            WatchResult::TimedOut
        } else {
            WatchResult::Idle
        }
    }
}

// ─── Trigger ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaOutcome {
    /// Payload vacío: nada que hacer.
    Ignored,
    /// Imagen nueva lista: reiniciar después del flush.
    Installed,
    /// La actualización falló; el ciclo normal continúa.
    Failed,
}

pub struct OtaTrigger<U, P> {
    updater: U,
    publisher: Arc<P>,
    status: Arc<OtaStatus>,
    command_topic: String,
}

impl<U: FirmwareUpdater, P: Publish> OtaTrigger<U, P> {
    /// `command_topic` es el topic `.../update/set` que hay que limpiar.
    pub fn new(
        updater: U,
        publisher: Arc<P>,
        status: Arc<OtaStatus>,
        command_topic: impl Into<String>,
    ) -> Self {
        Self {
            updater,
            publisher,
            status,
            command_topic: command_topic.into(),
        }
    }

    /// Procesa un valor recibido en la propiedad `update`.
    pub fn on_update_command(&self, payload: &[u8]) -> OtaOutcome {
        if payload.is_empty() {
            return OtaOutcome::Ignored;
        }

        let url = String::from_utf8_lossy(payload).trim().to_string();

        self.status.begin();
        info!("get OTA update from {}", url);

        let result = self.updater.apply_update(&url);

        // Borrar el comando retenido pase lo que pase (evita el loop de updates)
        if let Err(e) = self
            .publisher
            .publish(&self.command_topic, b"", QoS::AtLeastOnce, true)
        {
            warn!("Failed to clear OTA command on {}: {:?}", self.command_topic, e);
        }

        match result {
            Ok(()) => {
                // El flag queda arriba: el watchdog no debe dejar dormir
                // antes del reinicio en la imagen nueva
                info!("OTA image ready, reset to start new image");
                OtaOutcome::Installed
            }
            Err(e) => {
                error!("OTA update failed: {:?}", e);
                self.status.finish();
                OtaOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Broker {
        published: Mutex<Vec<(String, Vec<u8>, QoS, bool)>>,
    }

    impl Publish for Broker {
        fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec(), qos, retain));
            Ok(())
        }

        fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<()> {
            Ok(())
        }
    }

    struct Updater {
        succeed: bool,
        seen: Mutex<Vec<String>>,
        status: Arc<OtaStatus>,
        flag_during_update: AtomicBool,
    }

    impl FirmwareUpdater for Updater {
        fn apply_update(&self, url: &str) -> Result<()> {
            self.seen.lock().unwrap().push(url.to_string());
            self.flag_during_update
                .store(self.status.is_active(), Ordering::SeqCst);
            if !self.succeed {
                bail!("image validation failed");
            }
            Ok(())
        }
    }

    const TOPIC: &str = "homie/soil_moisture_sensor_AABBCCDDEEFF/sensor/update/set";

    fn trigger(succeed: bool) -> (OtaTrigger<Updater, Broker>, Arc<Broker>) {
        let status = Arc::new(OtaStatus::new());
        let broker = Arc::new(Broker::default());
        let updater = Updater {
            succeed,
            seen: Mutex::new(Vec::new()),
            status: status.clone(),
            flag_during_update: AtomicBool::new(false),
        };
        (OtaTrigger::new(updater, broker.clone(), status, TOPIC), broker)
    }

    struct NoDelay;

    impl Delay for NoDelay {
        fn delay(&self, _duration: Duration) {}
    }

    #[test]
    fn empty_payload_is_a_no_op() {
        let (trigger, broker) = trigger(true);
        assert_eq!(trigger.on_update_command(b""), OtaOutcome::Ignored);
        assert!(!trigger.status.is_active());
        assert!(broker.published.lock().unwrap().is_empty());
        assert!(trigger.updater.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn success_clears_command_once_and_keeps_flag() {
        let (trigger, broker) = trigger(true);
        let outcome = trigger.on_update_command(b"http://fw.local/soil.bin");

        assert_eq!(outcome, OtaOutcome::Installed);
        assert!(trigger.updater.flag_during_update.load(Ordering::SeqCst));
        assert_eq!(
            *trigger.updater.seen.lock().unwrap(),
            vec!["http://fw.local/soil.bin".to_string()]
        );
        assert_eq!(
            *broker.published.lock().unwrap(),
            vec![(TOPIC.to_string(), Vec::new(), QoS::AtLeastOnce, true)]
        );
        assert!(trigger.status.is_active());
    }

    #[test]
    fn failure_clears_command_and_flag() {
        let (trigger, broker) = trigger(false);
        let outcome = trigger.on_update_command(b"http://fw.local/broken.bin");

        assert_eq!(outcome, OtaOutcome::Failed);
        assert!(!trigger.status.is_active());
        assert_eq!(broker.published.lock().unwrap().len(), 1);
        assert!(broker.published.lock().unwrap()[0].1.is_empty());
    }

    #[test]
    fn watchdog_returns_idle_immediately_when_no_update() {
        let status = OtaStatus::new();
        assert_eq!(
            status.await_idle_or_timeout(50, Duration::from_secs(5), &NoDelay),
            WatchResult::Idle
        );
    }

    #[test]
    fn watchdog_times_out_after_max_polls() {
        struct Counting(Mutex<Vec<Duration>>);
        impl Delay for Counting {
            fn delay(&self, duration: Duration) {
                self.0.lock().unwrap().push(duration);
            }
        }

        let status = OtaStatus::new();
        status.begin();
        let delay = Counting(Mutex::new(Vec::new()));

        let result = status.await_idle_or_timeout(50, Duration::from_secs(5), &delay);
        assert_eq!(result, WatchResult::TimedOut);

        let waited: Duration = delay.0.lock().unwrap().iter().sum();
        assert_eq!(waited, Duration::from_secs(250));
    }

    #[test]
    fn watchdog_sees_update_finish_mid_wait() {
        struct FinishAfter<'a> {
            status: &'a OtaStatus,
            polls: Mutex<u32>,
        }
        impl Delay for FinishAfter<'_> {
            fn delay(&self, _duration: Duration) {
                let mut polls = self.polls.lock().unwrap();
                *polls += 1;
                if *polls == 3 {
                    self.status.finish();
                }
            }
        }

        let status = OtaStatus::new();
        status.begin();
        let delay = FinishAfter {
            status: &status,
            polls: Mutex::new(0),
        };

        let result = status.await_idle_or_timeout(50, Duration::from_secs(5), &delay);
        assert_eq!(result, WatchResult::Idle);
        assert_eq!(*delay.polls.lock().unwrap(), 3);
    }
}
