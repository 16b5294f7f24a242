// ─── Módulo Scheduler — Un despertar completo, de boot a deep sleep ───
//
// Secuencia (una sola vez por despertar):
//   1. arrancar WiFi (el cliente MQTT arranca solo al obtener IP)
//   2. esperar conectividad y sesión MQTT
//   3. una lectura + publicación de telemetría
//   4. si NO venimos de deep sleep: 15s de gracia para comandos retenidos
//   5. watchdog de OTA acotado (50 × 5s)
//   6. devolver cuánto dormir; el firmware entra en deep sleep
//
// El scheduler es el único hilo que bloquea y decide. Los eventos de red y
// de MQTT solo tocan flags compartidos.

use anyhow::Result;
use log::{error, info, warn};
use std::time::Duration;

use crate::config::DutyCycle;
use crate::connectivity::{NetworkHooks, Supervisor};
use crate::ota::{OtaStatus, WatchResult};
use crate::session::SessionGate;
use crate::transport::Delay;

/// Causa del arranque actual, leída una vez del registro de reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    DeepSleepWake,
    Other,
}

/// Lo que pasó en este despertar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub wake: WakeReason,
    pub session_ready: bool,
    pub telemetry_published: bool,
    pub ota: WatchResult,
    pub sleep_for: Duration,
}

pub struct Scheduler<D> {
    cycle: DutyCycle,
    delay: D,
}

impl<D: Delay> Scheduler<D> {
    pub fn new(cycle: DutyCycle, delay: D) -> Self {
        Self { cycle, delay }
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    /// Corre el despertar completo y devuelve el plan de sueño.
    ///
    /// `telemetry` hace la lectura y la publicación; solo se llama con la
    /// sesión MQTT lista.
    pub fn run<H: NetworkHooks>(
        &self,
        wake: WakeReason,
        supervisor: &Supervisor<H>,
        session: &SessionGate,
        ota: &OtaStatus,
        telemetry: impl FnOnce() -> Result<()>,
    ) -> Result<CycleReport> {
        info!("wake reason: {:?}", wake);

        // ─── Conectividad ───

        supervisor.start()?;
        supervisor.await_connected(None);

        info!("wait for mqtt connect");
        let session_ready = session.await_session_ready(self.cycle.session_timeout);

        // ─── Telemetría ───

        let telemetry_published = if session_ready {
            self.delay.delay(self.cycle.publish_pause);
            let published = match telemetry() {
                Ok(()) => true,
                Err(e) => {
                    error!("Telemetry publish failed: {:?}", e);
                    false
                }
            };
            self.delay.delay(self.cycle.publish_pause);
            published
        } else {
            warn!("MQTT session not ready, skipping telemetry this cycle");
            false
        };

        // ─── Gracia para comandos retenidos ───

        if wake != WakeReason::DeepSleepWake {
            info!(
                "not waking up from deep sleep -> wait {}s",
                self.cycle.settle_grace.as_secs()
            );
            self.delay.delay(self.cycle.settle_grace);
        }

        // ─── Watchdog de OTA ───

        if ota.is_active() {
            info!(
                "OTA in progress, waiting up to {}s",
                self.cycle.ota_ceiling().as_secs()
            );
        }
        let ota = ota.await_idle_or_timeout(
            self.cycle.ota_polls,
            self.cycle.ota_poll_interval,
            &self.delay,
        );
        if ota == WatchResult::TimedOut {
            error!("OTA takes too long -> abort and hope for the best");
        }

        // ─── Deep sleep ───

        info!(
            "going to sleep for {}s",
            self.cycle.sleep_period.as_secs()
        );
        self.delay.delay(self.cycle.flush_delay);

        Ok(CycleReport {
            wake,
            session_ready,
            telemetry_published,
            ota,
            sleep_for: self.cycle.sleep_period,
        })
    }
}
