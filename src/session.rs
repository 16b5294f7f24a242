// ─── Módulo Session — Latch "sesión MQTT usable" ───
//
// Lo escribe el callback de eventos MQTT (Connected → set, Disconnected →
// clear) y lo espera el scheduler. El set es "sticky": si nadie está
// esperando cuando llega el Connected, el flag queda en true hasta que
// un Disconnected lo limpie. Sin flancos perdidos.

use log::debug;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct SessionGate {
    ready: Mutex<bool>,
    changed: Condvar,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evento MQTT Connected.
    pub fn on_transport_connected(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        *ready = true;
        debug!("session gate: set");
        self.changed.notify_all();
    }

    /// Evento MQTT Disconnected (o la caída del WiFi que para el cliente).
    pub fn on_transport_disconnected(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        *ready = false;
        debug!("session gate: cleared");
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bloquea hasta que la sesión esté lista o venza `timeout`.
    ///
    /// `None` espera indefinidamente. Retorna el estado del flag al salir.
    pub fn await_session_ready(&self, timeout: Option<Duration>) -> bool {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);

        match timeout {
            None => {
                while !*ready {
                    ready = self
                        .changed
                        .wait(ready)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                true
            }
            Some(timeout) => {
                // wait_timeout puede despertar antes (spurious wakeups):
                // recalculamos el tiempo restante contra un deadline fijo
                let deadline = Instant::now() + timeout;
                while !*ready {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .changed
                        .wait_timeout(ready, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    ready = guard;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_is_sticky_without_waiter() {
        let gate = SessionGate::new();
        gate.on_transport_connected();
        assert!(gate.await_session_ready(Some(Duration::from_millis(1))));
        // consumir no limpia el flag
        assert!(gate.is_ready());
    }

    #[test]
    fn clear_makes_waiter_time_out() {
        let gate = SessionGate::new();
        gate.on_transport_connected();
        gate.on_transport_disconnected();
        assert!(!gate.await_session_ready(Some(Duration::from_millis(20))));
    }

    #[test]
    fn waiter_wakes_on_connect_from_other_thread() {
        let gate = Arc::new(SessionGate::new());
        let writer = gate.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.on_transport_connected();
        });

        assert!(gate.await_session_ready(None));
        handle.join().unwrap();
    }
}
