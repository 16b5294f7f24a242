// ─── Módulo Connectivity — Supervisor WiFi con reintentos acotados ───
//
// Máquina de estados explícita:
//
//   Disconnected ──start()──▶ Connecting ──GotIp──▶ Connected
//        ▲                        │                     │
//        └──────Disconnected──────┴─────Disconnected────┘
//
// Cada desconexión incrementa el contador de reintentos y vuelve a asociar.
// Al superar RETRY_LIMIT el supervisor devuelve `Verdict::Restart`: el
// firmware reinicia el chip en vez de seguir reintentando para siempre.
//
// Los efectos sobre el mundo real (driver WiFi, cliente MQTT, log remoto)
// pasan por el trait `NetworkHooks`, así la máquina se testea inyectando
// eventos sintéticos.

use anyhow::Result;
use log::{error, info, warn};
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RETRY_LIMIT;
use crate::identity::{DeviceIdentity, Hostname};
use crate::session::SessionGate;

/// Código de desconexión "basic rate not supported" del stack WiFi.
/// El AP exige tasas que el modo actual de la radio no ofrece.
pub const REASON_BASIC_RATE_NOT_SUPPORT: u16 = 205;

// ─── Tipos ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

/// Eventos del stack de red, ya traducidos desde ESP-IDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    /// El driver arrancó en modo station.
    StaStarted,
    /// Asociación completa + IP por DHCP.
    GotIp(Ipv4Addr),
    /// Se perdió (o nunca se logró) la asociación.
    Disconnected { reason: u16 },
}

/// Qué debe hacer el firmware después de procesar un evento.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Reintentos agotados: reiniciar el proceso sin más intentos.
    Restart,
}

/// Efectos secundarios de las transiciones de conectividad.
pub trait NetworkHooks: Send {
    /// Arranca el driver WiFi; el stack responde con `StaStarted`.
    fn power_up(&mut self) -> Result<()>;

    /// Inicia (o reintenta) la asociación con el AP.
    fn associate(&mut self) -> Result<()>;

    fn set_hostname(&mut self, hostname: &str) -> Result<()>;

    /// Limita la radio a 802.11 b/g/n.
    fn restrict_protocol(&mut self) -> Result<()>;

    fn start_remote_log(&mut self, hostname: &str) -> Result<()>;

    fn stop_remote_log(&mut self);

    /// Arranca el cliente MQTT (se conecta por su cuenta).
    fn start_transport(&mut self) -> Result<()>;

    fn stop_transport(&mut self);
}

// ─── Supervisor ───

#[derive(Debug)]
struct Link {
    state: ConnectivityState,
    retries: u32,
    address: Option<Ipv4Addr>,
}

/// Dueño exclusivo del estado de conectividad.
///
/// Los eventos llegan desde el contexto del event loop de ESP-IDF (un solo
/// contexto, así que ya vienen serializados); el scheduler solo observa el
/// estado a través de `await_connected`.
pub struct Supervisor<H> {
    hooks: Mutex<H>,
    link: Mutex<Link>,
    changed: Condvar,
    session: Arc<SessionGate>,
    hostname: Hostname,
    log_hostname: String,
}

impl<H: NetworkHooks> Supervisor<H> {
    pub fn new(
        hooks: H,
        identity: &DeviceIdentity,
        log_app: &str,
        session: Arc<SessionGate>,
    ) -> Self {
        Self {
            hooks: Mutex::new(hooks),
            link: Mutex::new(Link {
                state: ConnectivityState::Disconnected,
                retries: 0,
                address: None,
            }),
            changed: Condvar::new(),
            session,
            hostname: identity.hostname(),
            log_hostname: identity.syslog_hostname(log_app),
        }
    }

    /// Inicia la asociación y retorna enseguida (el resto llega por eventos).
    pub fn start(&self) -> Result<()> {
        {
            let mut link = self.link();
            if link.state == ConnectivityState::Disconnected {
                link.state = ConnectivityState::Connecting;
            }
        }
        info!("Starting WiFi station (hostname {})", self.hostname);
        self.hooks().power_up()
    }

    /// Aplica un evento del stack de red a la máquina de estados.
    pub fn handle_event(&self, event: WifiEvent) -> Verdict {
        match event {
            WifiEvent::StaStarted => {
                self.link().state = ConnectivityState::Connecting;

                // El hostname tiene que estar puesto antes del DHCP
                let mut hooks = self.hooks();
                report(hooks.set_hostname(&self.hostname), "set hostname");
                report(hooks.associate(), "associate");
                Verdict::Continue
            }
            WifiEvent::GotIp(address) => {
                {
                    let mut link = self.link();
                    link.state = ConnectivityState::Connected;
                    link.retries = 0;
                    link.address = Some(address);
                }
                info!("got ip: {}", address);

                {
                    let mut hooks = self.hooks();
                    report(hooks.set_hostname(&self.hostname), "set hostname");
                    report(
                        hooks.start_remote_log(&self.log_hostname),
                        "start remote log",
                    );
                    report(hooks.start_transport(), "start MQTT transport");
                }

                self.changed.notify_all();
                Verdict::Continue
            }
            WifiEvent::Disconnected { reason } => self.on_disconnected(reason),
        }
    }

    fn on_disconnected(&self, reason: u16) -> Verdict {
        error!("Disconnect reason : {}", reason);

        let mut hooks = self.hooks();
        hooks.stop_remote_log();
        hooks.stop_transport();
        self.session.on_transport_disconnected();

        let retries = {
            let mut link = self.link();
            link.state = ConnectivityState::Disconnected;
            link.address = None;
            link.retries += 1;
            link.retries
        };

        if reason == REASON_BASIC_RATE_NOT_SUPPORT {
            warn!("AP rejected basic rates, switching radio to 802.11 b/g/n");
            report(hooks.restrict_protocol(), "restrict protocol");
        }

        if retries > RETRY_LIMIT {
            error!("reboot: too many tries ({})", retries);
            return Verdict::Restart;
        }

        info!("retry to connect to the AP ({}/{})", retries, RETRY_LIMIT);
        self.link().state = ConnectivityState::Connecting;
        report(hooks.associate(), "associate");
        Verdict::Continue
    }

    /// Bloquea hasta `Connected` o hasta que venza `timeout` (`None` = sin límite).
    pub fn await_connected(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut link = self.link();

        while link.state != ConnectivityState::Connected {
            link = match deadline {
                None => self
                    .changed
                    .wait(link)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.changed
                        .wait_timeout(link, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }

    pub fn state(&self) -> ConnectivityState {
        self.link().state
    }

    pub fn retry_count(&self) -> u32 {
        self.link().retries
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.link().address
    }

    pub fn with_hooks<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.hooks())
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> MutexGuard<'_, H> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Los errores de los hooks no se propagan: el próximo evento reintenta.
fn report(result: Result<()>, what: &str) {
    if let Err(e) = result {
        error!("{} failed: {:?}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        PowerUp,
        Associate,
        Hostname(String),
        Restrict,
        StartLog(String),
        StopLog,
        StartTransport,
        StopTransport,
    }

    #[derive(Debug, Default)]
    struct RecordingHooks {
        calls: Vec<Call>,
    }

    impl RecordingHooks {
        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }
    }

    impl NetworkHooks for RecordingHooks {
        fn power_up(&mut self) -> Result<()> {
            self.calls.push(Call::PowerUp);
            Ok(())
        }
        fn associate(&mut self) -> Result<()> {
            self.calls.push(Call::Associate);
            Ok(())
        }
        fn set_hostname(&mut self, hostname: &str) -> Result<()> {
            self.calls.push(Call::Hostname(hostname.to_string()));
            Ok(())
        }
        fn restrict_protocol(&mut self) -> Result<()> {
            self.calls.push(Call::Restrict);
            Ok(())
        }
        fn start_remote_log(&mut self, hostname: &str) -> Result<()> {
            self.calls.push(Call::StartLog(hostname.to_string()));
            Ok(())
        }
        fn stop_remote_log(&mut self) {
            self.calls.push(Call::StopLog);
        }
        fn start_transport(&mut self) -> Result<()> {
            self.calls.push(Call::StartTransport);
            Ok(())
        }
        fn stop_transport(&mut self) {
            self.calls.push(Call::StopTransport);
        }
    }

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);
    const DROP: WifiEvent = WifiEvent::Disconnected { reason: 201 };

    fn supervisor() -> (Supervisor<RecordingHooks>, Arc<SessionGate>) {
        let session = Arc::new(SessionGate::new());
        let identity = DeviceIdentity::from_mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let supervisor =
            Supervisor::new(RecordingHooks::default(), &identity, "soil", session.clone());
        (supervisor, session)
    }

    #[test]
    fn start_powers_up_and_connects_on_sta_start() {
        let (supervisor, _) = supervisor();
        supervisor.start().unwrap();
        assert_eq!(supervisor.state(), ConnectivityState::Connecting);

        assert_eq!(supervisor.handle_event(WifiEvent::StaStarted), Verdict::Continue);
        supervisor.with_hooks(|hooks| {
            assert_eq!(
                hooks.calls,
                vec![
                    Call::PowerUp,
                    Call::Hostname("soil-AABBCCDDEEFF".into()),
                    Call::Associate,
                ]
            );
        });
    }

    #[test]
    fn got_ip_resets_retries_and_starts_transport() {
        let (supervisor, _) = supervisor();
        supervisor.start().unwrap();
        let _ = supervisor.handle_event(DROP);
        let _ = supervisor.handle_event(DROP);
        assert_eq!(supervisor.retry_count(), 2);

        let _ = supervisor.handle_event(WifiEvent::GotIp(IP));
        assert_eq!(supervisor.state(), ConnectivityState::Connected);
        assert_eq!(supervisor.retry_count(), 0);
        assert_eq!(supervisor.address(), Some(IP));
        assert!(supervisor.await_connected(Some(Duration::ZERO)));

        supervisor.with_hooks(|hooks| {
            let tail = &hooks.calls[hooks.calls.len() - 3..];
            assert_eq!(
                tail,
                &[
                    Call::Hostname("soil-AABBCCDDEEFF".into()),
                    Call::StartLog("soil-AABBCCDDEEFF".into()),
                    Call::StartTransport,
                ]
            );
        });
    }

    #[test]
    fn disconnect_tears_down_in_order_and_clears_session() {
        let (supervisor, session) = supervisor();
        supervisor.start().unwrap();
        let _ = supervisor.handle_event(WifiEvent::GotIp(IP));
        session.on_transport_connected();

        supervisor.with_hooks(|hooks| hooks.calls.clear());
        assert_eq!(supervisor.handle_event(DROP), Verdict::Continue);

        assert!(!session.is_ready());
        assert_eq!(supervisor.retry_count(), 1);
        assert_eq!(supervisor.state(), ConnectivityState::Connecting);
        assert_eq!(supervisor.address(), None);
        supervisor.with_hooks(|hooks| {
            assert_eq!(
                hooks.calls,
                vec![Call::StopLog, Call::StopTransport, Call::Associate]
            );
        });
    }

    #[test]
    fn basic_rate_rejection_narrows_protocol() {
        let (supervisor, _) = supervisor();
        supervisor.start().unwrap();
        let _ = supervisor.handle_event(WifiEvent::Disconnected {
            reason: REASON_BASIC_RATE_NOT_SUPPORT,
        });
        supervisor.with_hooks(|hooks| {
            assert_eq!(hooks.count(&Call::Restrict), 1);
            let restrict = hooks.calls.iter().position(|c| *c == Call::Restrict);
            let associate = hooks.calls.iter().rposition(|c| *c == Call::Associate);
            assert!(restrict < associate);
        });
    }

    #[test]
    fn eleventh_consecutive_disconnect_restarts() {
        let (supervisor, _) = supervisor();
        supervisor.start().unwrap();

        for _ in 0..10 {
            assert_eq!(supervisor.handle_event(DROP), Verdict::Continue);
        }
        assert_eq!(supervisor.handle_event(DROP), Verdict::Restart);

        // 10 reintentos, ninguno después del veredicto de reinicio
        supervisor.with_hooks(|hooks| assert_eq!(hooks.count(&Call::Associate), 10));
        assert_eq!(supervisor.state(), ConnectivityState::Disconnected);
    }

    #[test]
    fn await_connected_times_out_while_connecting() {
        let (supervisor, _) = supervisor();
        supervisor.start().unwrap();
        assert!(!supervisor.await_connected(Some(Duration::from_millis(10))));
    }

    proptest! {
        #[test]
        fn retry_counter_tracks_consecutive_drops(connects in proptest::collection::vec(any::<bool>(), 1..64)) {
            let (supervisor, _) = supervisor();
            supervisor.start().unwrap();
            let mut expected = 0u32;

            for connect in connects {
                if connect {
                    let _ = supervisor.handle_event(WifiEvent::GotIp(IP));
                    expected = 0;
                } else {
                    let verdict = supervisor.handle_event(DROP);
                    expected += 1;
                    if expected > RETRY_LIMIT {
                        prop_assert_eq!(verdict, Verdict::Restart);
                        break;
                    }
                    prop_assert_eq!(verdict, Verdict::Continue);
                }
                prop_assert_eq!(supervisor.retry_count(), expected);
            }
        }
    }
}
