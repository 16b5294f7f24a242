// ─── Módulo Remote Log — Espejo de logs por UDP / syslog ───
//
// Mientras hay WiFi, cada línea de log se manda además por UDP:
// - sink "udp": línea plana, para `nc -ul 514` en la notebook
// - sink "syslog": formato RFC 3164 para rsyslog/journald
//
// El logger envuelve al logger de consola (EspLogger en el firmware):
// la consola recibe todo siempre, el socket solo entre start() y stop().
//
// Los destinos son IPs literales y se validan una vez al arrancar. start()
// corre en el contexto de eventos WiFi: ahí no se hace DNS.

use anyhow::{anyhow, Result};
use log::{Level, Log, Metadata, Record};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Mutex, PoisonError};

/// Facility "user" de syslog.
const FACILITY_USER: u8 = 1;

/// Destinos configurados (vacío = sink deshabilitado).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteTargets {
    pub udp_host: String,
    pub udp_port: u16,
    pub syslog_host: String,
    pub syslog_port: u16,
    pub app: String,
}

impl RemoteTargets {
    /// Convierte los hosts configurados en direcciones. Un hostname que no
    /// sea IP literal es error de configuración.
    pub fn resolve(&self) -> Result<ResolvedTargets> {
        Ok(ResolvedTargets {
            udp: parse_target(&self.udp_host, self.udp_port)?,
            syslog: parse_target(&self.syslog_host, self.syslog_port)?,
            app: self.app.clone(),
        })
    }
}

/// Destinos ya validados, listos para `RemoteLog::start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTargets {
    pub udp: Option<SocketAddr>,
    pub syslog: Option<SocketAddr>,
    pub app: String,
}

impl ResolvedTargets {
    pub fn is_empty(&self) -> bool {
        self.udp.is_none() && self.syslog.is_none()
    }
}

struct Sink {
    socket: UdpSocket,
    udp: Option<SocketAddr>,
    syslog: Option<SocketAddr>,
    hostname: String,
    app: String,
}

/// Logger que espeja registros por UDP.
pub struct RemoteLog<L> {
    console: L,
    sink: Mutex<Option<Sink>>,
}

impl<L: Log> RemoteLog<L> {
    pub const fn new(console: L) -> Self {
        Self {
            console,
            sink: Mutex::new(None),
        }
    }

    /// Abre un socket efímero hacia los destinos. Sin lookups de red.
    pub fn start(&self, targets: &ResolvedTargets, hostname: &str) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        *self.lock_sink() = Some(Sink {
            socket,
            udp: targets.udp,
            syslog: targets.syslog,
            hostname: hostname.to_string(),
            app: targets.app.clone(),
        });
        log::info!("remote log started as {}", hostname);
        Ok(())
    }

    pub fn stop(&self) {
        // drop del socket = cierre
        self.lock_sink().take();
    }

    pub fn is_active(&self) -> bool {
        self.lock_sink().is_some()
    }

    fn lock_sink(&self) -> std::sync::MutexGuard<'_, Option<Sink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: Log> Log for RemoteLog<L> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.console.log(record);

        if !self.enabled(record.metadata()) {
            return;
        }

        // try_lock: un log emitido mientras start()/stop() tiene el lock
        // solo va a consola, nunca bloquea ni recursa
        let Ok(sink) = self.sink.try_lock() else {
            return;
        };
        let Some(sink) = sink.as_ref() else {
            return;
        };

        let message = record.args().to_string();
        // Errores de envío se descartan: loguearlos recursaría
        if let Some(addr) = sink.udp {
            let line = format_line(record.level(), record.target(), &message);
            let _ = sink.socket.send_to(line.as_bytes(), addr);
        }
        if let Some(addr) = sink.syslog {
            let line = format_syslog(record.level(), &sink.hostname, &sink.app, &message);
            let _ = sink.socket.send_to(line.as_bytes(), addr);
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}

fn parse_target(host: &str, port: u16) -> Result<Option<SocketAddr>> {
    let host = host.trim();
    if host.is_empty() {
        return Ok(None);
    }
    let ip: IpAddr = host
        .parse()
        .map_err(|_| anyhow!("remote log host {:?} must be an IP address", host))?;
    Ok(Some(SocketAddr::new(ip, port)))
}

fn severity(level: Level) -> u8 {
    match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    }
}

pub fn format_line(level: Level, target: &str, message: &str) -> String {
    format!("{} {}: {}", level, target, message)
}

/// `<PRI>HOSTNAME APP: MESSAGE`
pub fn format_syslog(level: Level, hostname: &str, app: &str, message: &str) -> String {
    let priority = FACILITY_USER * 8 + severity(level);
    format!("<{}>{} {}: {}", priority, hostname, app, message)
}
