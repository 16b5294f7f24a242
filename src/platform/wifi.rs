// ─── Módulo WiFi — Driver station + eventos hacia el Supervisor ───
//
// El driver WiFi se usa en modo no bloqueante: start()/connect() solo
// disparan la operación y el resultado llega como evento del sistema.
// Los eventos se traducen a `WifiEvent` y se entregan al Supervisor, que
// decide qué hacer a través de los hooks implementados acá.

use anyhow::{anyhow, Result};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::modem::Modem,
    log::EspLogger,
    netif::IpEvent,
    sys,
    wifi::{self as esp_wifi, AuthMethod, ClientConfiguration, Configuration, EspWifi},
};
use log::{error, info};
use std::sync::Arc;

use soil_moisture_node::remote_log::{RemoteLog, RemoteTargets, ResolvedTargets};
use soil_moisture_node::{NetworkHooks, Settings, Supervisor, Verdict, WifiEvent};

use super::mqtt::MqttTransport;
use super::system;

/// Hooks reales del Supervisor: radio, log remoto y cliente MQTT.
pub struct EspNetwork {
    wifi: EspWifi<'static>,
    config: Configuration,
    transport: Arc<MqttTransport>,
    logger: &'static RemoteLog<EspLogger>,
    log_targets: ResolvedTargets,
}

impl EspNetwork {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        settings: &Settings,
        transport: Arc<MqttTransport>,
        logger: &'static RemoteLog<EspLogger>,
    ) -> Result<Self> {
        // ─── Validación de credenciales ───

        let auth_method = if settings.is_open_network() {
            info!("WiFi password empty, using open network");
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: settings
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("SSID too long"))?,
            password: settings
                .wifi_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Password too long"))?,
            auth_method,
            ..Default::default()
        });

        // Se valida al boot: start_remote_log corre en el contexto de eventos
        let log_targets = RemoteTargets {
            udp_host: settings.log_udp_host.clone(),
            udp_port: settings.log_udp_port,
            syslog_host: settings.syslog_host.clone(),
            syslog_port: settings.syslog_port,
            app: settings.syslog_app.clone(),
        }
        .resolve()?;

        // ─── Crear driver WiFi ───

        // None = sin NVS: la configuración viene del build, no de flash
        let wifi = EspWifi::new(modem, sysloop, None)?;

        Ok(Self {
            wifi,
            config,
            transport,
            logger,
            log_targets,
        })
    }
}

impl NetworkHooks for EspNetwork {
    fn power_up(&mut self) -> Result<()> {
        self.wifi.set_configuration(&self.config)?;
        info!("Starting WiFi...");
        self.wifi.start()?;
        Ok(())
    }

    fn associate(&mut self) -> Result<()> {
        self.wifi.connect()?;
        Ok(())
    }

    fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        info!("set hostname to {}", hostname);
        self.wifi.sta_netif_mut().set_hostname(hostname)?;
        Ok(())
    }

    fn restrict_protocol(&mut self) -> Result<()> {
        let protocols =
            sys::WIFI_PROTOCOL_11B | sys::WIFI_PROTOCOL_11G | sys::WIFI_PROTOCOL_11N;
        sys::esp!(unsafe {
            sys::esp_wifi_set_protocol(sys::wifi_interface_t_WIFI_IF_STA, protocols as u8)
        })?;
        Ok(())
    }

    fn start_remote_log(&mut self, hostname: &str) -> Result<()> {
        self.logger.start(&self.log_targets, hostname)
    }

    fn stop_remote_log(&mut self) {
        self.logger.stop();
    }

    fn start_transport(&mut self) -> Result<()> {
        self.transport.start()
    }

    fn stop_transport(&mut self) {
        self.transport.stop();
    }
}

// ─── Eventos del sistema ───

/// Suscripciones a WIFI_EVENT e IP_EVENT. Al hacer drop se desregistran:
/// tiene que vivir mientras dure el ciclo.
pub struct NetworkEvents {
    _wifi: EspSubscription<'static, System>,
    _ip: EspSubscription<'static, System>,
}

/// Conecta los eventos de red del sistema con el Supervisor.
pub fn subscribe_events(
    sysloop: &EspSystemEventLoop,
    supervisor: &Arc<Supervisor<EspNetwork>>,
) -> Result<NetworkEvents> {
    let wifi = {
        let supervisor = supervisor.clone();
        sysloop.subscribe::<esp_wifi::WifiEvent, _>(move |event| {
            let event = match event {
                esp_wifi::WifiEvent::StaStarted => WifiEvent::StaStarted,
                esp_wifi::WifiEvent::StaDisconnected(disconnected) => WifiEvent::Disconnected {
                    reason: u16::from(disconnected.reason()),
                },
                _ => return,
            };
            deliver(&supervisor, event);
        })?
    };

    let ip = {
        let supervisor = supervisor.clone();
        sysloop.subscribe::<IpEvent, _>(move |event| {
            if let IpEvent::DhcpIpAssigned(assignment) = event {
                deliver(&supervisor, WifiEvent::GotIp(assignment.ip()));
            }
        })?
    };

    Ok(NetworkEvents { _wifi: wifi, _ip: ip })
}

fn deliver(supervisor: &Supervisor<EspNetwork>, event: WifiEvent) {
    if supervisor.handle_event(event) == Verdict::Restart {
        error!("WiFi retries exhausted, restarting");
        system::restart();
    }
}
