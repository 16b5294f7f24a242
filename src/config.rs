// ─── Módulo Config — Settings de compilación + tiempos del duty cycle ───
//
// Las credenciales se inyectan en tiempo de compilación con variables de
// entorno (WIFI_SSID, MQTT_HOST, ...). No hay portal de provisioning:
// el nodo duerme el 99% del tiempo y no puede servir un Access Point.
//
// Los secretos viven en un struct con Zeroize/ZeroizeOnDrop: cada copia
// en RAM se sobreescribe con ceros al salir de scope.

use anyhow::{bail, Result};
use log::info;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ─── Constantes del ciclo de vida ───

/// Desconexiones toleradas antes de reiniciar el chip.
pub const RETRY_LIMIT: u32 = 10;

/// Pausa antes de reiniciar en la imagen nueva (deja salir los logs).
pub const OTA_FLUSH_DELAY: Duration = Duration::from_secs(1);

/// Tiempo que el sensor necesita alimentado antes de leer el ADC.
pub const SENSOR_SETTLE: Duration = Duration::from_millis(500);

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_SYSLOG_PORT: u16 = 514;
const DEFAULT_SYSLOG_APP: &str = "soil";

// ─── Settings con borrado seguro ───

/// Configuración de red del nodo, fijada al compilar el firmware.
#[derive(Debug, Default, Clone, Zeroize, ZeroizeOnDrop)]
pub struct Settings {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_password: String,
    pub log_udp_host: String,
    pub log_udp_port: u16,
    pub syslog_host: String,
    pub syslog_port: u16,
    pub syslog_app: String,
}

impl Settings {
    /// Lee las variables de entorno capturadas por `option_env!` al compilar.
    pub fn from_build_env() -> Self {
        Self {
            wifi_ssid: option_env!("WIFI_SSID").unwrap_or_default().to_string(),
            wifi_password: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
            mqtt_host: option_env!("MQTT_HOST").unwrap_or_default().to_string(),
            mqtt_port: parse_port(option_env!("MQTT_PORT"), DEFAULT_MQTT_PORT),
            mqtt_user: option_env!("MQTT_USER").unwrap_or_default().to_string(),
            mqtt_password: option_env!("MQTT_PASS").unwrap_or_default().to_string(),
            log_udp_host: option_env!("REMOTELOG_UDP_HOST")
                .unwrap_or_default()
                .to_string(),
            log_udp_port: parse_port(option_env!("REMOTELOG_UDP_PORT"), DEFAULT_SYSLOG_PORT),
            syslog_host: option_env!("REMOTELOG_SYSLOG_HOST")
                .unwrap_or_default()
                .to_string(),
            syslog_port: parse_port(option_env!("REMOTELOG_SYSLOG_PORT"), DEFAULT_SYSLOG_PORT),
            syslog_app: option_env!("REMOTELOG_SYSLOG_APP")
                .unwrap_or(DEFAULT_SYSLOG_APP)
                .to_string(),
        }
    }

    /// Verifica que haya lo mínimo para arrancar el ciclo.
    ///
    /// Password WiFi vacío es válido: significa red abierta.
    pub fn validate(&self) -> Result<()> {
        if self.wifi_ssid.is_empty() {
            bail!("WiFi SSID not configured (set WIFI_SSID at build time)");
        }
        if self.mqtt_host.is_empty() {
            bail!("MQTT broker not configured (set MQTT_HOST at build time)");
        }

        // Nunca loguear secretos, solo su longitud
        info!("WiFi password length: {} bytes", self.wifi_password.len());
        info!("MQTT password length: {} bytes", self.mqtt_password.len());
        Ok(())
    }

    /// URL del broker sin credenciales (van aparte en la config MQTT).
    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.mqtt_host, self.mqtt_port)
    }

    pub fn is_open_network(&self) -> bool {
        self.wifi_password.is_empty()
    }
}

fn parse_port(raw: Option<&str>, default: u16) -> u16 {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

// ─── Tiempos del duty cycle ───

/// Esperas del scheduler en cada fase de un despertar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycle {
    /// Espera extra tras publicar cuando NO venimos de deep sleep, para que
    /// llegue un comando `set` retenido que acompañe este arranque.
    pub settle_grace: Duration,
    /// Pausa antes y después del ciclo de publicación.
    pub publish_pause: Duration,
    /// Veces que el watchdog consulta si hay un OTA en curso.
    pub ota_polls: u32,
    pub ota_poll_interval: Duration,
    /// Pausa para vaciar logs antes de dormir.
    pub flush_delay: Duration,
    pub sleep_period: Duration,
    /// `None` = esperar la sesión MQTT indefinidamente.
    pub session_timeout: Option<Duration>,
}

impl Default for DutyCycle {
    fn default() -> Self {
        Self {
            settle_grace: Duration::from_secs(15),
            publish_pause: Duration::from_millis(500),
            ota_polls: 50,
            ota_poll_interval: Duration::from_secs(5),
            flush_delay: Duration::from_secs(1),
            sleep_period: Duration::from_secs(900),
            session_timeout: None,
        }
    }
}

impl DutyCycle {
    /// Techo total del watchdog de OTA (50 × 5s = 250s por defecto).
    pub fn ota_ceiling(&self) -> Duration {
        self.ota_poll_interval * self.ota_polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Settings implementa Drop (ZeroizeOnDrop): nada de `..Default::default()`
    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.wifi_ssid = "garden".into();
        settings.mqtt_host = "broker.local".into();
        settings.mqtt_port = 1883;
        settings
    }

    #[test]
    fn validate_rejects_missing_ssid() {
        let mut settings = settings();
        settings.wifi_ssid.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_broker() {
        let mut settings = settings();
        settings.mqtt_host.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_password_means_open_network() {
        let settings = settings();
        assert!(settings.validate().is_ok());
        assert!(settings.is_open_network());
    }

    #[test]
    fn broker_url_has_no_credentials() {
        let mut settings = settings();
        settings.mqtt_user = "node".into();
        settings.mqtt_password = "hunter2".into();
        assert_eq!(settings.broker_url(), "mqtt://broker.local:1883");
    }

    #[test]
    fn port_falls_back_on_garbage() {
        assert_eq!(parse_port(Some("8883"), 1883), 8883);
        assert_eq!(parse_port(Some("nope"), 1883), 1883);
        assert_eq!(parse_port(None, 514), 514);
    }

    #[test]
    fn default_duty_cycle_matches_field_timings() {
        let cycle = DutyCycle::default();
        assert_eq!(cycle.ota_ceiling(), Duration::from_secs(250));
        assert_eq!(cycle.sleep_period, Duration::from_secs(900));
        assert_eq!(cycle.session_timeout, None);
    }
}
