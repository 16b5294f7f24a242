// ─── Módulo Identity — Identidad del nodo derivada de la MAC ───
//
// La MAC de la interfaz station es lo único único por chip. De ella sale:
// - el device id de Homie (template con los últimos 12 chars reemplazados)
// - el client id MQTT (= device id)
// - el hostname DHCP: "soil-AABBCCDDEEFF"
// - el hostname de syslog: "<app>-AABBCCDDEEFF"

use core::fmt::Write;
use heapless::String as FixedString;

/// Template del device id. Los 12 caracteres finales se reemplazan por la MAC.
pub const DEVICE_ID_TEMPLATE: &str = "soil_moisture_sensor_XXXXXXXXXXXX";

const HOSTNAME_PREFIX: &str = "soil-";

/// esp-netif acepta hostnames de hasta 32 bytes.
pub type Hostname = FixedString<32>;

/// Identidad inmutable calculada una vez al arrancar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
    suffix: FixedString<12>,
    device_id: String,
}

impl DeviceIdentity {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut suffix = FixedString::new();
        for byte in mac {
            // 6 bytes × 2 hex = 12, entra justo en la capacidad
            let _ = write!(suffix, "{:02X}", byte);
        }

        let keep = DEVICE_ID_TEMPLATE.len() - suffix.len();
        let device_id = format!("{}{}", &DEVICE_ID_TEMPLATE[..keep], suffix);

        Self {
            mac,
            suffix,
            device_id,
        }
    }

    /// MAC en formato "AA:BB:CC:DD:EE:FF" (atributo `$mac` de Homie).
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Los 12 hex de la MAC, en mayúsculas.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Hostname que anunciamos por DHCP.
    pub fn hostname(&self) -> Hostname {
        let mut hostname = Hostname::new();
        let _ = write!(hostname, "{}{}", HOSTNAME_PREFIX, self.suffix);
        hostname
    }

    /// Hostname para el transporte de log remoto ("<app>-<suffix>").
    pub fn syslog_hostname(&self, app: &str) -> String {
        format!("{}-{}", app, self.suffix)
    }
}
