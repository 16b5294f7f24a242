// ─── Módulo Homie — Descripción del dispositivo (convención Homie 3) ───
//
// Homie define cómo un dispositivo se describe a sí mismo sobre MQTT:
//
//   homie/<device>/$homie         = 3.0.1
//   homie/<device>/$nodes         = sensor
//   homie/<device>/sensor/$properties = moisture,update
//   homie/<device>/sensor/moisture    = 59        (valor)
//   homie/<device>/sensor/update/set  = <url>     (comando)
//
// El árbol device → nodes → properties se arma con un builder y se valida
// al arrancar. Los valores y comandos pasan por un `PropertyHandler`.

use anyhow::{bail, Result};
use log::{debug, info};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::transport::{Publish, QoS};

pub const HOMIE_VERSION: &str = "3.0.1";
const ROOT_TOPIC: &str = "homie";
const IMPLEMENTATION: &str = "soil-moisture-node";

// ─── Descriptores ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Integer,
    String,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Integer => "integer",
            Datatype::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub id: String,
    pub name: String,
    pub settable: bool,
    pub retained: bool,
    pub unit: String,
    pub datatype: Datatype,
}

impl PropertyDescriptor {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            settable: false,
            retained: true,
            unit: String::new(),
            datatype: Datatype::String,
        }
    }

    pub fn settable(mut self, settable: bool) -> Self {
        self.settable = settable;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: String,
    pub name: String,
    pub node_type: String,
    pub properties: Vec<PropertyDescriptor>,
}

impl NodeDescriptor {
    pub fn new(id: &str, name: &str, node_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            node_type: node_type.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    fn find(&self, property: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.id == property)
    }
}

/// Árbol completo del dispositivo, ya validado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub mac: String,
    pub firmware: String,
    pub firmware_version: String,
    /// Intervalo de `$stats`. 0 evita que openHAB marque el nodo offline
    /// mientras duerme.
    pub stats_interval: u32,
    pub nodes: Vec<NodeDescriptor>,
}

impl DeviceDescriptor {
    pub fn builder(id: &str, name: &str) -> DeviceBuilder {
        DeviceBuilder {
            descriptor: DeviceDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                mac: String::new(),
                firmware: String::new(),
                firmware_version: String::new(),
                stats_interval: 0,
                nodes: Vec::new(),
            },
        }
    }

    fn find(&self, node: &str, property: &str) -> Option<&PropertyDescriptor> {
        self.nodes
            .iter()
            .find(|n| n.id == node)
            .and_then(|n| n.find(property))
    }
}

pub struct DeviceBuilder {
    descriptor: DeviceDescriptor,
}

impl DeviceBuilder {
    pub fn mac(mut self, mac: &str) -> Self {
        self.descriptor.mac = mac.to_string();
        self
    }

    pub fn firmware(mut self, name: &str, version: &str) -> Self {
        self.descriptor.firmware = name.to_string();
        self.descriptor.firmware_version = version.to_string();
        self
    }

    pub fn stats_interval(mut self, seconds: u32) -> Self {
        self.descriptor.stats_interval = seconds;
        self
    }

    pub fn node(mut self, node: NodeDescriptor) -> Self {
        self.descriptor.nodes.push(node);
        self
    }

    /// Valida ids (segmentos de topic válidos, sin duplicados) y entrega
    /// el descriptor.
    pub fn build(self) -> Result<DeviceDescriptor> {
        let descriptor = self.descriptor;

        check_id("device", &descriptor.id)?;
        if descriptor.nodes.is_empty() {
            bail!("device '{}' has no nodes", descriptor.id);
        }

        check_nodes(&descriptor.nodes)?;

        Ok(descriptor)
    }
}

fn check_nodes(nodes: &[NodeDescriptor]) -> Result<()> {
    let mut node_ids = HashSet::new();
    for node in nodes {
        check_id("node", &node.id)?;
        if !node_ids.insert(node.id.as_str()) {
            bail!("duplicate node id '{}'", node.id);
        }
        if node.properties.is_empty() {
            bail!("node '{}' has no properties", node.id);
        }

        let mut property_ids = HashSet::new();
        for property in &node.properties {
            check_id("property", &property.id)?;
            if !property_ids.insert(property.id.as_str()) {
                bail!("duplicate property id '{}/{}'", node.id, property.id);
            }
        }
    }
    Ok(())
}

/// Un id tiene que poder usarse como segmento de topic MQTT.
fn check_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("{} id is empty", kind);
    }
    if id.starts_with('$') {
        bail!("{} id '{}' must not start with '$'", kind, id);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("{} id '{}' contains invalid characters", kind, id);
    }
    Ok(())
}

// ─── Handler de propiedades ───

/// Callbacks de la aplicación para valores y comandos.
pub trait PropertyHandler: Send + Sync {
    /// Valor actual de la propiedad; `None` si no es legible.
    fn read(&self, node: &str, property: &str) -> Option<String>;

    /// Valor recibido en `.../<node>/<property>/set`.
    fn write(&self, node: &str, property: &str, payload: &[u8]);
}

// ─── Dispositivo ───

pub struct HomieDevice {
    descriptor: DeviceDescriptor,
    base: String,
    booted: Instant,
}

impl HomieDevice {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let base = format!("{}/{}", ROOT_TOPIC, descriptor.id);
        Self {
            descriptor,
            base,
            booted: Instant::now(),
        }
    }

    pub fn property_topic(&self, node: &str, property: &str) -> String {
        format!("{}/{}/{}", self.base, node, property)
    }

    pub fn set_topic(&self, node: &str, property: &str) -> String {
        format!("{}/{}/{}/set", self.base, node, property)
    }

    /// Last will: el broker publica `$state = lost` si el nodo desaparece.
    pub fn last_will(&self) -> (String, &'static [u8]) {
        (format!("{}/$state", self.base), b"lost")
    }

    /// Publica la descripción completa y se suscribe a las propiedades
    /// configurables.
    pub fn init(&self, publisher: &dyn Publish, local_ip: Option<Ipv4Addr>) -> Result<()> {
        let device = &self.descriptor;
        info!("homie init: {}", self.base);

        self.attribute(publisher, "$state", "init")?;
        self.attribute(publisher, "$homie", HOMIE_VERSION)?;
        self.attribute(publisher, "$name", &device.name)?;
        if let Some(ip) = local_ip {
            self.attribute(publisher, "$localip", &ip.to_string())?;
        }
        self.attribute(publisher, "$mac", &device.mac)?;
        self.attribute(publisher, "$fw/name", &device.firmware)?;
        self.attribute(publisher, "$fw/version", &device.firmware_version)?;
        self.attribute(publisher, "$implementation", IMPLEMENTATION)?;
        self.attribute(publisher, "$stats", "uptime")?;
        self.attribute(
            publisher,
            "$stats/interval",
            &device.stats_interval.to_string(),
        )?;

        let nodes: Vec<&str> = device.nodes.iter().map(|n| n.id.as_str()).collect();
        self.attribute(publisher, "$nodes", &nodes.join(","))?;

        for node in &device.nodes {
            let prefix = node.id.as_str();
            self.attribute(publisher, &format!("{}/$name", prefix), &node.name)?;
            self.attribute(publisher, &format!("{}/$type", prefix), &node.node_type)?;

            let properties: Vec<&str> = node.properties.iter().map(|p| p.id.as_str()).collect();
            self.attribute(
                publisher,
                &format!("{}/$properties", prefix),
                &properties.join(","),
            )?;

            for property in &node.properties {
                let prefix = format!("{}/{}", node.id, property.id);
                self.attribute(publisher, &format!("{}/$name", prefix), &property.name)?;
                self.attribute(
                    publisher,
                    &format!("{}/$settable", prefix),
                    bool_str(property.settable),
                )?;
                self.attribute(
                    publisher,
                    &format!("{}/$retained", prefix),
                    bool_str(property.retained),
                )?;
                if !property.unit.is_empty() {
                    self.attribute(publisher, &format!("{}/$unit", prefix), &property.unit)?;
                }
                self.attribute(
                    publisher,
                    &format!("{}/$datatype", prefix),
                    property.datatype.as_str(),
                )?;

                if property.settable {
                    publisher.subscribe(&self.set_topic(&node.id, &property.id), QoS::AtLeastOnce)?;
                }
            }
        }

        self.attribute(publisher, "$state", "ready")
    }

    /// Un ciclo de telemetría: uptime + el valor de cada propiedad legible.
    ///
    /// Retorna cuántos valores se publicaron.
    pub fn cycle(&self, publisher: &dyn Publish, handler: &dyn PropertyHandler) -> Result<usize> {
        let uptime = self.booted.elapsed().as_secs();
        self.attribute(publisher, "$stats/uptime", &uptime.to_string())?;

        let mut published = 0;
        for node in &self.descriptor.nodes {
            for property in &node.properties {
                if let Some(value) = handler.read(&node.id, &property.id) {
                    self.publish_property_value(publisher, &node.id, &property.id, &value)?;
                    published += 1;
                }
            }
        }
        Ok(published)
    }

    pub fn publish_property_value(
        &self,
        publisher: &dyn Publish,
        node: &str,
        property: &str,
        value: &str,
    ) -> Result<()> {
        let Some(descriptor) = self.descriptor.find(node, property) else {
            bail!("unknown property '{}/{}'", node, property);
        };
        publisher.publish(
            &self.property_topic(node, property),
            value.as_bytes(),
            QoS::AtLeastOnce,
            descriptor.retained,
        )
    }

    /// Rutea un mensaje entrante al handler si es un `set` válido.
    ///
    /// Retorna `true` si el mensaje era para una propiedad configurable.
    pub fn dispatch(&self, topic: &str, payload: &[u8], handler: &dyn PropertyHandler) -> bool {
        let Some(rest) = topic
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return false;
        };

        let mut segments = rest.split('/');
        let (Some(node), Some(property), Some("set"), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            debug!("homie: ignoring topic {}", topic);
            return false;
        };

        match self.descriptor.find(node, property) {
            Some(descriptor) if descriptor.settable => {
                handler.write(node, property, payload);
                true
            }
            _ => {
                debug!("homie: {}/{} is not settable", node, property);
                false
            }
        }
    }

    fn attribute(&self, publisher: &dyn Publish, path: &str, value: &str) -> Result<()> {
        publisher.publish(
            &format!("{}/{}", self.base, path),
            value.as_bytes(),
            QoS::AtLeastOnce,
            true,
        )
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
