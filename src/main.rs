// ─── soil-moisture-node — Firmware del nodo de humedad de suelo ───
//
// Un despertar = un ciclo: conectar WiFi + MQTT, publicar una lectura,
// dar tiempo a un posible OTA y volver a deep sleep por 15 minutos.
//
// La lógica del ciclo vive en la librería (testeable en el host); acá
// solo se arman las piezas reales de ESP-IDF y se conectan entre sí.

// ─── Módulos ───

#[cfg(target_os = "espidf")]
mod platform;

// ─── Imports ───

#[cfg(target_os = "espidf")]
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::peripherals::Peripherals,
    log::EspLogger,
};

#[cfg(target_os = "espidf")]
use log::{error, info, warn};
#[cfg(target_os = "espidf")]
use std::sync::Arc;
#[cfg(target_os = "espidf")]
use std::time::Duration;

#[cfg(target_os = "espidf")]
use soil_moisture_node::{
    config::{OTA_FLUSH_DELAY, SENSOR_SETTLE},
    homie::HomieDevice,
    node::{self, SoilNode},
    remote_log::RemoteLog,
    DeviceIdentity, DutyCycle, OtaStatus, OtaTrigger, Scheduler, SessionGate, Settings,
    Supervisor, ThreadDelay,
};

#[cfg(target_os = "espidf")]
use platform::{
    firmware::HttpOta,
    mqtt::{Inbound, MqttTransport, Session},
    probe::AdcProbe,
    system,
    wifi::{self, EspNetwork},
};

// Consola UART siempre; UDP/syslog mientras haya WiFi
#[cfg(target_os = "espidf")]
static LOGGER: RemoteLog<EspLogger> = RemoteLog::new(EspLogger::new());

// ─── Punto de entrada ───
//
// Patrón main() → run(): si run() falla, logueamos el error, esperamos 10s
// y reiniciamos el chip. En el camino feliz run() no retorna: termina en
// deep sleep.

#[cfg(target_os = "espidf")]
fn main() {
    esp_idf_svc::sys::link_patches();

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }

    info!("soil-moisture-node {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run() {
        error!("Error fatal: {:?}", e);
        error!("Reiniciando en 10 segundos...");
        std::thread::sleep(Duration::from_secs(10));
        system::restart();
    }
}

#[cfg(target_os = "espidf")]
fn run() -> anyhow::Result<()> {
    // ─── Inicialización del sistema ───

    let wake = system::wake_reason();
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;

    let settings = Settings::from_build_env();
    settings.validate()?;

    let identity = DeviceIdentity::from_mac(system::station_mac()?);
    info!("Device ID: {}", identity.device_id());

    // ─── Periféricos ───

    let probe = AdcProbe::new(
        peripherals.adc1,
        peripherals.pins.gpio34,
        peripherals.pins.gpio5,
    )?;

    // ─── Dispositivo Homie ───

    let (fw_name, fw_version) = system::firmware_info();
    info!("Firmware: {} {}", fw_name, fw_version);

    let homie = Arc::new(HomieDevice::new(node::describe(
        &identity,
        &fw_name,
        &fw_version,
    )?));
    let ota_status = Arc::new(OtaStatus::new());
    let (updates, commands) = node::update_channel();
    let soil = Arc::new(SoilNode::new(
        probe,
        ThreadDelay,
        SENSOR_SETTLE,
        updates,
        ota_status.clone(),
    ));

    // ─── MQTT ───

    let session = Arc::new(SessionGate::new());
    let inbound: Inbound = {
        let homie = homie.clone();
        let soil = soil.clone();
        Arc::new(move |topic: &str, payload: &[u8]| {
            homie.dispatch(topic, payload, &*soil);
        })
    };
    let (will_topic, will_payload) = homie.last_will();
    let transport = Arc::new(MqttTransport::new(
        Session {
            url: settings.broker_url(),
            client_id: identity.device_id().to_string(),
            username: settings.mqtt_user.clone(),
            password: settings.mqtt_password.clone(),
            will_topic,
            will_payload,
        },
        session.clone(),
        inbound,
    ));

    // ─── OTA ───

    let trigger = OtaTrigger::new(
        HttpOta,
        transport.clone(),
        ota_status.clone(),
        node::update_command_topic(&identity),
    );
    let _ota_worker = node::spawn_ota_worker(trigger, commands, || {
        info!("restarting into new firmware");
        std::thread::sleep(OTA_FLUSH_DELAY);
        system::restart();
    })?;

    // ─── WiFi ───

    let log_app = settings.syslog_app.clone();
    let network = EspNetwork::new(
        peripherals.modem,
        sysloop.clone(),
        &settings,
        transport.clone(),
        &LOGGER,
    )?;

    // ZeroizeOnDrop borra las credenciales de esta copia
    drop(settings);

    let supervisor = Arc::new(Supervisor::new(
        network,
        &identity,
        &log_app,
        session.clone(),
    ));
    let _events = wifi::subscribe_events(&sysloop, &supervisor)?;

    // ─── Ciclo ───

    let scheduler = Scheduler::new(DutyCycle::default(), ThreadDelay);
    let report = scheduler.run(wake, &supervisor, &session, &ota_status, || {
        homie.init(&*transport, supervisor.address())?;
        homie.cycle(&*transport, &*soil)?;
        Ok(())
    })?;

    // Llegar al broker y publicar valida la imagen actual
    if report.telemetry_published {
        system::confirm_running_image();
    } else {
        warn!("no telemetry this cycle");
    }

    system::deep_sleep(report.sleep_for)
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!(
        "soil-moisture-node is ESP-IDF firmware; build it for an espidf target. \
         The lifecycle core is exercised on the host with `cargo test`."
    );
}
