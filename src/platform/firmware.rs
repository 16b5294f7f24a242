// ─── Updater OTA: descarga HTTP(S) → partición OTA inactiva ───

use anyhow::{anyhow, bail, Result};
use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::{Method, Status};
use embedded_svc::io::Read;
use esp_idf_svc::http::client::{Configuration as HttpClientConfiguration, EspHttpConnection};
use esp_idf_svc::ota::EspOta;
use log::info;
use std::time::Duration;

use soil_moisture_node::FirmwareUpdater;

const CHUNK_SIZE: usize = 1024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Descarga la imagen y la escribe en el slot OTA siguiente.
/// Un `Ok` significa imagen completa y marcada para el próximo boot.
pub struct HttpOta;

impl FirmwareUpdater for HttpOta {
    fn apply_update(&self, url: &str) -> Result<()> {
        let config = HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&config)?);
        let request = client.request(Method::Get, url, &[])?;
        let mut response = request.submit().map_err(|e| anyhow!("{:?}", e))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            bail!("firmware download failed with HTTP {}", status);
        }

        let mut ota = EspOta::new()?;
        let mut update = ota.initiate_update()?;

        let mut chunk = [0u8; CHUNK_SIZE];
        let mut written = 0usize;
        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{:?}", e))?;
            if read == 0 {
                break;
            }
            update.write(&chunk[..read])?;
            written += read;
        }

        if written == 0 {
            bail!("firmware download body is empty");
        }

        update.complete()?;
        info!("firmware image written ({} bytes)", written);
        Ok(())
    }
}
