// ─── Sonda de humedad: alimentación por GPIO + lectura ADC1 ───
//
// El sensor capacitivo se alimenta desde un GPIO para no consumir
// durante el deep sleep. El ADC del ESP32 lee 12 bits; la fórmula de
// humedad trabaja en 10 bits, así que se descartan los 2 bits bajos.

use anyhow::Result;
use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::gpio::{Gpio34, Gpio5, Output, PinDriver};

use soil_moisture_node::sensor::MoistureProbe;

pub struct AdcProbe {
    power: PinDriver<'static, Gpio5, Output>,
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AdcProbe {
    pub fn new(adc: ADC1, signal: Gpio34, power: Gpio5) -> Result<Self> {
        let mut power = PinDriver::output(power)?;
        power.set_low()?;

        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(AdcDriver::new(adc)?, signal, &config)?;

        Ok(Self { power, channel })
    }
}

impl MoistureProbe for AdcProbe {
    fn power_on(&mut self) -> Result<()> {
        self.power.set_high()?;
        Ok(())
    }

    fn power_off(&mut self) -> Result<()> {
        self.power.set_low()?;
        Ok(())
    }

    fn read_raw(&mut self) -> Result<u16> {
        // 12 bits → 10 bits
        Ok(self.channel.read_raw()? >> 2)
    }
}
