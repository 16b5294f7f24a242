// ─── Módulo Sensor — Lectura de humedad de suelo ───
//
// Sensor capacitivo alimentado por un GPIO: solo recibe tensión durante la
// lectura (ahorra batería y evita corrosión). Rango útil de salida:
// 1.0V (mojado) a 2.6V (seco) → 1.6V de excursión.
//
// Conversión (ADC de 10 bits sobre 3.3V):
//   volt = raw * 3.3 / 1024 - 1
//   perc = (1.6 - volt) / 0.016
//
// volt < 0 significa que el sensor no está conectado. Se loguea como error
// pero la lectura se publica igual.

use anyhow::Result;
use log::{error, info};
use std::time::Duration;

use crate::transport::Delay;

const ADC_FULL_SCALE: f32 = 1024.0;
const ADC_REFERENCE_VOLTS: f32 = 3.3;
const SENSOR_OFFSET_VOLTS: f32 = 1.0;
const SENSOR_SPAN_VOLTS: f32 = 1.6;

/// Primitiva de muestreo: un GPIO de alimentación + una lectura del ADC.
pub trait MoistureProbe: Send {
    fn power_on(&mut self) -> Result<()>;

    fn power_off(&mut self) -> Result<()>;

    /// Una muestra cruda en el dominio de 10 bits (0..=1023).
    fn read_raw(&mut self) -> Result<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoistureReading {
    pub raw: u16,
    /// Tensión del sensor menos el offset de 1V.
    pub volts: f32,
    pub percent: u8,
}

impl MoistureReading {
    pub fn from_raw(raw: u16) -> Self {
        let volts = f32::from(raw) * (ADC_REFERENCE_VOLTS / ADC_FULL_SCALE) - SENSOR_OFFSET_VOLTS;
        // `as u8` trunca hacia cero y satura en 0..=255
        let percent = ((SENSOR_SPAN_VOLTS - volts) / 0.016) as u8;
        Self {
            raw,
            volts,
            percent,
        }
    }

    pub fn sensor_disconnected(&self) -> bool {
        self.volts < 0.0
    }

    /// Tensión real en la salida del sensor, en mV.
    pub fn millivolts(&self) -> i32 {
        (self.volts * 1000.0) as i32 + 1000
    }

    /// Valor que se publica en la propiedad `moisture`.
    pub fn payload(&self) -> String {
        self.percent.to_string()
    }
}

/// Enciende el sensor, espera `settle`, lee y apaga.
///
/// El apagado ocurre también si la lectura falla.
pub fn sample<P: MoistureProbe + ?Sized>(
    probe: &mut P,
    delay: &dyn Delay,
    settle: Duration,
) -> Result<MoistureReading> {
    probe.power_on()?;
    delay.delay(settle);

    let raw = probe.read_raw();
    let off = probe.power_off();
    let reading = MoistureReading::from_raw(raw?);
    off?;

    if reading.sensor_disconnected() {
        error!("humidity sensor not connected");
    }
    info!("adc value {} mV", reading.millivolts());
    info!("humidity value {}", reading.percent);

    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[derive(Default)]
    struct FakeProbe {
        raw: Option<u16>,
        log: Vec<&'static str>,
    }

    impl MoistureProbe for FakeProbe {
        fn power_on(&mut self) -> Result<()> {
            self.log.push("on");
            Ok(())
        }
        fn power_off(&mut self) -> Result<()> {
            self.log.push("off");
            Ok(())
        }
        fn read_raw(&mut self) -> Result<u16> {
            self.log.push("read");
            match self.raw {
                Some(raw) => Ok(raw),
                None => bail!("adc timeout"),
            }
        }
    }

    struct NoDelay;

    impl Delay for NoDelay {
        fn delay(&self, _duration: Duration) {}
    }

    #[test]
    fn raw_512_matches_formula() {
        let reading = MoistureReading::from_raw(512);
        let expected = (1.6 - ((512.0 * 3.3 / 1024.0) - 1.0)) / 0.016;
        assert_eq!(reading.percent, expected as u8);
        assert_eq!(reading.percent, 59);
        assert_eq!(reading.payload(), "59");
        assert!(!reading.sensor_disconnected());
        // 0.65V en f32 queda apenas por debajo: el truncado da 1649
        assert!((1649..=1650).contains(&reading.millivolts()));
    }

    #[test]
    fn low_voltage_flags_disconnected_but_keeps_value() {
        let reading = MoistureReading::from_raw(100);
        assert!(reading.sensor_disconnected());
        // (1.6 - (0.322 - 1)) / 0.016 ≈ 142
        assert_eq!(reading.percent, 142);
    }

    #[test]
    fn dry_sensor_saturates_at_zero() {
        assert_eq!(MoistureReading::from_raw(1023).percent, 0);
    }

    #[test]
    fn sample_powers_sensor_around_read() {
        let mut probe = FakeProbe {
            raw: Some(512),
            ..Default::default()
        };
        let reading = sample(&mut probe, &NoDelay, Duration::from_millis(500)).unwrap();
        assert_eq!(reading.raw, 512);
        assert_eq!(probe.log, vec!["on", "read", "off"]);
    }

    #[test]
    fn sample_powers_off_when_read_fails() {
        let mut probe = FakeProbe::default();
        assert!(sample(&mut probe, &NoDelay, Duration::ZERO).is_err());
        assert_eq!(probe.log, vec!["on", "read", "off"]);
    }
}
