use std::time::Duration;

use anyhow::anyhow;
use esp_idf_hal::{
    adc::{
        continuous::{config::Config, AdcDriver, AdcMeasurement, Attenuated},
        ADC1,
    },
    delay::TickType,
    gpio::{AnyOutputPin, Gpio35, Output, PinDriver},
    units::FromValueType,
};
use esp_idf_svc::sys::{self, EspError};
use log::warn;

use vrms_common::{
    remote::RelayState, BatchRead, BatchSource, RawReading, SamplerConfig,
};

/// ESP32 ADC1 channel 7 is wired to GPIO35.
pub const SENSE_CHANNEL: u8 = 7;

/// Continuous-mode ADC1 on GPIO35.
///
/// `read` parks the calling task until the driver's conversion-done ISR
/// notifies it or the timeout elapses, so the driver itself is the frame
/// rendezvous.
pub struct AdcSource {
    driver: AdcDriver<'static>,
    buffer: Vec<AdcMeasurement>,
}

impl AdcSource {
    pub fn new(adc: ADC1, pin: Gpio35, config: &SamplerConfig) -> anyhow::Result<Self> {
        if config.channel != SENSE_CHANNEL {
            return Err(anyhow!(
                "ADC channel {} is not wired; the sense input is channel {SENSE_CHANNEL}",
                config.channel
            ));
        }

        let driver_config = Config::new()
            .sample_freq(config.sample_rate_hz.Hz())
            .frame_measurements(config.frame_len)
            .frames_count(4);
        let driver = AdcDriver::new(adc, &driver_config, Attenuated::db11(pin))?;

        Ok(Self {
            driver,
            buffer: vec![AdcMeasurement::new(); config.batch_len.max(1)],
        })
    }
}

impl BatchSource for AdcSource {
    type Error = EspError;

    fn start(&mut self) -> Result<(), Self::Error> {
        self.driver.start()
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.driver.stop()
    }

    fn read_batch(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<BatchRead, Self::Error> {
        let len = max_count.min(self.buffer.len());
        let ticks = TickType::new_millis(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
            .ticks();

        match self.driver.read(&mut self.buffer[..len], ticks) {
            Ok(read) => Ok(BatchRead::Ready(
                self.buffer[..read]
                    .iter()
                    .map(|measurement| {
                        RawReading::new(measurement.channel() as u8, measurement.data())
                    })
                    .collect(),
            )),
            Err(err) if err.code() == sys::ESP_ERR_TIMEOUT => Ok(BatchRead::Timeout),
            Err(err) => Err(err),
        }
    }
}

/// The eFuse-backed line-fitting scheme for ADC1 at 11 dB.
pub struct ChipCalibration {
    handle: sys::adc_cali_handle_t,
}

// The handle is only ever used from the sampler thread that owns it.
unsafe impl Send for ChipCalibration {}

impl ChipCalibration {
    pub fn new() -> Result<Self, EspError> {
        let config = sys::adc_cali_line_fitting_config_t {
            unit_id: sys::adc_unit_t_ADC_UNIT_1,
            atten: sys::adc_atten_t_ADC_ATTEN_DB_11,
            bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_12,
            ..Default::default()
        };
        let mut handle: sys::adc_cali_handle_t = core::ptr::null_mut();
        sys::esp!(unsafe { sys::adc_cali_create_scheme_line_fitting(&config, &mut handle) })?;
        Ok(Self { handle })
    }

    /// `None` when the driver rejects the code.
    pub fn try_to_millivolts(&self, code: u16) -> Option<i32> {
        let mut mv = 0;
        let rc = unsafe { sys::adc_cali_raw_to_voltage(self.handle, i32::from(code), &mut mv) };
        (rc == sys::ESP_OK).then_some(mv)
    }
}

impl Drop for ChipCalibration {
    fn drop(&mut self) {
        let rc = unsafe { sys::adc_cali_delete_scheme_line_fitting(self.handle) };
        if rc != sys::ESP_OK {
            warn!("failed to release ADC calibration: esp_err_t={rc}");
        }
    }
}

pub struct RelayPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    active_high: bool,
}

impl RelayPin {
    pub fn new(gpio: i32, active_high: bool) -> anyhow::Result<Self> {
        let pin = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }?;
        let mut relay = Self { pin, active_high };
        relay.set(RelayState::Off)?;
        Ok(relay)
    }

    pub fn set(&mut self, state: RelayState) -> anyhow::Result<()> {
        if state.is_on() == self.active_high {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        Ok(())
    }
}
