//! esp-hal SPI master and chip select line of the SD card slot.
//!
//! While no card is initialized the SPI block is dropped and SCK, MOSI and
//! CS float as pulled-up inputs, so a card inserted into a powered slot sees
//! no clock. The bus reattaches on the next `set_frequency`.

use core::convert::Infallible;

use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal_async::spi::{Error as SpiError, ErrorKind, ErrorType, SpiBus};
use esp_hal::Async;
use esp_hal::gpio::{Flex, InputConfig, Pull};
use esp_hal::peripherals::{GPIO11, GPIO12, GPIO13, SPI2};
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config, ConfigError, Spi};
use esp_hal::time::Rate;
use log::{debug, warn};

use emstore_core::sdmmc::{ChipSelect, SdBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdBusError {
    Spi(esp_hal::spi::Error),
    /// The bus was released and not reattached yet.
    Released,
}

impl SpiError for SdBusError {
    fn kind(&self) -> ErrorKind {
        match self {
            SdBusError::Spi(e) => e.kind(),
            SdBusError::Released => ErrorKind::Other,
        }
    }
}

fn parked_input() -> InputConfig {
    InputConfig::default().with_pull(Pull::Up)
}

/// SPI2 with SCK=GPIO12, MOSI=GPIO11 and MISO=GPIO13.
pub struct EspSdBus {
    spi: Option<Spi<'static, Async>>,
    /// SCK and MOSI while the bus is released
    parked: Option<[Flex<'static>; 2]>,
    config: Config,
}

impl EspSdBus {
    /// SD cards in SPI mode use CPOL=0, CPHA=0.
    pub fn config(hz: u32) -> Config {
        Config::default()
            .with_frequency(Rate::from_hz(hz))
            .with_mode(Mode::_0)
    }

    /// Takes the peripheral and its pins. The bus starts released.
    pub fn new(
        _spi: SPI2<'static>,
        _sck: GPIO12<'static>,
        _mosi: GPIO11<'static>,
        _miso: GPIO13<'static>,
        hz: u32,
    ) -> Self {
        let mut bus = Self {
            spi: None,
            parked: None,
            config: Self::config(hz),
        };
        bus.release();
        bus
    }

    fn attach(&mut self) -> Result<(), ConfigError> {
        self.parked = None;
        // SAFETY: `new` took these singletons and only one driver built from
        // them is alive at any time.
        let (spi, sck, mosi, miso) = unsafe {
            (
                SPI2::steal(),
                GPIO12::steal(),
                GPIO11::steal(),
                GPIO13::steal(),
            )
        };
        let spi = Spi::new(spi, self.config)?
            .with_sck(sck)
            .with_mosi(mosi)
            .with_miso(miso)
            .into_async();
        self.spi = Some(spi);
        debug!("sd bus: attached");
        Ok(())
    }

    fn spi(&mut self) -> Result<&mut Spi<'static, Async>, SdBusError> {
        self.spi.as_mut().ok_or(SdBusError::Released)
    }
}

impl ErrorType for EspSdBus {
    type Error = SdBusError;
}

impl SpiBus<u8> for EspSdBus {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        SpiBus::read(self.spi()?, words).await.map_err(SdBusError::Spi)
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        SpiBus::write(self.spi()?, words).await.map_err(SdBusError::Spi)
    }

    async fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        SpiBus::transfer(self.spi()?, read, write)
            .await
            .map_err(SdBusError::Spi)
    }

    async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        SpiBus::transfer_in_place(self.spi()?, words)
            .await
            .map_err(SdBusError::Spi)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        SpiBus::flush(self.spi()?).await.map_err(SdBusError::Spi)
    }
}

impl SdBus for EspSdBus {
    fn set_frequency(&mut self, hz: u32) {
        self.config = self.config.with_frequency(Rate::from_hz(hz));
        let applied = match self.spi.as_mut() {
            Some(spi) => spi.apply_config(&self.config),
            None => self.attach(),
        };
        if let Err(e) = applied {
            warn!("sd bus: cannot run at {} Hz: {:?}", hz, e);
        }
    }

    fn release(&mut self) {
        if self.parked.is_some() {
            return;
        }
        self.spi = None;
        // SAFETY: the SPI driver holding the pins was dropped above
        let (sck, mosi) = unsafe { (GPIO12::steal(), GPIO11::steal()) };
        let mut pins = [Flex::new(sck), Flex::new(mosi)];
        for pin in &mut pins {
            pin.set_output_enable(false);
            pin.apply_input_config(&parked_input());
            pin.set_input_enable(true);
        }
        self.parked = Some(pins);
        debug!("sd bus: released");
    }
}

/// Chip select on a GPIO that can be switched between output and input.
pub struct EspChipSelect {
    pin: Flex<'static>,
}

impl EspChipSelect {
    /// Starts deselected.
    pub fn new(pin: Flex<'static>) -> Self {
        let mut cs = Self { pin };
        cs.drive(true);
        cs
    }

    fn drive(&mut self, high: bool) {
        if high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.pin.set_input_enable(false);
        self.pin.set_output_enable(true);
    }
}

impl PinErrorType for EspChipSelect {
    type Error = Infallible;
}

impl OutputPin for EspChipSelect {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }
}

impl ChipSelect for EspChipSelect {
    fn release(&mut self) {
        self.pin.set_output_enable(false);
        self.pin.apply_input_config(&parked_input());
        self.pin.set_input_enable(true);
    }
}
