//! Driver for the 800x480 monochrome e-paper panel (SSD1677-class
//! controller).
//!
//! Full-frame updates only: the frame redraws at most a handful of times per
//! hour, so partial-refresh bookkeeping buys nothing here. Bit = 1 is white.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 480;
/// 1 bit per pixel.
pub const FRAME_SIZE: usize = (WIDTH as usize * HEIGHT as usize) / 8;

/// Polls of the BUSY pin before a refresh is declared stuck. A full refresh
/// takes about 4 s; the budget allows ten.
const BUSY_POLL_LIMIT: u32 = 1000;
const BUSY_POLL_MS: u32 = 10;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Command {
    DriverOutputControl = 0x01,
    DeepSleep = 0x10,
    DataEntryMode = 0x11,
    SoftReset = 0x12,
    TempSensorControl = 0x18,
    MasterActivation = 0x20,
    UpdateControl2 = 0x22,
    WriteRamBw = 0x24,
    BorderWaveform = 0x3C,
    RamXRange = 0x44,
    RamYRange = 0x45,
    RamXCounter = 0x4E,
    RamYCounter = 0x4F,
}

#[derive(Debug)]
pub enum PanelError {
    Spi,
    Pin,
    /// BUSY never released; the panel is unpowered or wedged.
    BusyTimeout,
}

pub struct Panel<SPI, BUSY, DC, RST> {
    spi: SPI,
    busy: BUSY,
    dc: DC,
    rst: RST,
}

impl<SPI, BUSY, DC, RST> Panel<SPI, BUSY, DC, RST>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
{
    /// Hardware-reset and initialize the controller.
    pub fn new<D: DelayNs>(
        spi: SPI,
        busy: BUSY,
        dc: DC,
        rst: RST,
        delay: &mut D,
    ) -> Result<Self, PanelError> {
        let mut panel = Self { spi, busy, dc, rst };
        panel.hardware_reset(delay);
        panel.init(delay)?;
        Ok(panel)
    }

    fn hardware_reset<D: DelayNs>(&mut self, delay: &mut D) {
        let _ = self.rst.set_high();
        delay.delay_ms(50);
        let _ = self.rst.set_low();
        delay.delay_ms(10);
        let _ = self.rst.set_high();
        delay.delay_ms(50);
    }

    fn init<D: DelayNs>(&mut self, delay: &mut D) -> Result<(), PanelError> {
        self.command(Command::SoftReset)?;
        self.busy_wait(delay)?;

        // Gate lines = panel height, scanned top to bottom.
        let rows = (HEIGHT - 1) as u16;
        self.command(Command::DriverOutputControl)?;
        self.data(&[rows as u8, (rows >> 8) as u8, 0x00])?;

        // X and Y both incrementing, counter along X.
        self.command(Command::DataEntryMode)?;
        self.data(&[0x03])?;

        let max_x = (WIDTH - 1) as u16;
        self.command(Command::RamXRange)?;
        self.data(&[0x00, 0x00, max_x as u8, (max_x >> 8) as u8])?;
        self.command(Command::RamYRange)?;
        self.data(&[0x00, 0x00, rows as u8, (rows >> 8) as u8])?;

        self.command(Command::BorderWaveform)?;
        self.data(&[0x01])?;

        self.command(Command::TempSensorControl)?;
        self.data(&[0x80])?; // internal sensor

        self.busy_wait(delay)
    }

    /// Write a full 1-bpp frame and run a refresh to completion.
    pub fn display_frame<D: DelayNs>(
        &mut self,
        frame: &[u8; FRAME_SIZE],
        delay: &mut D,
    ) -> Result<(), PanelError> {
        self.command(Command::RamXCounter)?;
        self.data(&[0x00, 0x00])?;
        self.command(Command::RamYCounter)?;
        self.data(&[0x00, 0x00])?;

        self.command(Command::WriteRamBw)?;
        self.data(frame)?;

        self.command(Command::UpdateControl2)?;
        self.data(&[0xF7])?;
        self.command(Command::MasterActivation)?;
        self.busy_wait(delay)
    }

    /// Power the panel down until the next hardware reset. RAM is retained
    /// but the next wake re-initializes anyway.
    pub fn sleep(&mut self) -> Result<(), PanelError> {
        self.command(Command::DeepSleep)?;
        self.data(&[0x01])
    }

    fn busy_wait<D: DelayNs>(&mut self, delay: &mut D) -> Result<(), PanelError> {
        for _ in 0..BUSY_POLL_LIMIT {
            if !self.busy.is_high().map_err(|_| PanelError::Pin)? {
                return Ok(());
            }
            delay.delay_ms(BUSY_POLL_MS);
        }
        Err(PanelError::BusyTimeout)
    }

    fn command(&mut self, command: Command) -> Result<(), PanelError> {
        self.dc.set_low().map_err(|_| PanelError::Pin)?;
        self.spi.write(&[command as u8]).map_err(|_| PanelError::Spi)
    }

    fn data(&mut self, data: &[u8]) -> Result<(), PanelError> {
        self.dc.set_high().map_err(|_| PanelError::Pin)?;
        self.spi.write(data).map_err(|_| PanelError::Spi)
    }
}
