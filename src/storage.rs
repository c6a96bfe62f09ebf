//! SD-card configuration provider.
//!
//! The configuration portal (out of scope here) writes `frame.json` to the
//! card's FAT root; this module reads and parses it once per wake. The card
//! is probed lazily so a missing card surfaces as a config-load failure the
//! engine already handles, not a boot panic.

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;
use embedded_sdmmc::{Mode, SdCard, TimeSource, Timestamp, VolumeIdx, VolumeManager};
use inkcycle_core::config::{parse_config, ConfigError, FrameConfig};
use log::{debug, warn};

const CONFIG_FILE: &str = "frame.json";
const MAX_CONFIG_BYTES: usize = 4096;

/// The FAT layer wants timestamps but this module only ever reads.
struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

pub struct SdConfigSource<SPI: SpiDevice, DELAY: DelayNs> {
    volume_mgr: VolumeManager<SdCard<SPI, DELAY>, FixedTimeSource>,
}

impl<SPI, DELAY> SdConfigSource<SPI, DELAY>
where
    SPI: SpiDevice,
    DELAY: DelayNs,
{
    pub fn new(spi: SPI, delay: DELAY) -> Self {
        let volume_mgr = VolumeManager::new(SdCard::new(spi, delay), FixedTimeSource);
        Self { volume_mgr }
    }

    /// Read and parse the configuration document.
    pub fn load_config(&mut self) -> Result<FrameConfig, ConfigError> {
        let mut volume = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(|err| {
                warn!("sd volume open failed: {err:?}");
                ConfigError::Unreadable
            })?;

        let mut root_dir = volume.open_root_dir().map_err(|_| ConfigError::Unreadable)?;

        let mut file = root_dir
            .open_file_in_dir(CONFIG_FILE, Mode::ReadOnly)
            .map_err(|err| {
                warn!("{CONFIG_FILE} open failed: {err:?}");
                ConfigError::Unreadable
            })?;

        let mut buf = [0u8; MAX_CONFIG_BYTES];
        let mut total_read = 0;
        loop {
            if total_read == buf.len() {
                return Err(ConfigError::Parse);
            }
            match file.read(&mut buf[total_read..]) {
                Ok(0) => break,
                Ok(n) => total_read += n,
                Err(_) => return Err(ConfigError::Unreadable),
            }
        }

        let json = core::str::from_utf8(&buf[..total_read]).map_err(|_| ConfigError::Parse)?;
        debug!("read {total_read} bytes of configuration");
        parse_config(json)
    }
}
