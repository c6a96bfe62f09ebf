//! Fetch → decode → blit pipeline behind the engine's image sink.
//!
//! Images arrive pre-rendered from the service as 800x480 8-bit grayscale
//! PNGs, so the on-device work is a streaming download, a `minipng` decode,
//! and a threshold to the panel's 1-bpp format. The network runner is polled
//! inside each request, which keeps everything on the single boot-to-sleep
//! control path — no background task outlives a cycle.

use alloc::boxed::Box;

use embassy_futures::block_on;
use embassy_futures::select::{select, Either};
use embassy_net::{Runner, Stack};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use esp_hal::gpio::Output;
use esp_radio::wifi::WifiDevice;
use inkcycle_core::engine::{FetchError, IntegrityToken};
use log::{info, warn};

use crate::http::{self, HttpError, Method, Url, TLS_READ_BUF_SIZE, TLS_WRITE_BUF_SIZE};
use crate::panel::{Panel, FRAME_SIZE, HEIGHT, WIDTH};
use crate::rtcmem;

/// Ceiling for a fetched PNG (PSRAM).
const IMAGE_BUF_SIZE: usize = 256 * 1024;
/// Decode scratch for an 8-bit grayscale full frame (PSRAM).
const DECODE_BUF_SIZE: usize = 512 * 1024;

/// Threshold between panel black and panel white.
const LUMA_WHITE: u8 = 0x80;

pub struct FrameSink<SPI, BUSY, DC, RST> {
    stack: Stack<'static>,
    runner: Runner<'static, WifiDevice<'static>>,
    /// False when WiFi or DHCP failed at boot; requests fail fast and the
    /// engine paces the retries.
    network_up: bool,
    panel: Panel<SPI, BUSY, DC, RST>,
    led: Output<'static>,
    tls_seed: u64,
    tls_read_buf: Box<[u8; TLS_READ_BUF_SIZE]>,
    tls_write_buf: Box<[u8; TLS_WRITE_BUF_SIZE]>,
    image_buf: Box<[u8; IMAGE_BUF_SIZE]>,
    image_len: usize,
    decode_buf: Box<[u8; DECODE_BUF_SIZE]>,
    frame: Box<[u8; FRAME_SIZE]>,
}

impl<SPI, BUSY, DC, RST> FrameSink<SPI, BUSY, DC, RST>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
{
    pub fn new(
        stack: Stack<'static>,
        runner: Runner<'static, WifiDevice<'static>>,
        network_up: bool,
        panel: Panel<SPI, BUSY, DC, RST>,
        led: Output<'static>,
        tls_seed: u64,
    ) -> Self {
        Self {
            stack,
            runner,
            network_up,
            panel,
            led,
            tls_seed,
            tls_read_buf: Box::new([0; TLS_READ_BUF_SIZE]),
            tls_write_buf: Box::new([0; TLS_WRITE_BUF_SIZE]),
            image_buf: Box::new([0; IMAGE_BUF_SIZE]),
            image_len: 0,
            decode_buf: Box::new([0; DECODE_BUF_SIZE]),
            frame: Box::new([0; FRAME_SIZE]),
        }
    }

    /// Download the slot image and push it to the panel. `rtc_secs` is the
    /// RTC counter reading used to anchor a clock sync from the response.
    pub fn fetch_and_display(&mut self, url: &str, rtc_secs: u64) -> Result<(), FetchError> {
        if !self.network_up {
            return Err(FetchError::Network);
        }
        let parsed = Url::parse(url).map_err(|_| FetchError::Protocol)?;

        let Self { stack, runner, tls_read_buf, tls_write_buf, image_buf, tls_seed, .. } = self;
        let mut received = 0usize;
        let request = http::request(
            *stack,
            &parsed,
            Method::Get,
            &mut tls_read_buf[..],
            &mut tls_write_buf[..],
            *tls_seed,
            |chunk| {
                let room = IMAGE_BUF_SIZE - received;
                let take = chunk.len().min(room);
                image_buf[received..received + take].copy_from_slice(&chunk[..take]);
                received += take;
            },
        );
        let info = match block_on(select(runner.run(), request)) {
            Either::First(never) => never,
            Either::Second(result) => result.map_err(fetch_error)?,
        };
        self.image_len = received;
        info!("fetched {} bytes from {url}", self.image_len);

        if let Some(epoch) = info.date_epoch {
            rtcmem::epoch_record(epoch, rtc_secs);
        }

        self.rasterize()?;
        let mut delay = embassy_time::Delay;
        self.panel.display_frame(&self.frame, &mut delay).map_err(|err| {
            warn!("panel refresh failed: {err:?}");
            FetchError::Display
        })
    }

    /// HEAD the slot URL and return its content validator.
    pub fn probe_token(&mut self, url: &str, rtc_secs: u64) -> Result<IntegrityToken, FetchError> {
        if !self.network_up {
            return Err(FetchError::Network);
        }
        let parsed = Url::parse(url).map_err(|_| FetchError::Protocol)?;

        let Self { stack, runner, tls_read_buf, tls_write_buf, tls_seed, .. } = self;
        let request = http::request(
            *stack,
            &parsed,
            Method::Head,
            &mut tls_read_buf[..],
            &mut tls_write_buf[..],
            *tls_seed,
            |_| {},
        );
        let info = match block_on(select(runner.run(), request)) {
            Either::First(never) => never,
            Either::Second(result) => result.map_err(fetch_error)?,
        };

        if let Some(epoch) = info.date_epoch {
            rtcmem::epoch_record(epoch, rtc_secs);
        }

        info.validator
            .map(|validator| IntegrityToken::new(validator.as_str()))
            .ok_or(FetchError::Protocol)
    }

    /// Triple red flash. The panel keeps its last image, which beats a blank
    /// error screen on a frame hanging on a wall.
    pub fn show_failure(&mut self) {
        let mut delay = embassy_time::Delay;
        for _ in 0..3 {
            self.led.set_low(); // active low: ON
            delay.delay_ms(150);
            self.led.set_high();
            delay.delay_ms(150);
        }
    }

    /// Put the panel into deep sleep before the SoC suspends.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.panel.sleep() {
            warn!("panel sleep failed: {err:?}");
        }
    }

    fn rasterize(&mut self) -> Result<(), FetchError> {
        let data = &self.image_buf[..self.image_len];
        let image = minipng::decode_png(data, &mut self.decode_buf[..]).map_err(|err| {
            warn!("png decode failed: {err:?}");
            FetchError::Decode
        })?;

        let pixel_count = (WIDTH * HEIGHT) as usize;
        if image.width() != WIDTH || image.height() != HEIGHT || image.pixels().len() < pixel_count
        {
            warn!(
                "unexpected image geometry: {}x{}, {} pixel bytes",
                image.width(),
                image.height(),
                image.pixels().len()
            );
            return Err(FetchError::Decode);
        }

        let pixels = image.pixels();
        let row_bytes = WIDTH as usize / 8;
        self.frame.fill(0);
        for y in 0..HEIGHT as usize {
            let row = &pixels[y * WIDTH as usize..(y + 1) * WIDTH as usize];
            for (x, &luma) in row.iter().enumerate() {
                if luma >= LUMA_WHITE {
                    self.frame[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
                }
            }
        }
        Ok(())
    }
}

fn fetch_error(err: HttpError) -> FetchError {
    warn!("http request failed: {err:?}");
    match err {
        HttpError::InvalidUrl | HttpError::Parse | HttpError::Status(_) => FetchError::Protocol,
        _ => FetchError::Network,
    }
}
