//! inkcycle firmware — ESP32-S3 e-paper frame that deep-sleeps between image
//! refreshes.
//!
//! One boot is one wake cycle: classify the wake cause, bring the platform
//! up, hand control to the decision engine, then suspend for exactly as long
//! as it says. Environment variables required at build time:
//! - WIFI_SSID: WiFi network name
//! - WIFI_PASS: WiFi password

#![no_std]
#![no_main]

extern crate alloc;

use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_net::StackResources;
use embassy_time::Instant;
use embedded_hal_bus::spi::{ExclusiveDevice, NoDelay};
use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::{
    Blocking,
    analog::adc::{Adc, AdcConfig, Attenuation},
    clock::CpuClock,
    gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull},
    rng::Rng,
    rtc_cntl::{
        Rtc,
        sleep::{Ext0WakeupSource, TimerWakeupSource, WakeupLevel},
    },
    spi::{
        Mode,
        master::{Config as SpiConfig, Spi},
    },
    system::SleepSource,
    time::Rate,
    timer::timg::TimerGroup,
};
use esp_radio::{Controller, wifi::Config as WifiConfig};
use inkcycle_core::config::{ConfigError, FrameConfig};
use inkcycle_core::decision::SleepDuration;
use inkcycle_core::engine::{
    Clock, ConfigSource, CycleEngine, CyclePhase, CycleReport, FetchError, ImageSink,
    IntegrityToken, Platform, SleepCommand, TelemetrySink, TokenStore,
};
use inkcycle_core::time::ClockTime;
use inkcycle_core::wake::WakeReason;
use inkcycle_firmware::display::FrameSink;
use inkcycle_firmware::net;
use inkcycle_firmware::panel::Panel;
use inkcycle_firmware::rtcmem::{self, RtcCell};
use inkcycle_firmware::storage::SdConfigSource;
use log::{debug, info};

esp_bootloader_esp_idf::esp_app_desc!();

// When you are okay with using a nightly compiler it's better to use https://docs.rs/static_cell/2.1.0/static_cell/macro.make_static.html
macro_rules! mk_static {
    ($t:ty,$val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write(($val));
        x
    }};
}

const SSID: &str = env!("WIFI_SSID");
const PASSWORD: &str = env!("WIFI_PASS");

/// Seconds to wait for a DHCP lease before declaring the cycle offline.
const DHCP_WAIT_SECS: u32 = 20;

type SpiBus = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, NoDelay>;

/// Map the hardware wake cause onto the engine's vocabulary. An undefined
/// cause with no surviving RTC state is the first boot after power loss;
/// with surviving state it was the reset button.
fn classify_wake(cause: SleepSource, state_survived: bool) -> WakeReason {
    match cause {
        SleepSource::Timer => WakeReason::Timer,
        SleepSource::Ext0 => WakeReason::Button,
        SleepSource::Undefined if !state_survived => WakeReason::FirstBoot,
        SleepSource::Undefined => WakeReason::ResetButton,
        _ => WakeReason::Unknown,
    }
}

/// Everything the decision engine needs, wired to real hardware.
struct FramePlatform {
    sink: FrameSink<SpiBus, Input<'static>, Output<'static>, Output<'static>>,
    config: SdConfigSource<SpiBus, embassy_time::Delay>,
    rtc: Rtc<'static>,
    boot: Instant,
    battery_mv: Option<u32>,
}

impl FramePlatform {
    fn rtc_secs(&self) -> u64 {
        self.rtc.time_since_boot().as_secs()
    }
}

impl ConfigSource for FramePlatform {
    fn load(&mut self) -> Result<FrameConfig, ConfigError> {
        self.config.load_config()
    }
}

impl Clock for FramePlatform {
    fn now_utc(&mut self) -> Option<ClockTime> {
        rtcmem::epoch_now(self.rtc_secs()).map(ClockTime::from_epoch)
    }

    fn awake_secs(&mut self) -> u32 {
        self.boot.elapsed().as_secs() as u32
    }
}

impl ImageSink for FramePlatform {
    fn fetch_and_display(&mut self, url: &str) -> Result<(), FetchError> {
        let rtc_secs = self.rtc_secs();
        self.sink.fetch_and_display(url, rtc_secs)
    }

    fn probe_token(&mut self, url: &str) -> Result<IntegrityToken, FetchError> {
        let rtc_secs = self.rtc_secs();
        self.sink.probe_token(url, rtc_secs)
    }

    fn show_failure(&mut self) {
        self.sink.show_failure();
    }
}

impl TokenStore for FramePlatform {
    fn load_token(&mut self) -> Option<IntegrityToken> {
        rtcmem::token_load()
    }

    fn store_token(&mut self, token: &IntegrityToken) {
        rtcmem::token_store(token);
    }

    fn clear_token(&mut self) {
        rtcmem::token_clear();
    }
}

impl TelemetrySink for FramePlatform {
    fn record(&mut self, report: &CycleReport) {
        // Key=value line; the MQTT bridge (out of scope) tails this format.
        info!(
            "cycle wake={} mode={} outcome={} slot={:?} sleep_secs={:?} awake_secs={} battery={:?}",
            report.wake.as_str(),
            report.mode.map(|m| m.as_str()).unwrap_or("-"),
            report.outcome.as_str(),
            report.slot,
            report.sleep_secs,
            report.awake_secs,
            report.battery_percent,
        );
    }
}

impl Platform for FramePlatform {
    fn battery_millivolts(&mut self) -> Option<u32> {
        self.battery_mv
    }
}

#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    // Logger first so early failures are visible.
    esp_println::logger::init_logger_from_env();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Wake classification needs to know whether RTC state survived.
    let state_survived = rtcmem::validate_or_reset();
    let cause = esp_hal::rtc_cntl::wakeup_cause();
    let wake = classify_wake(cause, state_survived);
    info!(
        "woke: {} (cause {:?}, state {})",
        wake.as_str(),
        cause,
        if state_survived { "warm" } else { "cold" }
    );

    esp_alloc::heap_allocator!(size: 96 * 1024);
    esp_alloc::psram_allocator!(&peripherals.PSRAM, esp_hal::psram);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(
        timg0.timer0,
        #[cfg(target_arch = "riscv32")]
        esp_hal::interrupt::software::SoftwareInterruptControl::new(peripherals.SW_INTERRUPT)
            .software_interrupt0,
    );
    let boot = Instant::now();

    // Red status LED, active low; off until something goes wrong.
    let led_red = Output::new(peripherals.GPIO45, Level::High, OutputConfig::default());

    // Battery voltage through the on-board 1:2 divider, sampled once per
    // cycle. A missing sense line just drops the field from telemetry.
    let battery_mv = {
        let mut adc_config = AdcConfig::new();
        let mut sense = adc_config.enable_pin(peripherals.GPIO2, Attenuation::_11dB);
        let mut adc = Adc::new(peripherals.ADC1, adc_config);
        let raw = adc.read_blocking(&mut sense);
        Some(u32::from(raw) * 3300 / 4095 * 2)
    };

    // ==================== SD card (configuration store) ====================
    let sd_spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(20))
            .with_mode(Mode::_0),
    )
    .expect("SD SPI init failed")
    .with_sck(peripherals.GPIO39)
    .with_mosi(peripherals.GPIO41)
    .with_miso(peripherals.GPIO40);
    let sd_cs = Output::new(peripherals.GPIO38, Level::High, OutputConfig::default());
    let sd_device = ExclusiveDevice::new_no_delay(sd_spi, sd_cs).unwrap();
    let config_source = SdConfigSource::new(sd_device, embassy_time::Delay);

    // ==================== E-paper panel ====================
    let panel_spi = Spi::new(
        peripherals.SPI3,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(10))
            .with_mode(Mode::_0),
    )
    .expect("panel SPI init failed")
    .with_sck(peripherals.GPIO10)
    .with_mosi(peripherals.GPIO11);
    let panel_cs = Output::new(peripherals.GPIO9, Level::High, OutputConfig::default());
    let panel_device = ExclusiveDevice::new_no_delay(panel_spi, panel_cs).unwrap();
    let busy = Input::new(peripherals.GPIO13, InputConfig::default().with_pull(Pull::Up));
    let dc = Output::new(peripherals.GPIO8, Level::Low, OutputConfig::default());
    let rst = Output::new(peripherals.GPIO12, Level::High, OutputConfig::default());

    let mut delay = embassy_time::Delay;
    let panel = Panel::new(panel_device, busy, dc, rst, &mut delay).expect("panel init failed");

    // ==================== WiFi ====================
    let rng = Rng::new();
    let esp_radio_ctrl = mk_static!(Controller<'static>, esp_radio::init().unwrap());
    let (mut wifi_controller, ifaces) =
        esp_radio::wifi::new(esp_radio_ctrl, peripherals.WIFI, WifiConfig::default()).unwrap();

    let net_config = embassy_net::Config::dhcpv4(Default::default());
    let (stack, mut runner) = embassy_net::new(
        ifaces.sta,
        net_config,
        mk_static!(StackResources<3>, StackResources::<3>::new()),
        rng.random() as u64,
    );

    let mut network_up = net::connect(&mut wifi_controller, SSID, PASSWORD).await;
    if network_up {
        network_up = match select(net::wait_for_ip(stack, DHCP_WAIT_SECS), runner.run()).await {
            Either::First(got_lease) => got_lease,
            Either::Second(never) => never,
        };
    }

    // ==================== The wake cycle itself ====================
    let tls_seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let sink = FrameSink::new(stack, runner, network_up, panel, led_red, tls_seed);
    let rtc = Rtc::new(peripherals.LPWR);
    let platform = FramePlatform { sink, config: config_source, rtc, boot, battery_mv };

    let mut engine = CycleEngine::new(platform, RtcCell);
    let command = engine.run_wake_cycle(wake);
    let (mut platform, _cell) = engine.into_parts();

    // ==================== Teardown and suspend ====================
    platform.sink.shutdown();
    net::disconnect(&mut wifi_controller).await;

    enter_deep_sleep(&mut platform.rtc, peripherals.GPIO4, command)
}

/// Arm the wake sources and suspend. Never returns; the next wake is a
/// fresh boot.
fn enter_deep_sleep<P: esp_hal::gpio::RtcPinWithResistors>(
    rtc: &mut Rtc,
    button_pin: P,
    command: SleepCommand,
) -> ! {
    // Pull the button line up so it cannot float into a spurious wake.
    button_pin.rtcio_pullup(true);
    button_pin.rtcio_pulldown(false);
    let button = Ext0WakeupSource::new(button_pin, WakeupLevel::Low);
    debug!("cycle {:?}", CyclePhase::Suspended);

    match command.duration {
        SleepDuration::Seconds(secs) => {
            info!("deep sleep for {secs}s");
            let timer = TimerWakeupSource::new(core::time::Duration::from_secs(u64::from(secs)));
            // Let the log line drain before power-down.
            esp_hal::delay::Delay::new().delay_millis(50);
            if command.arm_button {
                rtc.sleep_deep(&[&timer, &button])
            } else {
                rtc.sleep_deep(&[&timer])
            }
        }
        SleepDuration::ButtonOnly => {
            info!("deep sleep until button press");
            esp_hal::delay::Delay::new().delay_millis(50);
            rtc.sleep_deep(&[&button])
        }
    }
}
