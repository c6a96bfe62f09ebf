//! The wake-cycle state machine.
//!
//! One pass from wake to suspend: load configuration, gate on the hourly
//! schedule, plan the cycle, drive the fetch/display collaborator, update the
//! persisted cell, and arm exactly one sleep command. Every reachable path is
//! terminal — there is no way back to the top without suspending first, so a
//! run of bad cycles can never turn into a high-power busy loop.

use heapless::String;
use log::{debug, error, info, warn};

use crate::battery;
use crate::config::{ConfigError, DisplayMode, FrameConfig, MAX_URL_LEN};
use crate::cycle::{self, CarouselCell, CycleCell, MAX_FETCH_RETRIES};
use crate::decision::{self, CyclePlan, ImageTargetDecision, SleepDuration, TargetReason};
use crate::schedule::{self, ScheduleGate};
use crate::time::ClockTime;
use crate::wake::WakeReason;

/// Sleep after an unreadable configuration; retrying sooner cannot help.
pub const CONFIG_FALLBACK_SLEEP_SECS: u32 = 900;
/// Sleep between bounded fetch retries.
pub const FETCH_RETRY_SLEEP_SECS: u32 = 30;
/// Sleep after the retry budget is exhausted — longer than a retry, shorter
/// than a normal refresh.
pub const ERROR_BACKOFF_SLEEP_SECS: u32 = 300;

pub const MAX_TOKEN_LEN: usize = 64;

/// Opaque content-identity token; in practice an HTTP validator header.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IntegrityToken(String<MAX_TOKEN_LEN>);

impl IntegrityToken {
    /// Build from a header value, truncating anything oversized.
    pub fn new(value: &str) -> Self {
        let mut inner = String::new();
        for ch in value.chars() {
            if inner.push(ch).is_err() {
                break;
            }
        }
        Self(inner)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// How the fetch/display collaborator failed. The engine logs the class but
/// every failure takes the same branch; retries and timeouts below this
/// boundary are the collaborator's business.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchError {
    Network,
    Protocol,
    Decode,
    Display,
}

pub trait ConfigSource {
    fn load(&mut self) -> Result<FrameConfig, ConfigError>;
}

pub trait Clock {
    /// Current UTC time of day, or `None` before the first sync. An unknown
    /// clock disables the hourly gate for the cycle.
    fn now_utc(&mut self) -> Option<ClockTime>;

    /// Wall-clock seconds spent awake so far this cycle.
    fn awake_secs(&mut self) -> u32;
}

pub trait ImageSink {
    fn fetch_and_display(&mut self, url: &str) -> Result<(), FetchError>;
    fn probe_token(&mut self, url: &str) -> Result<IntegrityToken, FetchError>;
    /// Make a persistent failure visible to the user. Fire-and-forget.
    fn show_failure(&mut self);
}

pub trait TokenStore {
    fn load_token(&mut self) -> Option<IntegrityToken>;
    fn store_token(&mut self, token: &IntegrityToken);
    fn clear_token(&mut self);
}

pub trait TelemetrySink {
    /// Fire-and-forget; delivery failures are the sink's problem.
    fn record(&mut self, report: &CycleReport);
}

/// Everything the engine needs from the outside world, bundled so the
/// firmware and the tests each implement a single type.
pub trait Platform: ConfigSource + Clock + ImageSink + TokenStore + TelemetrySink {
    fn battery_millivolts(&mut self) -> Option<u32>;
}

/// Progress marker for logs. The terminal action of every phase is arming a
/// sleep; nothing runs after [`CyclePhase::SleepArmed`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CyclePhase {
    Idle,
    ConfigLoaded,
    ScheduleChecked,
    TargetResolved,
    ChangeChecked,
    FetchedSuccess,
    FetchedFailure,
    SleepArmed,
    /// Logged by the platform at the suspend hand-off; nothing in the engine
    /// runs this late.
    Suspended,
}

/// Terminal classification of one wake cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// A fresh image was fetched and displayed.
    Refreshed,
    /// The integrity token matched; the fetch was skipped.
    SkippedUnchanged,
    /// The hourly gate was closed; nothing was fetched.
    ScheduleBlocked,
    /// The fetch failed with retry budget remaining.
    Retrying { attempt: u8 },
    /// A non-first carousel slot failed and was skipped over.
    SlotSkipped,
    /// The retry budget is exhausted; the failure was surfaced.
    FetchFailed,
    /// The configuration was unreadable; fallback sleep.
    ConfigFailed,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleOutcome::Refreshed => "refreshed",
            CycleOutcome::SkippedUnchanged => "skipped-unchanged",
            CycleOutcome::ScheduleBlocked => "schedule-blocked",
            CycleOutcome::Retrying { .. } => "retrying",
            CycleOutcome::SlotSkipped => "slot-skipped",
            CycleOutcome::FetchFailed => "fetch-failed",
            CycleOutcome::ConfigFailed => "config-failed",
        }
    }
}

/// Structured outcome report handed to the telemetry sink once per cycle,
/// just before the sleep command is returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CycleReport {
    pub wake: WakeReason,
    pub mode: Option<DisplayMode>,
    pub outcome: CycleOutcome,
    pub slot: Option<u8>,
    /// `None` means button-only suspension.
    pub sleep_secs: Option<u32>,
    pub awake_secs: u32,
    pub battery_percent: Option<u8>,
}

/// What the suspend primitive is asked to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SleepCommand {
    pub duration: SleepDuration,
    /// The button is armed on every suspension so the user can always wake
    /// the frame by hand.
    pub arm_button: bool,
}

pub struct CycleEngine<P: Platform, C: CycleCell> {
    platform: P,
    cell: C,
}

impl<P: Platform, C: CycleCell> CycleEngine<P, C> {
    pub fn new(platform: P, cell: C) -> Self {
        Self { platform, cell }
    }

    /// Tear down into the collaborators; the firmware reuses the platform to
    /// hand the sleep command to the suspend primitive.
    pub fn into_parts(self) -> (P, C) {
        (self.platform, self.cell)
    }

    /// Run one wake cycle to its terminal sleep command.
    pub fn run_wake_cycle(&mut self, wake: WakeReason) -> SleepCommand {
        debug!("cycle {:?}: wake reason {}", CyclePhase::Idle, wake.as_str());

        let config = match self.platform.load() {
            Ok(config) => config,
            Err(err) => {
                error!("configuration unreadable: {err:?}");
                return self.arm(
                    wake,
                    None,
                    CycleOutcome::ConfigFailed,
                    None,
                    SleepDuration::Seconds(CONFIG_FALLBACK_SLEEP_SECS),
                );
            }
        };
        let mode = config.mode();
        debug!(
            "cycle {:?}: {} slot(s), {} mode",
            CyclePhase::ConfigLoaded,
            config.slot_count(),
            mode.as_str()
        );

        // The time source is read exactly once per cycle.
        let now = self.platform.now_utc();

        let (current, retries) = match mode {
            DisplayMode::Single => (0, cycle::retry_count(self.cell.load())),
            DisplayMode::Carousel => {
                let cell = CarouselCell::decode(self.cell.load(), config.slot_count());
                (cell.index(), cell.retries())
            }
        };

        if wake.honors_schedule() {
            match now {
                Some(now) => {
                    if let ScheduleGate::SleepMinutes(minutes) = schedule::next_allowed_window(
                        now,
                        config.tz_offset_hours,
                        config.enabled_hours,
                    ) {
                        info!("update window closed, sleeping {minutes} min");
                        return self.arm(
                            wake,
                            Some(mode),
                            CycleOutcome::ScheduleBlocked,
                            None,
                            SleepDuration::Seconds(minutes * 60),
                        );
                    }
                }
                None => warn!("clock unsynchronized, hourly gate skipped"),
            }
        }
        debug!("cycle {:?}", CyclePhase::ScheduleChecked);

        let mut plan = decision::plan_cycle(&config, wake, current);
        if mode == DisplayMode::Carousel && retries > 0 && !wake.is_button() {
            // Mid retry batch the target stays pinned to slot 0, whatever its
            // stay flag says; a button press still overrides.
            plan = CyclePlan {
                target: ImageTargetDecision {
                    target_index: 0,
                    advance: false,
                    reason: TargetReason::RetryPinned,
                },
                final_index: 0,
                ..plan
            };
        }
        let url: String<MAX_URL_LEN> = config.slot(plan.target.target_index).url.clone();
        debug!(
            "cycle {:?}: slot {} ({}), advance={}",
            CyclePhase::TargetResolved,
            plan.target.target_index,
            plan.target.reason.as_str(),
            plan.target.advance
        );

        // With change detection on, the remote token is refreshed on every
        // cycle; the policy only decides whether a match may skip the fetch.
        let stored = self.platform.load_token();
        let remote = if config.change_detection {
            match self.platform.probe_token(url.as_str()) {
                Ok(token) => Some(token),
                Err(err) => {
                    warn!("integrity probe failed: {err:?}");
                    None
                }
            }
        } else {
            None
        };
        let matched = matches!((&stored, &remote), (Some(s), Some(r)) if s == r);
        debug!(
            "cycle {:?}: check={} ({}), matched={}",
            CyclePhase::ChangeChecked,
            plan.change_check.check,
            plan.change_check.reason.as_str(),
            matched
        );

        if plan.change_check.check && matched && wake == WakeReason::Timer {
            info!("slot {} unchanged, fetch skipped", plan.target.target_index);
            return self.finish_success(wake, &config, &plan, now, true, remote, stored);
        }

        match self.platform.fetch_and_display(url.as_str()) {
            Ok(()) => {
                debug!("cycle {:?}", CyclePhase::FetchedSuccess);
                self.finish_success(wake, &config, &plan, now, false, remote, stored)
            }
            Err(err) => {
                debug!("cycle {:?}: {err:?}", CyclePhase::FetchedFailure);
                self.finish_failure(wake, &config, &plan, retries)
            }
        }
    }

    fn finish_success(
        &mut self,
        wake: WakeReason,
        config: &FrameConfig,
        plan: &CyclePlan,
        now: Option<ClockTime>,
        skipped: bool,
        remote: Option<IntegrityToken>,
        stored: Option<IntegrityToken>,
    ) -> SleepCommand {
        if let Some(token) = remote {
            if stored.as_ref() != Some(&token) {
                self.platform.store_token(&token);
            }
        }

        // The cycle's single write to the persisted cell: clear the retry
        // counter, or leave the (possibly advanced) index in place.
        match config.mode() {
            DisplayMode::Single => self.cell.store(0),
            DisplayMode::Carousel => {
                self.cell.store(CarouselCell::Index(plan.final_index).encode())
            }
        }

        let sleep = decision::select_sleep_duration(config, now, plan.checked_index, skipped);
        info!(
            "slot {} done ({}), sleep {:?}",
            plan.target.target_index,
            sleep.reason.as_str(),
            sleep.duration
        );

        let outcome = if skipped {
            CycleOutcome::SkippedUnchanged
        } else {
            CycleOutcome::Refreshed
        };
        self.arm(wake, Some(config.mode()), outcome, Some(plan.target.target_index), sleep.duration)
    }

    fn finish_failure(
        &mut self,
        wake: WakeReason,
        config: &FrameConfig,
        plan: &CyclePlan,
        retries: u8,
    ) -> SleepCommand {
        // A failed cycle must not leave a token around that could skip the
        // fetch that would repair the panel.
        self.platform.clear_token();

        let mode = config.mode();
        let target = plan.target.target_index;
        let retryable = mode == DisplayMode::Single || target == 0;

        if retryable && retries < MAX_FETCH_RETRIES {
            let attempt = retries + 1;
            match mode {
                DisplayMode::Single => self.cell.store(attempt),
                DisplayMode::Carousel => {
                    self.cell.store(CarouselCell::FirstSlotRetry(attempt).encode())
                }
            }
            warn!("fetch failed, retry {attempt}/{MAX_FETCH_RETRIES} shortly");
            return self.arm(
                wake,
                Some(mode),
                CycleOutcome::Retrying { attempt },
                Some(target),
                SleepDuration::Seconds(FETCH_RETRY_SLEEP_SECS),
            );
        }

        if retryable {
            // Third consecutive failure: give up loudly and back off.
            match mode {
                DisplayMode::Single => self.cell.store(0),
                // The rotation must not stall on a dead first slot.
                DisplayMode::Carousel => {
                    self.cell.store(CarouselCell::Index(1 % config.slot_count()).encode())
                }
            }
            self.platform.show_failure();
            error!("fetch retry budget exhausted for slot {target}");
            return self.arm(
                wake,
                Some(mode),
                CycleOutcome::FetchFailed,
                Some(target),
                SleepDuration::Seconds(ERROR_BACKOFF_SLEEP_SECS),
            );
        }

        // Non-first carousel slot: skip it and keep rotating.
        let next = (plan.checked_index + 1) % config.slot_count();
        self.cell.store(CarouselCell::Index(next).encode());
        warn!("slot {target} failed, skipping ahead to {next}");
        self.arm(
            wake,
            Some(mode),
            CycleOutcome::SlotSkipped,
            Some(target),
            SleepDuration::Seconds(FETCH_RETRY_SLEEP_SECS),
        )
    }

    fn arm(
        &mut self,
        wake: WakeReason,
        mode: Option<DisplayMode>,
        outcome: CycleOutcome,
        slot: Option<u8>,
        duration: SleepDuration,
    ) -> SleepCommand {
        let awake = self.platform.awake_secs();
        let duration = match duration {
            // Subtract the time already burned awake; if the cycle outran the
            // interval, accept the drift rather than arm a zero sleep.
            SleepDuration::Seconds(target) if awake < target => {
                SleepDuration::Seconds(target - awake)
            }
            other => other,
        };

        let report = CycleReport {
            wake,
            mode,
            outcome,
            slot,
            sleep_secs: match duration {
                SleepDuration::Seconds(secs) => Some(secs),
                SleepDuration::ButtonOnly => None,
            },
            awake_secs: awake,
            battery_percent: self.platform.battery_millivolts().map(battery::percentage),
        };
        self.platform.record(&report);
        debug!("cycle {:?}: {:?} ({})", CyclePhase::SleepArmed, duration, outcome.as_str());

        SleepCommand { duration, arm_button: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::cycle::MemoryCell;
    use heapless::Vec;

    const SINGLE: &str =
        r#"{"slots": [{"url": "http://f/one.png", "interval_minutes": 15}]}"#;
    const SINGLE_CHECKED: &str = r#"{"slots": [{"url": "http://f/one.png",
        "interval_minutes": 15}], "change_detection": true}"#;
    const ROTATING_3: &str = r#"{"slots": [
        {"url": "http://f/a.png", "interval_minutes": 5},
        {"url": "http://f/b.png", "interval_minutes": 10},
        {"url": "http://f/c.png", "interval_minutes": 20}
    ]}"#;
    const STAY_FIRST_2: &str = r#"{"slots": [
        {"url": "http://f/a.png", "interval_minutes": 5, "stay": true},
        {"url": "http://f/b.png", "interval_minutes": 10}
    ]}"#;

    #[derive(Default)]
    struct FakePlatform {
        config_json: &'static str,
        config_fails: bool,
        now: Option<ClockTime>,
        awake: u32,
        battery_mv: Option<u32>,
        fetch_script: Vec<Result<(), FetchError>, 8>,
        fetch_calls: usize,
        last_url: Option<String<MAX_URL_LEN>>,
        probe: Option<Result<IntegrityToken, FetchError>>,
        probe_calls: usize,
        token: Option<IntegrityToken>,
        failures_shown: usize,
        reports: Vec<CycleReport, 8>,
    }

    impl FakePlatform {
        fn with_config(config_json: &'static str) -> Self {
            Self { config_json, ..Self::default() }
        }

        fn script(mut self, results: &[Result<(), FetchError>]) -> Self {
            self.fetch_script.extend_from_slice(results).unwrap();
            self
        }
    }

    impl ConfigSource for FakePlatform {
        fn load(&mut self) -> Result<FrameConfig, ConfigError> {
            if self.config_fails {
                return Err(ConfigError::Unreadable);
            }
            parse_config(self.config_json)
        }
    }

    impl Clock for FakePlatform {
        fn now_utc(&mut self) -> Option<ClockTime> {
            self.now
        }

        fn awake_secs(&mut self) -> u32 {
            self.awake
        }
    }

    impl ImageSink for FakePlatform {
        fn fetch_and_display(&mut self, url: &str) -> Result<(), FetchError> {
            self.last_url = Some(String::try_from(url).unwrap());
            let result = self.fetch_script.get(self.fetch_calls).copied().unwrap_or(Ok(()));
            self.fetch_calls += 1;
            result
        }

        fn probe_token(&mut self, _url: &str) -> Result<IntegrityToken, FetchError> {
            self.probe_calls += 1;
            self.probe.clone().unwrap_or(Err(FetchError::Network))
        }

        fn show_failure(&mut self) {
            self.failures_shown += 1;
        }
    }

    impl TokenStore for FakePlatform {
        fn load_token(&mut self) -> Option<IntegrityToken> {
            self.token.clone()
        }

        fn store_token(&mut self, token: &IntegrityToken) {
            self.token = Some(token.clone());
        }

        fn clear_token(&mut self) {
            self.token = None;
        }
    }

    impl TelemetrySink for FakePlatform {
        fn record(&mut self, report: &CycleReport) {
            self.reports.push(*report).unwrap();
        }
    }

    impl Platform for FakePlatform {
        fn battery_millivolts(&mut self) -> Option<u32> {
            self.battery_mv
        }
    }

    fn engine(platform: FakePlatform) -> CycleEngine<FakePlatform, MemoryCell> {
        CycleEngine::new(platform, MemoryCell::new())
    }

    #[test]
    fn test_config_failure_sleeps_fallback_without_fetching() {
        let mut platform = FakePlatform::with_config(SINGLE);
        platform.config_fails = true;
        let mut engine = engine(platform);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(command.duration, SleepDuration::Seconds(CONFIG_FALLBACK_SLEEP_SECS));
        assert!(command.arm_button);
        assert_eq!(engine.platform.fetch_calls, 0);
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::ConfigFailed);
    }

    #[test]
    fn test_single_image_retry_ladder() {
        let platform = FakePlatform::with_config(SINGLE).script(&[
            Err(FetchError::Network),
            Err(FetchError::Network),
            Err(FetchError::Network),
        ]);
        let mut engine = engine(platform);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.cell.load(), 1);
        assert_eq!(command.duration, SleepDuration::Seconds(FETCH_RETRY_SLEEP_SECS));
        assert_eq!(engine.platform.failures_shown, 0);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.cell.load(), 2);
        assert_eq!(command.duration, SleepDuration::Seconds(FETCH_RETRY_SLEEP_SECS));
        assert_eq!(engine.platform.failures_shown, 0);

        // Third failure: counter wraps to 0, exactly one visible failure.
        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.cell.load(), 0);
        assert_eq!(command.duration, SleepDuration::Seconds(ERROR_BACKOFF_SLEEP_SECS));
        assert_eq!(engine.platform.failures_shown, 1);
        assert_eq!(
            engine.platform.reports[2].outcome,
            CycleOutcome::FetchFailed
        );
    }

    #[test]
    fn test_success_resets_single_retry_counter() {
        let mut engine = engine(FakePlatform::with_config(SINGLE));
        engine.cell.store(2);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.cell.load(), 0);
        assert_eq!(command.duration, SleepDuration::Seconds(15 * 60));
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::Refreshed);
    }

    #[test]
    fn test_carousel_success_persists_advanced_index() {
        let mut engine = engine(FakePlatform::with_config(ROTATING_3));

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.cell.load(), 1);
        // Sleep paced by the pre-advance slot's 5-minute interval.
        assert_eq!(engine.platform.reports[0].sleep_secs, Some(300));

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.cell.load(), 2);
        assert_eq!(engine.platform.reports[1].sleep_secs, Some(600));
    }

    #[test]
    fn test_carousel_non_first_slot_failure_skips_without_retry() {
        let platform = FakePlatform::with_config(ROTATING_3).script(&[Err(FetchError::Network)]);
        let mut engine = engine(platform);
        engine.cell.store(1);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        // Slot 1 advanced to target 2, which failed: index moves one ahead
        // of the pre-advance slot, no retry, no visible failure.
        assert_eq!(engine.cell.load(), 2);
        assert_eq!(command.duration, SleepDuration::Seconds(FETCH_RETRY_SLEEP_SECS));
        assert_eq!(engine.platform.failures_shown, 0);
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::SlotSkipped);
    }

    #[test]
    fn test_carousel_first_slot_gets_full_retry_budget() {
        let platform = FakePlatform::with_config(STAY_FIRST_2).script(&[
            Err(FetchError::Network),
            Err(FetchError::Network),
            Err(FetchError::Network),
        ]);
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(CarouselCell::decode(engine.cell.load(), 2), CarouselCell::FirstSlotRetry(1));

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(CarouselCell::decode(engine.cell.load(), 2), CarouselCell::FirstSlotRetry(2));
        assert_eq!(engine.platform.failures_shown, 0);

        // Exhaustion surfaces the failure and moves the rotation past the
        // dead slot.
        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(CarouselCell::decode(engine.cell.load(), 2), CarouselCell::Index(1));
        assert_eq!(engine.platform.failures_shown, 1);
        assert_eq!(command.duration, SleepDuration::Seconds(ERROR_BACKOFF_SLEEP_SECS));
    }

    #[test]
    fn test_retry_batch_pins_target_to_first_slot() {
        // Slot 0 does not stay, but a pending retry must re-fetch it instead
        // of rotating on.
        let mut engine = engine(FakePlatform::with_config(ROTATING_3));
        engine.cell.store(CarouselCell::FirstSlotRetry(1).encode());

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.platform.last_url.as_ref().unwrap().as_str(), "http://f/a.png");
        assert_eq!(CarouselCell::decode(engine.cell.load(), 3), CarouselCell::Index(0));
    }

    #[test]
    fn test_schedule_blocks_timer_wake() {
        let mut platform = FakePlatform::with_config(SINGLE);
        platform.now = Some(ClockTime::new(7, 0, 0));
        let mut engine = engine(platform);
        // Only 09:00 local is enabled.
        engine.platform.config_json = r#"{"slots": [{"url": "http://f/one.png",
            "interval_minutes": 15}], "enabled_hours": 512}"#;
        engine.cell.store(1);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(command.duration, SleepDuration::Seconds(2 * 60 * 60));
        assert_eq!(engine.platform.fetch_calls, 0);
        // A blocked cycle does not touch the persisted cell.
        assert_eq!(engine.cell.load(), 1);
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::ScheduleBlocked);
    }

    #[test]
    fn test_button_wake_bypasses_schedule() {
        let mut platform = FakePlatform::with_config(
            r#"{"slots": [{"url": "http://f/one.png", "interval_minutes": 15}],
                "enabled_hours": 512}"#,
        );
        platform.now = Some(ClockTime::new(7, 0, 0));
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Button);
        assert_eq!(engine.platform.fetch_calls, 1);
    }

    #[test]
    fn test_unsynced_clock_skips_hourly_gate() {
        let platform = FakePlatform::with_config(
            r#"{"slots": [{"url": "http://f/one.png", "interval_minutes": 15}],
                "enabled_hours": 512}"#,
        );
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.platform.fetch_calls, 1);
    }

    #[test]
    fn test_matching_token_skips_fetch_on_timer() {
        let mut platform = FakePlatform::with_config(SINGLE_CHECKED);
        platform.token = Some(IntegrityToken::new("\"abc123\""));
        platform.probe = Some(Ok(IntegrityToken::new("\"abc123\"")));
        let mut engine = engine(platform);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.platform.fetch_calls, 0);
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::SkippedUnchanged);
        // Sleep is computed as if the cycle fetched normally.
        assert_eq!(command.duration, SleepDuration::Seconds(15 * 60));
    }

    #[test]
    fn test_manual_wake_fetches_despite_matching_token() {
        let mut platform = FakePlatform::with_config(SINGLE_CHECKED);
        platform.token = Some(IntegrityToken::new("\"abc123\""));
        platform.probe = Some(Ok(IntegrityToken::new("\"abc123\"")));
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Button);
        assert_eq!(engine.platform.fetch_calls, 1);
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::Refreshed);
    }

    #[test]
    fn test_token_refreshes_even_when_check_not_authorized() {
        // Carousel advancing on a timer never skips, but the probed token is
        // still persisted for the next cycle.
        let mut platform = FakePlatform::with_config(
            r#"{"slots": [
                {"url": "http://f/a.png", "interval_minutes": 5},
                {"url": "http://f/b.png", "interval_minutes": 10}
            ], "change_detection": true}"#,
        );
        platform.token = Some(IntegrityToken::new("\"old\""));
        platform.probe = Some(Ok(IntegrityToken::new("\"new\"")));
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.platform.probe_calls, 1);
        assert_eq!(engine.platform.fetch_calls, 1);
        assert_eq!(engine.platform.token.as_ref().unwrap().as_str(), "\"new\"");
    }

    #[test]
    fn test_probe_failure_falls_back_to_full_fetch() {
        let mut platform = FakePlatform::with_config(SINGLE_CHECKED);
        platform.token = Some(IntegrityToken::new("\"abc123\""));
        platform.probe = Some(Err(FetchError::Network));
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(engine.platform.fetch_calls, 1);
        assert_eq!(engine.platform.reports[0].outcome, CycleOutcome::Refreshed);
    }

    #[test]
    fn test_fetch_failure_clears_stored_token() {
        let mut platform =
            FakePlatform::with_config(SINGLE_CHECKED).script(&[Err(FetchError::Network)]);
        platform.token = Some(IntegrityToken::new("\"stale\""));
        platform.probe = Some(Err(FetchError::Network));
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Button);
        assert!(engine.platform.token.is_none());
    }

    #[test]
    fn test_drift_compensation_shortens_sleep() {
        let mut platform = FakePlatform::with_config(
            r#"{"slots": [{"url": "http://f/one.png", "interval_minutes": 1}]}"#,
        );
        platform.awake = 10;
        let mut engine = engine(platform);

        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(command.duration, SleepDuration::Seconds(50));
    }

    #[test]
    fn test_drift_compensation_floors_at_full_interval() {
        let mut platform = FakePlatform::with_config(
            r#"{"slots": [{"url": "http://f/one.png", "interval_minutes": 1}]}"#,
        );
        platform.awake = 70;
        let mut engine = engine(platform);

        // Awake longer than the 60 s target: accept the drift, sleep the
        // full interval, never zero.
        let command = engine.run_wake_cycle(WakeReason::Timer);
        assert_eq!(command.duration, SleepDuration::Seconds(60));
    }

    #[test]
    fn test_button_only_slot_suspends_indefinitely() {
        let platform = FakePlatform::with_config(
            r#"{"slots": [{"url": "http://f/one.png", "interval_minutes": 0}]}"#,
        );
        let mut engine = engine(platform);

        let command = engine.run_wake_cycle(WakeReason::Button);
        assert_eq!(command.duration, SleepDuration::ButtonOnly);
        assert!(command.arm_button);
        assert_eq!(engine.platform.reports[0].sleep_secs, None);
    }

    #[test]
    fn test_report_carries_battery_percentage() {
        let mut platform = FakePlatform::with_config(SINGLE);
        platform.battery_mv = Some(3800);
        let mut engine = engine(platform);

        engine.run_wake_cycle(WakeReason::Timer);
        let report = &engine.platform.reports[0];
        assert_eq!(report.battery_percent, Some(55));
        assert_eq!(report.wake, WakeReason::Timer);
        assert_eq!(report.mode, Some(DisplayMode::Single));
        assert_eq!(engine.platform.reports.len(), 1);
    }
}
