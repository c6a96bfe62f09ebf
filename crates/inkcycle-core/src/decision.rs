//! Per-cycle decision functions and the orchestrator that sequences them.
//!
//! Each function is pure and total: any combination of configuration, wake
//! reason, and slot index yields a decision, never an error. The ordering
//! constraint lives in [`plan_cycle`] alone — the change-check policy must be
//! evaluated against the slot index as it stood *before* any carousel
//! advance, or it reads the wrong slot's stay flag.

use crate::config::{DisplayMode, FrameConfig};
use crate::schedule::{self, ScheduleGate};
use crate::time::ClockTime;
use crate::wake::WakeReason;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetReason {
    /// Single-image mode always shows slot 0.
    SingleImage,
    /// Button wakes advance unconditionally, stay flag or not.
    ButtonAdvance,
    /// Normal carousel rotation.
    AutoAdvance,
    /// The current slot is pinned by its stay flag.
    StayOnSlot,
    /// A retry batch on slot 0 is in progress; the engine holds the target
    /// there until the budget resolves.
    RetryPinned,
}

impl TargetReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetReason::SingleImage => "single-image",
            TargetReason::ButtonAdvance => "button-advance",
            TargetReason::AutoAdvance => "auto-advance",
            TargetReason::StayOnSlot => "stay-on-slot",
            TargetReason::RetryPinned => "retry-pinned",
        }
    }
}

/// Which slot to show, and whether the persisted index moves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageTargetDecision {
    pub target_index: u8,
    pub advance: bool,
    pub reason: TargetReason,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckReason {
    /// Change detection disabled in configuration.
    DetectionOff,
    /// Manual wakes always force a full fetch.
    ManualWake,
    /// Single image on a timer wake: the canonical check case.
    TimerSingle,
    /// Carousel staying on its slot: content may well be unchanged.
    StaySlot,
    /// The displayed slot is changing, so the fetch happens regardless.
    SlotChanging,
}

impl CheckReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckReason::DetectionOff => "detection-off",
            CheckReason::ManualWake => "manual-wake",
            CheckReason::TimerSingle => "timer-single",
            CheckReason::StaySlot => "stay-slot",
            CheckReason::SlotChanging => "slot-changing",
        }
    }
}

/// Whether a matching integrity token may skip the fetch this cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChangeCheckDecision {
    pub check: bool,
    pub reason: CheckReason,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SleepDuration {
    Seconds(u32),
    /// No timer wake armed; only the button ends the sleep.
    ButtonOnly,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SleepReason {
    /// Outside the enabled hours; sleeping to the next window.
    ScheduleGap,
    /// The slot's interval is 0.
    ButtonOnly,
    /// Content matched the stored token; nothing was fetched.
    Unchanged,
    /// A fresh image was fetched and displayed.
    Updated,
}

impl SleepReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SleepReason::ScheduleGap => "schedule-gap",
            SleepReason::ButtonOnly => "button-only",
            SleepReason::Unchanged => "unchanged",
            SleepReason::Updated => "updated",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SleepDecision {
    pub duration: SleepDuration,
    pub reason: SleepReason,
}

/// Pick the slot to display.
pub fn select_image_target(
    config: &FrameConfig,
    wake: WakeReason,
    current_index: u8,
) -> ImageTargetDecision {
    let count = config.slot_count();
    let current = current_index % count;

    match config.mode() {
        DisplayMode::Single => ImageTargetDecision {
            target_index: 0,
            advance: false,
            reason: TargetReason::SingleImage,
        },
        DisplayMode::Carousel if wake.is_button() => ImageTargetDecision {
            target_index: (current + 1) % count,
            advance: true,
            reason: TargetReason::ButtonAdvance,
        },
        DisplayMode::Carousel if config.slot(current).stay => ImageTargetDecision {
            target_index: current,
            advance: false,
            reason: TargetReason::StayOnSlot,
        },
        DisplayMode::Carousel => ImageTargetDecision {
            target_index: (current + 1) % count,
            advance: true,
            reason: TargetReason::AutoAdvance,
        },
    }
}

/// Decide whether a matching integrity token may replace the fetch.
///
/// `current_index` must be the pre-advance index; see [`plan_cycle`].
pub fn change_check_policy(
    config: &FrameConfig,
    wake: WakeReason,
    current_index: u8,
) -> ChangeCheckDecision {
    if !config.change_detection {
        return ChangeCheckDecision { check: false, reason: CheckReason::DetectionOff };
    }

    match config.mode() {
        DisplayMode::Single => {
            if wake == WakeReason::Timer {
                ChangeCheckDecision { check: true, reason: CheckReason::TimerSingle }
            } else {
                ChangeCheckDecision { check: false, reason: CheckReason::ManualWake }
            }
        }
        DisplayMode::Carousel => {
            let current = current_index % config.slot_count();
            if wake.is_button() {
                ChangeCheckDecision { check: false, reason: CheckReason::ManualWake }
            } else if config.slot(current).stay {
                ChangeCheckDecision { check: true, reason: CheckReason::StaySlot }
            } else {
                ChangeCheckDecision { check: false, reason: CheckReason::SlotChanging }
            }
        }
    }
}

/// Pick the sleep duration for the end of the cycle.
///
/// The schedule wins outright over the slot interval, even a button-only
/// interval of 0. `slot_index` is the pre-advance index: the slot whose
/// cadence governed this cycle also paces the next one.
pub fn select_sleep_duration(
    config: &FrameConfig,
    now: Option<ClockTime>,
    slot_index: u8,
    check_matched: bool,
) -> SleepDecision {
    if let Some(now) = now {
        if let ScheduleGate::SleepMinutes(minutes) =
            schedule::next_allowed_window(now, config.tz_offset_hours, config.enabled_hours)
        {
            return SleepDecision {
                duration: SleepDuration::Seconds(minutes * 60),
                reason: SleepReason::ScheduleGap,
            };
        }
    }

    let interval = config.slot(slot_index).interval_minutes;
    if interval == 0 {
        return SleepDecision {
            duration: SleepDuration::ButtonOnly,
            reason: SleepReason::ButtonOnly,
        };
    }

    SleepDecision {
        duration: SleepDuration::Seconds(u32::from(interval) * 60),
        reason: if check_matched { SleepReason::Unchanged } else { SleepReason::Updated },
    }
}

/// One cycle's worth of decisions, sequenced safely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CyclePlan {
    pub target: ImageTargetDecision,
    pub change_check: ChangeCheckDecision,
    /// Index to persist on success.
    pub final_index: u8,
    /// Index the change-check policy was evaluated against (pre-advance).
    pub checked_index: u8,
}

/// Compute the image target, then the post-advance index, then the
/// change-check policy — in that order, with the policy reading the
/// *original* index. Evaluating it against the advanced index would test the
/// wrong slot's stay flag on every auto-advancing transition.
pub fn plan_cycle(config: &FrameConfig, wake: WakeReason, current_index: u8) -> CyclePlan {
    let current = current_index % config.slot_count();
    let target = select_image_target(config, wake, current);
    let final_index = if target.advance { target.target_index } else { current };
    let change_check = change_check_policy(config, wake, current);

    CyclePlan { target, change_check, final_index, checked_index: current }
}
