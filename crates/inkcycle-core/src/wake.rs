//! Why the device left deep sleep.

/// Wake cause, as classified by the platform at boot.
///
/// First boots and hardware resets are treated like a button press wherever
/// schedule bypass is concerned: a human caused them, so the device should
/// respond immediately.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeReason {
    /// The deep-sleep timer expired.
    Timer,
    /// The user pressed the wake button.
    Button,
    /// Cold boot with no surviving sleep state.
    FirstBoot,
    /// Hardware reset while sleep state was still valid.
    ResetButton,
    /// The platform could not classify the wake cause.
    Unknown,
}

impl WakeReason {
    /// Only the scheduled timer is subject to the hourly update gate.
    pub fn honors_schedule(self) -> bool {
        matches!(self, WakeReason::Timer)
    }

    /// Button presses are the only wake that forces a carousel advance.
    pub fn is_button(self) -> bool {
        matches!(self, WakeReason::Button)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WakeReason::Timer => "timer",
            WakeReason::Button => "button",
            WakeReason::FirstBoot => "first-boot",
            WakeReason::ResetButton => "reset",
            WakeReason::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timer_honors_schedule() {
        assert!(WakeReason::Timer.honors_schedule());
        assert!(!WakeReason::Button.honors_schedule());
        assert!(!WakeReason::FirstBoot.honors_schedule());
        assert!(!WakeReason::ResetButton.honors_schedule());
        assert!(!WakeReason::Unknown.honors_schedule());
    }

    #[test]
    fn test_only_button_is_button() {
        assert!(WakeReason::Button.is_button());
        assert!(!WakeReason::FirstBoot.is_button());
    }
}
