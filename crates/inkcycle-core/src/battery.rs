//! Battery voltage to state-of-charge conversion.
//!
//! Decision-making never depends on charge; the percentage rides along in
//! every cycle report so the server can plot it.

/// Measured LiPo discharge curve, millivolts to percent. Discharge is flat
/// around the 3.7 V nominal plateau and falls off a cliff below 3.5 V, so a
/// piecewise-linear table beats a straight 3.0–4.2 V map where it matters.
const DISCHARGE_CURVE: &[(u32, u8)] = &[
    (3300, 0),
    (3500, 5),
    (3600, 13),
    (3700, 33),
    (3800, 55),
    (3900, 72),
    (4000, 85),
    (4100, 94),
    (4200, 100),
];

/// Convert a battery voltage to a 0–100 percentage, interpolating linearly
/// between curve points and clamping outside the measured range.
pub fn percentage(voltage_mv: u32) -> u8 {
    let (floor_mv, floor_pct) = DISCHARGE_CURVE[0];
    if voltage_mv <= floor_mv {
        return floor_pct;
    }

    for window in DISCHARGE_CURVE.windows(2) {
        let (lo_mv, lo_pct) = window[0];
        let (hi_mv, hi_pct) = window[1];
        if voltage_mv <= hi_mv {
            let span = hi_mv - lo_mv;
            let step = u32::from(hi_pct - lo_pct);
            return lo_pct + ((voltage_mv - lo_mv) * step / span) as u8;
        }
    }

    100
}

/// Coarse charge bands for reporting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatteryLevel {
    Critical,
    Low,
    Ok,
}

impl BatteryLevel {
    pub fn from_percentage(percent: u8) -> Self {
        match percent {
            0..=15 => BatteryLevel::Critical,
            16..=40 => BatteryLevel::Low,
            _ => BatteryLevel::Ok,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatteryLevel::Critical => "critical",
            BatteryLevel::Low => "low",
            BatteryLevel::Ok => "ok",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_clamps_at_rails() {
        assert_eq!(percentage(2500), 0);
        assert_eq!(percentage(3300), 0);
        assert_eq!(percentage(4200), 100);
        assert_eq!(percentage(4400), 100);
    }

    #[test]
    fn test_percentage_hits_curve_points() {
        assert_eq!(percentage(3700), 33);
        assert_eq!(percentage(3900), 72);
    }

    #[test]
    fn test_percentage_interpolates_between_points() {
        // Halfway between (3700, 33) and (3800, 55).
        assert_eq!(percentage(3750), 44);
    }

    #[test]
    fn test_percentage_is_monotonic() {
        let mut last = 0;
        for mv in (3200..=4300).step_by(10) {
            let pct = percentage(mv);
            assert!(pct >= last, "regression at {} mV", mv);
            last = pct;
        }
    }

    #[test]
    fn test_level_bands() {
        assert_eq!(BatteryLevel::from_percentage(0), BatteryLevel::Critical);
        assert_eq!(BatteryLevel::from_percentage(15), BatteryLevel::Critical);
        assert_eq!(BatteryLevel::from_percentage(16), BatteryLevel::Low);
        assert_eq!(BatteryLevel::from_percentage(40), BatteryLevel::Low);
        assert_eq!(BatteryLevel::from_percentage(41), BatteryLevel::Ok);
        assert_eq!(BatteryLevel::from_percentage(100), BatteryLevel::Ok);
    }
}
