//! Bolus ticker math and the handle the command center holds while one is running.
//!
//! The tick loop itself lives in [`crate::command_center`], since each tick needs to
//! encode and write a frame through the session's codec and transport; this module
//! only has the pure per-speed timing and the state a handler needs to read or cancel
//! an in-flight bolus.

use std::time::Duration;

/// Seconds needed to deliver one unit at a given speed code.
fn seconds_per_unit(speed: u8) -> u32 {
    match speed {
        0 => 12,
        1 => 30,
        _ => 60,
    }
}

/// Full delivery duration for `amount` units at `speed`.
pub fn full_duration(amount: f64, speed: u8) -> Duration {
    Duration::from_secs_f64(amount * seconds_per_unit(speed) as f64)
}

/// Number of 500ms ticks needed to cover `duration`, rounded up so a partial final
/// tick still lands on-or-past full delivery.
pub fn total_ticks(duration: Duration, tick: Duration) -> u32 {
    let ticks = duration.as_secs_f64() / tick.as_secs_f64();
    ticks.ceil().max(1.0) as u32
}

/// State the command center holds for an in-flight bolus.
pub struct BolusTicker {
    pub handle: tokio::task::JoinHandle<()>,
    pub amount: f64,
    pub speed: u8,
    pub total_ticks: u32,
    pub tick_index: u32,
    pub current_amount: f64,
}

impl BolusTicker {
    /// `currentAmount = (tickIndex / totalTicks) * amount`, per spec §4.3.
    pub fn amount_at(tick_index: u32, total_ticks: u32, amount: f64) -> f64 {
        (tick_index as f64 / total_ticks as f64) * amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_units_at_speed_zero_is_forty_eight_ticks() {
        let duration = full_duration(2.0, 0);
        assert_eq!(duration, Duration::from_secs(24));
        assert_eq!(total_ticks(duration, Duration::from_millis(500)), 48);
    }

    #[test]
    fn amount_at_final_tick_reaches_full_amount() {
        let amount = 2.0;
        let ticks = total_ticks(full_duration(amount, 0), Duration::from_millis(500));
        assert_eq!(BolusTicker::amount_at(ticks, ticks, amount), amount);
    }
}
