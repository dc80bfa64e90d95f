//! Scrape-rate governor.
//!
//! A [`Pacemaker`] keeps the rate of a repeating operation between a set
//! minimum and maximum. Within that band the exact rate depends on whether
//! the caller is eager to perform the operation: eager requests are governed
//! by "no more than max rate", lazy requests follow a "no less than min
//! rate" schedule.
//!
//! Two burst bounds complete the picture. A caller that fell behind the min
//! rate accumulates *debt* and is asked to run at the elevated max rate
//! until it catches up, limited by `debt_limit`. An eager caller may exceed
//! the max rate by at most `surplus_limit` requests; the allowance
//! replenishes while the caller runs below max rate.
//!
//! Accumulation of both quantities starts with the first call to
//! [`Pacemaker::scrape_permission`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use ratewatch_registry::clock::Clock;

/// Rate and burst bounds for a [`Pacemaker`].
#[derive(Debug, Clone)]
pub struct PacemakerConfig {
    /// Lower rate limit, in scrapes/second. Lazy callers are pulled up to it.
    pub min_rate: f64,
    /// Upper rate limit, in scrapes/second. Eager callers are held below it.
    pub max_rate: f64,
    /// Ceiling on accumulated catch-up debt, in whole scrapes. Delay beyond
    /// this is not compensated.
    pub debt_limit: u32,
    /// How many scrapes an eager caller may burst above `max_rate`. The
    /// smallest useful value is 1: the first permission is always paid out
    /// of surplus.
    pub surplus_limit: u32,
}

struct State {
    config: PacemakerConfig,
    last_update: Option<DateTime<Utc>>,
    /// How far the rate has fallen behind `min_rate`. At >= 1, even lazy
    /// callers are told to scrape.
    debt: f64,
    /// How far the rate exceeds `max_rate`. At the surplus limit, even
    /// eager callers are halted.
    surplus: f64,
}

/// Time-aware gate coupling a steady-rate floor to a burst ceiling.
pub struct Pacemaker {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Pacemaker {
    pub fn new(config: PacemakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State {
                config,
                last_update: None,
                debt: 0.0,
                surplus: 0.0,
            }),
            clock,
        }
    }

    /// Replaces `min_rate` and `debt_limit` atomically; accumulated state is
    /// preserved.
    pub fn update_rate(&self, min_rate: f64, debt_limit: u32) {
        let mut state = self.state.lock();
        state.config.min_rate = min_rate;
        state.config.debt_limit = debt_limit;
    }

    /// Tells the caller whether to run a scrape now. A `true` return counts
    /// as a performed scrape.
    ///
    /// `eager` distinguishes "I need to scrape and ask permission" from "I am
    /// merely available if pace keeping requires it".
    pub fn scrape_permission(&self, eager: bool) -> bool {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let last = state.last_update.unwrap_or(now);
        state.last_update = Some(now);
        let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;

        // Reflect the passed time on debt and surplus.
        state.debt += elapsed * state.config.min_rate;
        state.surplus -= elapsed * state.config.max_rate;

        // Debt and surplus are quantities accumulated in the past, so their
        // bounds apply before the current call is counted.
        state.debt = state.debt.min(state.config.debt_limit as f64);
        state.surplus = state.surplus.max(0.0);

        let granted = state.surplus <= state.config.surplus_limit as f64 - 1.0
            && (state.debt >= 1.0 || eager);
        if granted {
            state.debt -= 1.0;
            state.surplus += 1.0;
        }

        // With the current call reflected, apply the remaining bounds.
        state.debt = state.debt.max(0.0);
        state.surplus = state.surplus.min(state.config.surplus_limit as f64);

        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ratewatch_registry::clock::ManualClock;

    fn make_pacemaker(
        min_rate: f64,
        max_rate: f64,
        debt_limit: u32,
        surplus_limit: u32,
    ) -> (Pacemaker, Arc<ManualClock>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let pacemaker = Pacemaker::new(
            PacemakerConfig {
                min_rate,
                max_rate,
                debt_limit,
                surplus_limit,
            },
            clock.clone(),
        );
        (pacemaker, clock)
    }

    #[test]
    fn starts_with_zero_debt() {
        let (pacemaker, _) = make_pacemaker(10.0, 20.0, 200, 100);
        assert!(!pacemaker.scrape_permission(false));
    }

    #[test]
    fn starts_with_zero_surplus() {
        let (pacemaker, _) = make_pacemaker(10.0, 20.0, 2, 1);
        assert!(pacemaker.scrape_permission(true));
        assert!(!pacemaker.scrape_permission(true));
    }

    #[test]
    fn eager_burst_is_limited_by_surplus() {
        let (pacemaker, _) = make_pacemaker(2.0, 4.0, 20, 10);
        for _ in 0..10 {
            assert!(pacemaker.scrape_permission(true));
        }
        assert!(!pacemaker.scrape_permission(true));
    }

    #[test]
    fn eager_calls_follow_max_rate_once_surplus_is_exhausted() {
        let max_rate = 4.0;
        let elapsed_secs = 5;
        let expected_allowed = (max_rate as i64) * elapsed_secs;
        let surplus_limit = expected_allowed as u32 + 5;

        let (pacemaker, clock) = make_pacemaker(2.0, max_rate, 10, surplus_limit);
        for _ in 0..surplus_limit {
            assert!(pacemaker.scrape_permission(true));
        }
        assert!(!pacemaker.scrape_permission(true));

        // All subsequent allowance must come from rate, not surplus.
        clock.advance(Duration::seconds(elapsed_secs));
        for _ in 0..expected_allowed {
            assert!(pacemaker.scrape_permission(true));
        }
        assert!(!pacemaker.scrape_permission(true));
    }

    #[test]
    fn high_debt_is_still_capped_by_the_surplus_limit() {
        let surplus_limit = 10;
        let (pacemaker, clock) = make_pacemaker(5.0, 10.0, 50, surplus_limit);

        // Start the timer.
        assert!(pacemaker.scrape_permission(true));
        assert!(!pacemaker.scrape_permission(false));

        clock.advance(Duration::minutes(1));
        for _ in 0..surplus_limit {
            assert!(pacemaker.scrape_permission(true));
        }
        assert!(!pacemaker.scrape_permission(false));
    }

    #[test]
    fn lazy_calls_follow_min_rate() {
        let (pacemaker, clock) = make_pacemaker(1.5, 100.0, 100, 100);

        // Start the timer.
        assert!(pacemaker.scrape_permission(true));
        assert!(!pacemaker.scrape_permission(false));

        // 4 seconds at min rate 1.5 entitle exactly 6 lazy scrapes.
        clock.advance(Duration::seconds(4));
        for _ in 0..6 {
            assert!(pacemaker.scrape_permission(false));
        }
        assert!(!pacemaker.scrape_permission(false));
    }

    #[test]
    fn lazy_debt_is_capped_by_debt_limit() {
        let (pacemaker, clock) = make_pacemaker(2.0, 100.0, 10, 100);

        assert!(pacemaker.scrape_permission(true));
        clock.advance(Duration::seconds(60));

        // 120 scrapes of debt accrued, but only debt_limit are honored.
        for _ in 0..10 {
            assert!(pacemaker.scrape_permission(false));
        }
        assert!(!pacemaker.scrape_permission(false));
    }

    #[test]
    fn burst_then_idle_replays_debt_up_to_the_surplus_ceiling() {
        let (pacemaker, clock) = make_pacemaker(2.0, 4.0, 20, 10);
        for _ in 0..10 {
            assert!(pacemaker.scrape_permission(true));
        }
        assert!(!pacemaker.scrape_permission(true));

        // Five idle seconds accrue 10 scrapes of debt and drain the whole
        // surplus; the following burst is bounded by the surplus ceiling
        // again, not by debt.
        clock.advance(Duration::seconds(5));
        for _ in 0..10 {
            assert!(pacemaker.scrape_permission(true));
        }
        assert!(!pacemaker.scrape_permission(true));
    }

    #[test]
    fn update_rate_replaces_min_rate_and_debt_limit() {
        let (pacemaker, clock) = make_pacemaker(2.0, 100.0, 20, 100);

        assert!(pacemaker.scrape_permission(true));
        pacemaker.update_rate(5.0, 3);

        // 2 seconds at the new min rate would be 10 scrapes of debt, but the
        // new debt limit caps it at 3.
        clock.advance(Duration::seconds(2));
        for _ in 0..3 {
            assert!(pacemaker.scrape_permission(false));
        }
        assert!(!pacemaker.scrape_permission(false));
    }

    #[test]
    fn zero_rates_never_grant_lazy_calls() {
        let (pacemaker, clock) = make_pacemaker(0.0, 100.0, 0, 50);
        assert!(!pacemaker.scrape_permission(false));
        clock.advance(Duration::minutes(10));
        assert!(!pacemaker.scrape_permission(false));
    }
}
