//! Dynamic worker count adjustment
//!
//! The governor compares aggregated worker statistics of the most
//! recent window against the previous window and nudges the active
//! worker count by at most one per decision.

/// Aggregated statistics over one decision window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    /// Number of workers which failed at least once in the window
    pub failed_workers: usize,
    /// Highest number of concurrently sleeping workers seen
    pub high_water_sleeping: usize,
    /// Average backoff sleep duration in the window
    pub avg_backoff_secs: f64,
    /// Successful attempts as a percentage of all attempts
    pub success_pct: f64,
    /// Seconds spent sleeping per successful attempt
    pub sleep_secs_per_success: f64,
}

/// Decides the active worker count, one step at a time
///
/// A decision is only made against a previous window and identical
/// windows never cause a change. After any change the following
/// window is skipped so that the statistics can stabilize.
#[derive(Debug, Default)]
pub struct Governor {
    previous: Option<WindowStats>,
    skip_next: bool,
}

impl Governor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the latest window and return the new active count
    pub fn adjust(&mut self, current_active: usize, max: usize, window: WindowStats) -> usize {
        let previous = match self.previous.replace(window) {
            Some(previous) => previous,
            None => return current_active,
        };

        if self.skip_next {
            self.skip_next = false;
            return current_active;
        }

        let adjusted = self.decide(current_active, max, &previous, &window);
        if adjusted != current_active {
            self.skip_next = true;
        }
        adjusted
    }

    fn decide(
        &self,
        current_active: usize,
        max: usize,
        previous: &WindowStats,
        window: &WindowStats,
    ) -> usize {
        let decreased = current_active.saturating_sub(1).max(1);
        let increased = (current_active + 1).min(max);

        if window.failed_workers > previous.failed_workers {
            return decreased;
        }

        if window.high_water_sleeping > previous.high_water_sleeping {
            return decreased;
        }

        if window.avg_backoff_secs > previous.avg_backoff_secs {
            return decreased;
        }

        if current_active < max && window.success_pct > previous.success_pct {
            return increased;
        }

        if current_active < max && window.sleep_secs_per_success < previous.sleep_secs_per_success {
            return increased;
        }

        current_active
    }

    /// Forget all windows, e.g. when a new batch of work starts
    pub fn reset(&mut self) {
        self.previous = None;
        self.skip_next = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm() -> WindowStats {
        WindowStats {
            failed_workers: 0,
            high_water_sleeping: 0,
            avg_backoff_secs: 0.0,
            success_pct: 100.0,
            sleep_secs_per_success: 0.0,
        }
    }

    #[test]
    fn the_first_window_never_adjusts() {
        let mut governor = Governor::new();
        assert_eq!(governor.adjust(2, 4, calm()), 2);
    }

    #[test]
    fn identical_windows_cause_no_change() {
        let mut governor = Governor::new();
        governor.adjust(2, 4, calm());
        assert_eq!(governor.adjust(2, 4, calm()), 2);
        assert_eq!(governor.adjust(2, 4, calm()), 2);
    }

    #[test]
    fn more_failed_workers_decrease_the_count() {
        let mut governor = Governor::new();
        governor.adjust(3, 4, calm());
        let window = WindowStats {
            failed_workers: 2,
            ..calm()
        };
        assert_eq!(governor.adjust(3, 4, window), 2);
    }

    #[test]
    fn the_count_never_drops_below_one() {
        let mut governor = Governor::new();
        governor.adjust(1, 4, calm());
        let window = WindowStats {
            failed_workers: 2,
            ..calm()
        };
        assert_eq!(governor.adjust(1, 4, window), 1);
    }

    #[test]
    fn rising_success_percentage_increases_the_count() {
        let mut governor = Governor::new();
        governor.adjust(
            2,
            4,
            WindowStats {
                success_pct: 80.0,
                ..calm()
            },
        );
        assert_eq!(
            governor.adjust(
                2,
                4,
                WindowStats {
                    success_pct: 90.0,
                    ..calm()
                }
            ),
            3
        );
    }

    #[test]
    fn the_count_never_exceeds_the_maximum() {
        let mut governor = Governor::new();
        governor.adjust(
            4,
            4,
            WindowStats {
                success_pct: 80.0,
                ..calm()
            },
        );
        assert_eq!(
            governor.adjust(
                4,
                4,
                WindowStats {
                    success_pct: 90.0,
                    ..calm()
                }
            ),
            4
        );
    }

    #[test]
    fn falling_sleep_per_success_increases_the_count() {
        let mut governor = Governor::new();
        governor.adjust(
            2,
            4,
            WindowStats {
                sleep_secs_per_success: 4.0,
                ..calm()
            },
        );
        assert_eq!(
            governor.adjust(
                2,
                4,
                WindowStats {
                    sleep_secs_per_success: 2.0,
                    ..calm()
                }
            ),
            3
        );
    }

    #[test]
    fn failures_take_priority_over_improvements() {
        let mut governor = Governor::new();
        governor.adjust(
            2,
            4,
            WindowStats {
                success_pct: 80.0,
                ..calm()
            },
        );
        let window = WindowStats {
            failed_workers: 1,
            success_pct: 90.0,
            ..calm()
        };
        assert_eq!(governor.adjust(2, 4, window), 1);
    }

    #[test]
    fn the_window_after_a_change_is_skipped() {
        let mut governor = Governor::new();
        governor.adjust(
            2,
            4,
            WindowStats {
                success_pct: 80.0,
                ..calm()
            },
        );
        assert_eq!(
            governor.adjust(
                2,
                4,
                WindowStats {
                    success_pct: 90.0,
                    ..calm()
                }
            ),
            3
        );
        // Even better statistics right after a change do nothing
        assert_eq!(
            governor.adjust(
                3,
                4,
                WindowStats {
                    success_pct: 99.0,
                    ..calm()
                }
            ),
            3
        );
        // The window after the skipped one is evaluated again
        assert_eq!(
            governor.adjust(
                3,
                4,
                WindowStats {
                    success_pct: 100.0,
                    ..calm()
                }
            ),
            4
        );
    }
}
