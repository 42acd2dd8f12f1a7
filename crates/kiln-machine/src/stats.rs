use std::fmt;

/// Ticks between two firings of the periodic timer.
pub const TIMER_INTERVAL_TICKS: u64 = 100;

/// Performance counters for the simulated machine. `total_ticks` is the
/// clock every scheduling decision is stamped with.
#[derive(Debug, Default)]
pub struct Statistics {
    pub total_ticks: u64,
    pub system_ticks: u64,
    pub user_ticks: u64,
    pub idle_ticks: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, ticks: u64) {
        self.total_ticks += ticks;
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticks: total {}, system {}, user {}, idle {}",
            self.total_ticks, self.system_ticks, self.user_ticks, self.idle_ticks
        )
    }
}
