use super::config::LatencyPolicy;

/// Agreed input latency, smoothed and snapped to whole ticks.
#[derive(Debug, Clone)]
pub struct LatencyNegotiator {
    policy: LatencyPolicy,
    tick_size: u32,
    chosen: u32,
    discrete: u32,
    wanted: u16,
}

impl LatencyNegotiator {
    pub fn new(policy: LatencyPolicy, tick_size: u32) -> Self {
        let mut negotiator = Self {
            policy,
            tick_size: tick_size.max(1),
            chosen: 0,
            discrete: 0,
            wanted: 0,
        };
        negotiator.reset();
        negotiator
    }

    pub fn reset(&mut self) {
        self.chosen = self.tick_size;
        self.discrete = self.tick_size;
        self.wanted = u16::try_from(self.tick_size).unwrap_or(u16::MAX);
    }

    /// Moves toward the largest latency anyone asked for. `ready_time` and
    /// `wanted_time` are the wall-clock times at which the tick could run and
    /// at which it was due; waiting makes us ask for more next time.
    pub fn step(&mut self, max_wanted: u32, ready_time: u64, wanted_time: u64) {
        let policy = &self.policy;
        let lower = self.chosen.saturating_sub(policy.max_decrease);
        let upper = self.chosen.saturating_add(policy.max_increase);
        self.chosen = max_wanted.clamp(lower, upper);

        let ticks = (self.chosen + self.tick_size / 2) / self.tick_size;
        self.discrete = ticks.clamp(policy.min_ticks, policy.max_ticks) * self.tick_size;

        let waited = ready_time as i64 - wanted_time as i64;
        let wanted = self.discrete as i64 + waited + policy.wanted_buffer as i64;
        self.wanted = wanted.clamp(0, u16::MAX as i64) as u16;
    }

    pub fn chosen(&self) -> u32 {
        self.chosen
    }

    /// Always a whole number of ticks.
    pub fn discrete(&self) -> u32 {
        self.discrete
    }

    pub fn ticks(&self) -> u32 {
        self.discrete / self.tick_size
    }

    /// What we advertise in our next time-sync message.
    pub fn wanted(&self) -> u16 {
        self.wanted
    }
}
