use super::slots::MAX_TIMING_SLOTS;

/// Simulation time units per second.
pub const GAME_TICKS_PER_SEC: u32 = 1000;
/// Simulation time units per tick.
pub const GAME_TICKS_PER_UPDATE: u32 = 100;

/// Exact speed multiplier for presentation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    num: u32,
    den: u32,
}

impl Rational {
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    /// `None` for a zero denominator.
    pub fn new(num: u32, den: u32) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Some(Self { num, den })
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn den(&self) -> u32 {
        self.den
    }

    pub fn as_f32(&self) -> f32 {
        self.num as f32 / self.den as f32
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::ONE
    }
}

/// Tuning for latency negotiation. All values are simulation time units.
#[derive(Debug, Clone)]
pub struct LatencyPolicy {
    pub max_decrease: u32,
    pub max_increase: u32,
    /// Added to the advertised latency on top of the measured need.
    pub wanted_buffer: u32,
    pub min_ticks: u32,
    pub max_ticks: u32,
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self {
            max_decrease: 5,
            max_increase: 60,
            wanted_buffer: 10,
            min_ticks: 1,
            max_ticks: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub tick_size: u32,
    pub units_per_sec: u32,
    pub latency: LatencyPolicy,
    /// A local spectator is only told it waits on someone after this long.
    pub spectator_wait_threshold_ms: u64,
    pub host_slot: usize,
    pub slots: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_size: GAME_TICKS_PER_UPDATE,
            units_per_sec: GAME_TICKS_PER_SEC,
            latency: LatencyPolicy::default(),
            spectator_wait_threshold_ms: 1000,
            host_slot: 0,
            slots: MAX_TIMING_SLOTS,
        }
    }
}
