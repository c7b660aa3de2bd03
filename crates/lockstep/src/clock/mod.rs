//! Lockstep game clock.
//!
//! Simulation time moves in whole ticks, and only once every player that
//! counts has told us their input up to the next tick. Presentation time
//! follows wall-clock time (scaled by the speed modifier) for smooth
//! rendering and is held back so it never passes simulation time.

mod config;
mod latency;
mod slots;
mod time_source;

pub use config::{ClockConfig, GAME_TICKS_PER_SEC, GAME_TICKS_PER_UPDATE, LatencyPolicy, Rational};
pub use latency::LatencyNegotiator;
pub use slots::{MAX_CONNECTED_PLAYERS, MAX_PLAYERS, MAX_TIMING_SLOTS, PlayerSlot, SlotFlags};
pub use time_source::{ManualTimeSource, MonotonicClock, TimeSource};

use thiserror::Error;

use crate::protocol::GameTimeMessage;
use crate::sync_log::{SyncCheck, SyncLog};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("player slot {0} out of range")]
    SlotOutOfRange(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    WaitingOnPeers,
    Advancing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitingStatus {
    pub slot: usize,
    pub since_ms: u64,
    pub waited_ms: u64,
}

pub struct LockstepClock<T: TimeSource = MonotonicClock> {
    config: ClockConfig,
    time: T,

    sim_time: u32,
    graphics_time: u32,
    delta_sim: u32,
    delta_graphics: u32,
    graphics_fraction: f32,

    /// Presentation time is `base_graphics` plus scaled wall time since
    /// `base_real`. Only rebased when the relation has to change.
    base_real: u64,
    base_graphics: u32,
    real_time: u64,
    start_real: u64,
    modifier: Rational,
    stop_count: u32,

    slots: Vec<PlayerSlot>,
    latency: LatencyNegotiator,
    wanted_time: Option<u64>,
    ready_time: Option<u64>,
    waiting_since: Option<u64>,

    desync: bool,
    game_ended: bool,
    sync_log: SyncLog,
    last_logged_time: Option<u32>,
}

impl LockstepClock<MonotonicClock> {
    pub fn with_config(config: ClockConfig) -> Self {
        Self::new(config, MonotonicClock::new())
    }
}

impl<T: TimeSource> LockstepClock<T> {
    pub fn new(config: ClockConfig, time: T) -> Self {
        let tick_size = config.tick_size.max(1);
        let config = ClockConfig { tick_size, ..config };
        let now = time.now_ms();

        let mut clock = Self {
            latency: LatencyNegotiator::new(config.latency.clone(), tick_size),
            slots: vec![PlayerSlot::default(); config.slots],
            config,
            time,
            sim_time: 0,
            graphics_time: 0,
            delta_sim: 0,
            delta_graphics: 0,
            graphics_fraction: 0.0,
            base_real: now,
            base_graphics: 0,
            real_time: now,
            start_real: now,
            modifier: Rational::ONE,
            stop_count: 0,
            wanted_time: None,
            ready_time: None,
            waiting_since: None,
            desync: false,
            game_ended: false,
            sync_log: SyncLog::new(),
            last_logged_time: None,
        };
        clock.reset(0);
        clock
    }

    /// Puts both clocks at `time` and restarts latency negotiation. Every
    /// slot is considered acknowledged for one agreed latency ahead.
    pub fn reset(&mut self, time: u32) {
        let now = self.time.now_ms();
        self.sim_time = time;
        self.graphics_time = time;
        self.delta_sim = 0;
        self.delta_graphics = 0;
        self.graphics_fraction = 0.0;
        self.base_real = now;
        self.base_graphics = time;
        self.real_time = now;
        self.start_real = now;

        self.latency.reset();
        let ack_time = time.saturating_add(self.latency.discrete());
        let wanted = self.latency.wanted();
        for slot in &mut self.slots {
            slot.ack_time = ack_time;
            slot.last_check_time = 0;
            slot.last_check_crc = 0;
            slot.wanted_latency = wanted;
            slot.pending_checks.clear();
            slot.flags.remove(SlotFlags::DESYNC);
        }

        self.wanted_time = None;
        self.ready_time = None;
        self.waiting_since = None;
        self.desync = false;
        self.sync_log.reset();
        self.last_logged_time = None;
    }

    fn rebase(&mut self, now: u64) {
        self.base_real = now;
        self.base_graphics = self.graphics_time;
    }

    /// Advances the clock for one frame. Returns true when a tick was
    /// committed; the caller then runs the tick and calls
    /// [`LockstepClock::emit_time_sync`].
    ///
    /// Without `may_advance` presentation time is held at simulation time and
    /// no tick is attempted. `force_try_tick` attempts a tick even if
    /// presentation time has not caught up yet.
    pub fn update(&mut self, may_advance: bool, force_try_tick: bool) -> bool {
        self.delta_sim = 0;
        self.delta_graphics = 0;

        let now = self.time.now_ms();
        if now < self.base_real {
            log::warn!(
                "wall clock went backwards by {} ms, rebasing",
                self.base_real - now
            );
            self.rebase(now);
        }
        self.real_time = now;

        if self.stop_count > 0 {
            self.graphics_fraction = 0.0;
            return false;
        }

        let elapsed = (now - self.base_real) as u128;
        let advance = elapsed * self.config.units_per_sec as u128 * self.modifier.num() as u128
            / (1000 * self.modifier.den() as u128);
        let tentative = (self.base_graphics as u128 + advance).min(u32::MAX as u128) as u32;

        let wants_tick = force_try_tick
            || (may_advance && (tentative > self.sim_time || self.waiting_since.is_some()));
        if wants_tick && self.wanted_time.is_none() {
            self.wanted_time = Some(now);
        }
        let ready = self.check_all_players();
        if ready && self.ready_time.is_none() {
            self.ready_time = Some(now);
        }

        if wants_tick && ready {
            self.commit_tick(now);
            self.graphics_fraction = 0.0;
            return true;
        }

        if wants_tick && self.waiting_since.is_none() {
            if let Some(slot) = self.first_unready_slot() {
                log::debug!(
                    "waiting for player {slot} at gameTime {} (ack {})",
                    self.sim_time,
                    self.slots[slot].ack_time
                );
            }
            self.waiting_since = Some(now);
        }

        let previous = self.graphics_time;
        let committed = tentative.min(self.sim_time).max(previous);
        self.graphics_time = committed;
        self.delta_graphics = committed - previous;
        if committed != tentative || self.waiting_since.is_some() {
            self.rebase(now);
        }
        self.graphics_fraction = self.delta_graphics as f32 / self.config.units_per_sec as f32;
        false
    }

    fn commit_tick(&mut self, now: u64) {
        self.sim_time = self.sim_time.saturating_add(self.config.tick_size);
        self.delta_sim = self.config.tick_size;

        let max_wanted = (0..self.slots.len())
            .filter(|&slot| self.counts(slot))
            .map(|slot| self.slots[slot].wanted_latency as u32)
            .max()
            .unwrap_or(0);
        self.latency.step(
            max_wanted,
            self.ready_time.unwrap_or(now),
            self.wanted_time.unwrap_or(now),
        );
        self.ready_time = None;
        self.wanted_time = None;

        if let Some(since) = self.waiting_since.take() {
            log::debug!("waited {} ms for other players", now.saturating_sub(since));
        }

        if self.desync {
            let times: Vec<u32> = self.slots.iter().map(|s| s.last_check_time).collect();
            let crcs: Vec<String> = self
                .slots
                .iter()
                .map(|s| format!("0x{:04X}", s.last_check_crc))
                .collect();
            log::error!(
                "synch error at gameTime {}, players {:?}: check times {:?}, crcs {:?}",
                self.sim_time,
                self.desynced_slots(),
                times,
                crcs
            );
            self.desync = false;
        }
    }

    /// Builds this tick's time-sync message for every slot we are
    /// authoritative for, and applies them to our own bookkeeping. Call once
    /// per committed tick, after the tick's simulation ran.
    pub fn emit_time_sync(&mut self) -> Vec<(usize, GameTimeMessage)> {
        let crc = self.sync_log.next_checksum(self.sim_time);
        self.last_logged_time = Some(self.sim_time);

        let msg = GameTimeMessage {
            latency_ticks: self.latency.ticks(),
            check_time: self.sim_time,
            check_crc: crc,
            wanted_latency: self.latency.wanted(),
        };

        let out: Vec<(usize, GameTimeMessage)> = (0..self.slots.len())
            .filter(|&slot| self.slots[slot].is_allocated() && self.slots[slot].is_authoritative())
            .map(|slot| (slot, msg))
            .collect();
        for (slot, msg) in &out {
            self.apply_time_sync(*slot, msg);
        }

        self.run_pending_checks();
        out
    }

    /// Feeds a peer's time-sync message for `slot`.
    pub fn receive_time_sync(
        &mut self,
        slot: usize,
        msg: &GameTimeMessage,
    ) -> Result<(), ClockError> {
        if slot >= self.slots.len() {
            return Err(ClockError::SlotOutOfRange(slot));
        }
        self.apply_time_sync(slot, msg);

        let is_host = slot == self.config.host_slot;
        if !self.slots[slot].checks_crc(is_host, self.game_ended) {
            return Ok(());
        }

        if self.last_logged_time.is_some_and(|logged| msg.check_time <= logged) {
            self.check_crc(slot, msg.check_time, msg.check_crc);
        } else {
            self.slots[slot]
                .pending_checks
                .push_back((msg.check_time, msg.check_crc));
        }
        Ok(())
    }

    fn apply_time_sync(&mut self, slot: usize, msg: &GameTimeMessage) {
        let latency = msg.latency_ticks.saturating_mul(self.config.tick_size);
        let entry = &mut self.slots[slot];
        entry.ack_time = msg.check_time.saturating_add(latency);
        entry.last_check_time = msg.check_time;
        entry.last_check_crc = msg.check_crc;
        entry.wanted_latency = msg.wanted_latency;
    }

    fn run_pending_checks(&mut self) {
        let Some(logged) = self.last_logged_time else {
            return;
        };
        for slot in 0..self.slots.len() {
            while let Some(&(time, crc)) = self.slots[slot].pending_checks.front() {
                if time > logged {
                    break;
                }
                self.slots[slot].pending_checks.pop_front();
                self.check_crc(slot, time, crc);
            }
        }
    }

    fn check_crc(&mut self, slot: usize, time: u32, crc: u16) {
        let result = self.sync_log.check(time, crc);
        if result == SyncCheck::Match {
            return;
        }
        log::warn!("player {slot} checksum for gameTime {time} failed: {result:?}");
        self.desync = true;
        self.slots[slot].flags.insert(SlotFlags::DESYNC);
    }

    fn counts(&self, slot: usize) -> bool {
        self.slots[slot].counts(slot == self.config.host_slot)
    }

    /// True when `slot` does not hold up the next tick.
    pub fn check_player(&self, slot: usize) -> bool {
        if slot >= self.slots.len() || !self.counts(slot) {
            return true;
        }
        let next = self.sim_time.saturating_add(self.config.tick_size);
        self.slots[slot].ack_time >= next
    }

    pub fn check_all_players(&self) -> bool {
        (0..self.slots.len()).all(|slot| self.check_player(slot))
    }

    fn first_unready_slot(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&slot| !self.check_player(slot))
    }

    pub fn set_player_ack_time(&mut self, slot: usize, time: u32) -> Result<(), ClockError> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(ClockError::SlotOutOfRange(slot))?;
        entry.ack_time = time;
        Ok(())
    }

    pub fn set_slot_flags(&mut self, slot: usize, flags: SlotFlags) -> Result<(), ClockError> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(ClockError::SlotOutOfRange(slot))?;
        entry.flags = flags;
        Ok(())
    }

    /// The player left or was kicked; nobody waits on the slot any more.
    pub fn drop_player(&mut self, slot: usize) -> Result<(), ClockError> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(ClockError::SlotOutOfRange(slot))?;
        entry.flags.remove(SlotFlags::ALLOCATED);
        entry.pending_checks.clear();
        log::info!("player {slot} dropped from timing");
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> Option<&PlayerSlot> {
        self.slots.get(slot)
    }

    pub fn slots(&self) -> &[PlayerSlot] {
        &self.slots
    }

    pub fn desynced_slots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&slot| self.slots[slot].is_desynced())
            .collect()
    }

    pub fn stop(&mut self) {
        self.stop_count += 1;
    }

    pub fn start(&mut self) {
        if self.stop_count == 0 {
            log::warn!("clock started while not stopped");
            return;
        }
        self.stop_count -= 1;
        if self.stop_count == 0 {
            let now = self.time.now_ms();
            self.real_time = now;
            self.rebase(now);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_count > 0
    }

    /// Changes presentation speed. Wall time since the last update is counted
    /// at the new rate.
    pub fn set_modifier(&mut self, modifier: Rational) {
        let real_time = self.real_time;
        self.rebase(real_time);
        self.modifier = modifier;
    }

    pub fn reset_modifier(&mut self) {
        self.set_modifier(Rational::ONE);
    }

    pub fn modifier(&self) -> Rational {
        self.modifier
    }

    pub fn set_game_ended(&mut self, ended: bool) {
        self.game_ended = ended;
    }

    pub fn game_ended(&self) -> bool {
        self.game_ended
    }

    pub fn state(&self) -> ClockState {
        if self.stop_count > 0 {
            ClockState::Stopped
        } else if self.waiting_since.is_some() {
            ClockState::WaitingOnPeers
        } else {
            ClockState::Advancing
        }
    }

    /// Who we are stuck on, if anyone. A local spectator is not bothered
    /// with short stalls.
    pub fn waiting_status(&self) -> Option<WaitingStatus> {
        let since = self.waiting_since?;
        let slot = self.first_unready_slot()?;
        let waited = self.real_time.saturating_sub(since);

        let local_spectator = self.slots.iter().enumerate().any(|(index, entry)| {
            entry.is_authoritative() && entry.is_spectator() && index != self.config.host_slot
        });
        if local_spectator && waited < self.config.spectator_wait_threshold_ms {
            return None;
        }

        Some(WaitingStatus {
            slot,
            since_ms: since,
            waited_ms: waited,
        })
    }

    pub fn sim_time(&self) -> u32 {
        self.sim_time
    }

    pub fn presentation_time(&self) -> u32 {
        self.graphics_time
    }

    /// Wall-clock milliseconds since the last reset.
    pub fn real_time(&self) -> u64 {
        self.real_time.saturating_sub(self.start_real)
    }

    pub fn delta_sim(&self) -> u32 {
        self.delta_sim
    }

    pub fn delta_presentation(&self) -> u32 {
        self.delta_graphics
    }

    /// Presentation delta of the last update, in seconds.
    pub fn presentation_fraction(&self) -> f32 {
        self.graphics_fraction
    }

    /// Where presentation time sits between the previous tick and the
    /// current one, in `0.0..=1.0`.
    pub fn interpolation_alpha(&self) -> f32 {
        let tick = self.config.tick_size;
        let behind = self.sim_time - self.graphics_time.min(self.sim_time);
        1.0 - (behind.min(tick) as f32 / tick as f32)
    }

    pub fn tick_size(&self) -> u32 {
        self.config.tick_size
    }

    pub fn agreed_latency(&self) -> u32 {
        self.latency.chosen()
    }

    pub fn discrete_latency(&self) -> u32 {
        self.latency.discrete()
    }

    pub fn wanted_latency(&self) -> u16 {
        self.latency.wanted()
    }

    pub fn desync(&self) -> bool {
        self.desync
    }

    pub fn sync_log(&self) -> &SyncLog {
        &self.sync_log
    }

    /// The simulation records its deterministic events here during a tick.
    pub fn sync_log_mut(&mut self) -> &mut SyncLog {
        &mut self.sync_log
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }
}
