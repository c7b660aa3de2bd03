use std::collections::VecDeque;

use bitflags::bitflags;

pub const MAX_PLAYERS: usize = 11;
pub const MAX_CONNECTED_PLAYERS: usize = MAX_PLAYERS + 10;
pub const MAX_TIMING_SLOTS: usize = MAX_CONNECTED_PLAYERS + 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotFlags: u8 {
        /// Someone occupies the slot. Cleared when they drop or are kicked.
        const ALLOCATED = 1 << 0;
        const SPECTATOR = 1 << 1;
        /// This process sends the time-sync messages for the slot.
        const AUTHORITATIVE = 1 << 2;
        /// A checksum from this slot disagreed with ours.
        const DESYNC = 1 << 3;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerSlot {
    pub flags: SlotFlags,
    /// Simulation time up to which this player's input is known.
    pub ack_time: u32,
    pub last_check_time: u32,
    pub last_check_crc: u16,
    pub wanted_latency: u16,
    /// Checksums for times we have not simulated yet.
    pub(crate) pending_checks: VecDeque<(u32, u16)>,
}

impl PlayerSlot {
    pub fn is_allocated(&self) -> bool {
        self.flags.contains(SlotFlags::ALLOCATED)
    }

    pub fn is_spectator(&self) -> bool {
        self.flags.contains(SlotFlags::SPECTATOR)
    }

    pub fn is_authoritative(&self) -> bool {
        self.flags.contains(SlotFlags::AUTHORITATIVE)
    }

    pub fn is_desynced(&self) -> bool {
        self.flags.contains(SlotFlags::DESYNC)
    }

    /// Whether the clock waits on this slot. The host always counts, even as
    /// a spectator.
    pub fn counts(&self, is_host: bool) -> bool {
        self.is_allocated() && (is_host || !self.is_spectator())
    }

    /// Whether this slot's checksums must match ours.
    pub fn checks_crc(&self, is_host: bool, game_ended: bool) -> bool {
        self.counts(is_host) && !game_ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(flags: SlotFlags) -> PlayerSlot {
        PlayerSlot {
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn test_exemption_rules() {
        let player = slot(SlotFlags::ALLOCATED);
        let spectator = slot(SlotFlags::ALLOCATED | SlotFlags::SPECTATOR);
        let dropped = slot(SlotFlags::SPECTATOR);

        assert!(player.counts(false));
        assert!(!spectator.counts(false));
        assert!(spectator.counts(true));
        assert!(!dropped.counts(true));

        assert!(player.checks_crc(false, false));
        assert!(!player.checks_crc(false, true));
        assert!(spectator.checks_crc(true, false));
    }

    #[test]
    fn test_timing_slot_bounds() {
        assert_eq!(MAX_CONNECTED_PLAYERS, 21);
        assert_eq!(MAX_TIMING_SLOTS, 22);
    }
}
