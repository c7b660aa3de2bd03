use std::fmt::Write as _;

use crc32fast::Hasher;

pub const SYNC_HISTORY: usize = 12;

/// Mismatches after this many are still reported, but their logs are not
/// dumped again.
const MAX_DUMPS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SyncRecord {
    Text {
        function: String,
        text: String,
    },
    Value {
        function: String,
        name: String,
        value: i32,
        id: Option<i32>,
    },
    Ints {
        function: String,
        label: String,
        values: Vec<i32>,
    },
}

#[derive(Clone, Default)]
struct SyncEntry {
    time: Option<u32>,
    hasher: Hasher,
    records: Vec<SyncRecord>,
}

impl SyncEntry {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    fn render(&self) -> String {
        let time = self.time.unwrap_or(0);
        let mut out = format!(
            "===== BEGIN gameTime={time}, {} entries, CRC 0x{:08X} =====\n",
            self.records.len(),
            self.crc()
        );
        for record in &self.records {
            let _ = match record {
                SyncRecord::Text { function, text } => writeln!(out, "[{function}] {text}"),
                SyncRecord::Value {
                    function,
                    name,
                    value,
                    id: Some(id),
                } => writeln!(out, "[{function}] {id} {name} = {value}"),
                SyncRecord::Value {
                    function,
                    name,
                    value,
                    id: None,
                } => writeln!(out, "[{function}] {name} = {value}"),
                SyncRecord::Ints {
                    function,
                    label,
                    values,
                } => writeln!(out, "[{function}] {label} {values:?}"),
            };
        }
        let _ = writeln!(
            out,
            "===== END gameTime={time}, {} entries, CRC 0x{:08X} =====",
            self.records.len(),
            self.crc()
        );
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCheck {
    Match,
    Mismatch,
    /// The time is no longer (or never was) in the history.
    Unknown,
}

impl SyncCheck {
    pub fn is_ok(self) -> bool {
        self == SyncCheck::Match
    }
}

pub struct SyncLog {
    entries: Vec<SyncEntry>,
    next: usize,
    /// CRC of the last mismatched entry, kept after its log is dumped and
    /// erased so the remaining peers can still be compared.
    backup: Option<(u32, u32)>,
    dumps: u32,
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncLog {
    pub fn new() -> Self {
        Self {
            entries: vec![SyncEntry::default(); SYNC_HISTORY],
            next: 0,
            backup: None,
            dumps: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn current(&mut self) -> &mut SyncEntry {
        &mut self.entries[self.next]
    }

    pub fn record(&mut self, function: &str, text: &str) {
        let entry = self.current();
        entry.hasher.update(function.as_bytes());
        entry.hasher.update(&[0]);
        entry.hasher.update(text.as_bytes());
        entry.hasher.update(&[0]);
        entry.records.push(SyncRecord::Text {
            function: function.to_string(),
            text: text.to_string(),
        });
    }

    pub fn record_value(&mut self, function: &str, name: &str, value: i32, id: Option<i32>) {
        let entry = self.current();
        entry.hasher.update(function.as_bytes());
        entry.hasher.update(&[0]);
        entry.hasher.update(name.as_bytes());
        entry.hasher.update(&[0]);
        entry.hasher.update(&value.to_be_bytes());
        entry.records.push(SyncRecord::Value {
            function: function.to_string(),
            name: name.to_string(),
            value,
            id,
        });
    }

    pub fn record_ints(&mut self, function: &str, label: &str, values: &[i32]) {
        let entry = self.current();
        for value in values {
            entry.hasher.update(&value.to_be_bytes());
        }
        entry.records.push(SyncRecord::Ints {
            function: function.to_string(),
            label: label.to_string(),
            values: values.to_vec(),
        });
    }

    pub fn crc(&self) -> u32 {
        self.entries[self.next].crc()
    }

    pub fn pending_records(&self) -> usize {
        self.entries[self.next].records.len()
    }

    /// Closes the current entry under `time` and returns its CRC as sent on
    /// the wire.
    pub fn next_checksum(&mut self, time: u32) -> u16 {
        let crc = self.crc();
        self.current().time = Some(time);

        self.next = (self.next + 1) % SYNC_HISTORY;
        self.current().clear();

        crc as u16
    }

    fn find(&self, time: u32) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self.next)
            .find(|(_, entry)| entry.time == Some(time))
            .map(|(index, _)| index)
    }

    /// Compares a peer's CRC for `time` with ours.
    ///
    /// The first mismatch for an entry logs it (at most a couple of times per
    /// session) and erases it.
    pub fn check(&mut self, time: u32, crc: u16) -> SyncCheck {
        let Some(index) = self.find(time) else {
            if let Some((backup_time, backup_crc)) = self.backup {
                if backup_time == time {
                    return if backup_crc as u16 == crc {
                        SyncCheck::Match
                    } else {
                        SyncCheck::Mismatch
                    };
                }
            }
            log::debug!("couldn't check gameTime {time}, not in sync history");
            return SyncCheck::Unknown;
        };

        let entry = &self.entries[index];
        if entry.crc() as u16 == crc {
            return SyncCheck::Match;
        }

        log::debug!("non-matching crc for gameTime {time}");
        if self.dumps < MAX_DUMPS {
            self.dumps += 1;
            log::error!("local sync log at gameTime {time}:\n{}", entry.render());
        }

        self.backup = Some((time, entry.crc()));
        self.entries[index].clear();
        SyncCheck::Mismatch
    }

    pub fn dump(&self, time: u32) -> Option<String> {
        self.find(time).map(|index| self.entries[index].render())
    }
}

impl std::fmt::Debug for SyncLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLog")
            .field("next", &self.next)
            .field("dumps", &self.dumps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn played(log: &mut SyncLog, time: u32, seed: i32) -> u16 {
        log.record("moveUnit", &format!("unit {seed} moved"));
        log.record_value("damage", "hp", 100 - seed, Some(seed));
        log.record_ints("rng", "state", &[seed, seed * 3]);
        log.next_checksum(time)
    }

    #[test]
    fn test_identical_histories_match() {
        let mut ours = SyncLog::new();
        let mut theirs = SyncLog::new();
        for tick in 1..=5 {
            played(&mut ours, tick * 100, tick as i32);
            let crc = played(&mut theirs, tick * 100, tick as i32);
            assert_eq!(ours.check(tick * 100, crc), SyncCheck::Match);
        }
    }

    #[test]
    fn test_diverged_history_is_reported_and_backup_kept() {
        let mut ours = SyncLog::new();
        let mut theirs = SyncLog::new();
        let good = played(&mut ours, 100, 1);
        let bad = played(&mut theirs, 100, 2);
        assert_ne!(good, bad);

        assert_eq!(ours.check(100, bad), SyncCheck::Mismatch);
        assert!(ours.dump(100).is_none());
        // Other peers are still compared against the erased entry.
        assert_eq!(ours.check(100, good), SyncCheck::Match);
        assert_eq!(ours.check(100, bad), SyncCheck::Mismatch);
    }

    #[test]
    fn test_times_outside_history_are_unknown() {
        let mut log = SyncLog::new();
        for tick in 1..=(SYNC_HISTORY as u32 + 3) {
            played(&mut log, tick * 100, 0);
        }
        assert_eq!(log.check(100, 0), SyncCheck::Unknown);
        assert_eq!(log.check(999_999, 0), SyncCheck::Unknown);
        assert!(log.dump(SYNC_HISTORY as u32 * 100 + 300).is_some());
    }

    #[test]
    fn test_dump_lists_records() {
        let mut log = SyncLog::new();
        log.record("spawn", "tank at 3,4");
        log.record_value("research", "progress", 42, None);
        log.next_checksum(700);

        let text = log.dump(700).unwrap();
        assert!(text.starts_with("===== BEGIN gameTime=700, 2 entries"));
        assert!(text.contains("[spawn] tank at 3,4\n"));
        assert!(text.contains("[research] progress = 42\n"));
    }

    #[test]
    fn test_empty_tick_has_stable_crc() {
        let mut a = SyncLog::new();
        let mut b = SyncLog::new();
        assert_eq!(a.next_checksum(100), b.next_checksum(100));
        assert_eq!(a.pending_records(), 0);
    }
}
