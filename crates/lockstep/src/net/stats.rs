/// Byte counters for one socket. "Raw" is what crossed the wire, the plain
/// counters are what the caller handed in or got back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub raw_bytes_sent: u64,
    pub bytes_received: u64,
    pub raw_bytes_received: u64,
}

impl TrafficStats {
    pub fn record_sent(&mut self, plain: usize, raw: usize) {
        self.bytes_sent += plain as u64;
        self.raw_bytes_sent += raw as u64;
    }

    pub fn record_received(&mut self, plain: usize, raw: usize) {
        self.bytes_received += plain as u64;
        self.raw_bytes_received += raw as u64;
    }

    /// Raw bytes per plaintext byte sent, `None` until something was sent.
    pub fn send_ratio(&self) -> Option<f32> {
        if self.bytes_sent == 0 {
            return None;
        }
        Some(self.raw_bytes_sent as f32 / self.bytes_sent as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_tracks_compression() {
        let mut stats = TrafficStats::default();
        assert_eq!(stats.send_ratio(), None);

        stats.record_sent(100, 0);
        stats.record_sent(0, 25);
        assert_eq!(stats.send_ratio(), Some(0.25));

        stats.record_received(10, 4);
        assert_eq!(stats.bytes_received, 10);
        assert_eq!(stats.raw_bytes_received, 4);
    }
}
