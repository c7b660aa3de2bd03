use std::time::Duration;

use lockstep::{ClockConfig, DEFAULT_PORT, Rational, TransportConfig};

#[derive(Debug, Clone)]
pub enum Role {
    Host { port: u16, players: usize },
    Join { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    pub compress: bool,
    pub spectator: bool,
    /// Stop after this many committed ticks.
    pub ticks: Option<u32>,
    pub speed: Rational,
    pub frame_interval: Duration,
    pub handshake_timeout: Duration,
    pub clock: ClockConfig,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Host {
                port: DEFAULT_PORT,
                players: 2,
            },
            compress: false,
            spectator: false,
            ticks: None,
            speed: Rational::ONE,
            frame_interval: Duration::from_millis(16),
            handshake_timeout: Duration::from_secs(10),
            clock: ClockConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Parses `num/den` or a plain integer.
pub fn parse_speed(text: &str) -> Result<Rational, String> {
    let (num, den) = match text.split_once('/') {
        Some((num, den)) => (num.trim(), den.trim()),
        None => (text.trim(), "1"),
    };
    let num: u32 = num.parse().map_err(|_| format!("bad numerator in {text:?}"))?;
    let den: u32 = den.parse().map_err(|_| format!("bad denominator in {text:?}"))?;
    Rational::new(num, den).ok_or_else(|| format!("zero denominator in {text:?}"))
}
