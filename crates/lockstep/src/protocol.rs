use thiserror::Error;

// Everything on the wire is big-endian.
pub const DEFAULT_PORT: u16 = 2100;
pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;
pub const GAME_TIME_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
    #[error("bad {kind:?} payload of {len} bytes")]
    BadPayload { kind: MessageKind, len: usize },
}

/// Per-tick time-sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameTimeMessage {
    pub latency_ticks: u32,
    pub check_time: u32,
    pub check_crc: u16,
    pub wanted_latency: u16,
}

impl GameTimeMessage {
    pub fn encode(&self) -> [u8; GAME_TIME_LEN] {
        let mut out = [0u8; GAME_TIME_LEN];
        out[0..4].copy_from_slice(&self.latency_ticks.to_be_bytes());
        out[4..8].copy_from_slice(&self.check_time.to_be_bytes());
        out[8..10].copy_from_slice(&self.check_crc.to_be_bytes());
        out[10..12].copy_from_slice(&self.wanted_latency.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < GAME_TIME_LEN {
            return Err(ProtocolError::Truncated {
                needed: GAME_TIME_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            latency_ticks: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            check_time: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            check_crc: u16::from_be_bytes([data[8], data[9]]),
            wanted_latency: u16::from_be_bytes([data[10], data[11]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Join = 1,
    Welcome = 2,
    Start = 3,
    GameTime = 4,
    Leave = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageKind::Join,
            2 => MessageKind::Welcome,
            3 => MessageKind::Start,
            4 => MessageKind::GameTime,
            5 => MessageKind::Leave,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sent by a joining peer before anything else.
    Join { spectator: bool },
    /// The host's answer: the slot assigned, how many slots the match has, and
    /// whether the stream switches to compression right after this frame.
    Welcome { slot: u8, players: u8, compress: bool },
    /// Match starts. Bit `n` of `spectators` marks slot `n` as a spectator.
    Start { spectators: u32 },
    GameTime(GameTimeMessage),
    Leave,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join { .. } => MessageKind::Join,
            Message::Welcome { .. } => MessageKind::Welcome,
            Message::Start { .. } => MessageKind::Start,
            Message::GameTime(_) => MessageKind::GameTime,
            Message::Leave => MessageKind::Leave,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Message::Join { spectator } => vec![*spectator as u8],
            Message::Welcome {
                slot,
                players,
                compress,
            } => vec![*slot, *players, *compress as u8],
            Message::Start { spectators } => spectators.to_be_bytes().to_vec(),
            Message::GameTime(msg) => msg.encode().to_vec(),
            Message::Leave => Vec::new(),
        }
    }

    fn from_payload(kind: MessageKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::BadPayload {
            kind,
            len: payload.len(),
        };
        Ok(match kind {
            MessageKind::Join => match payload {
                [flag] => Message::Join {
                    spectator: *flag != 0,
                },
                _ => return Err(bad()),
            },
            MessageKind::Welcome => match payload {
                [slot, players, compress] => Message::Welcome {
                    slot: *slot,
                    players: *players,
                    compress: *compress != 0,
                },
                _ => return Err(bad()),
            },
            MessageKind::Start => {
                let bytes: [u8; 4] = payload.try_into().map_err(|_| bad())?;
                Message::Start {
                    spectators: u32::from_be_bytes(bytes),
                }
            }
            MessageKind::GameTime => {
                if payload.len() != GAME_TIME_LEN {
                    return Err(bad());
                }
                Message::GameTime(GameTimeMessage::decode(payload)?)
            }
            MessageKind::Leave => {
                if !payload.is_empty() {
                    return Err(bad());
                }
                Message::Leave
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub player: u8,
    pub message: Message,
}

impl Frame {
    pub fn new(player: u8, message: Message) -> Self {
        Self { player, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.message.payload();
        let len = u16::try_from(payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.push(self.message.kind() as u8);
        out.push(self.player);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Payload length announced by a frame header.
    pub fn payload_len(header: &[u8; FRAME_HEADER_LEN]) -> usize {
        u16::from_be_bytes([header[2], header[3]]) as usize
    }

    /// Decodes one frame from a header and its complete payload.
    pub fn decode(header: &[u8; FRAME_HEADER_LEN], payload: &[u8]) -> Result<Self, ProtocolError> {
        let kind = MessageKind::try_from(header[0])?;
        let expected = Self::payload_len(header);
        if payload.len() < expected {
            return Err(ProtocolError::Truncated {
                needed: expected,
                got: payload.len(),
            });
        }
        Ok(Self {
            player: header[1],
            message: Message::from_payload(kind, &payload[..expected])?,
        })
    }
}

/// Reassembles frames from stream reads that may split or merge them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, or `None` until more data arrives. A
    /// malformed frame is consumed before the error is returned.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some(header) = self.buf.first_chunk::<FRAME_HEADER_LEN>().copied() else {
            return Ok(None);
        };
        let total = FRAME_HEADER_LEN + Frame::payload_len(&header);
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Frame::decode(&header, &frame[FRAME_HEADER_LEN..]).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_time_layout() {
        let msg = GameTimeMessage {
            latency_ticks: 2,
            check_time: 0x0102_0304,
            check_crc: 0xBEEF,
            wanted_latency: 210,
        };
        let bytes = msg.encode();
        assert_eq!(
            bytes,
            [0, 0, 0, 2, 1, 2, 3, 4, 0xBE, 0xEF, 0, 210],
        );
        assert_eq!(GameTimeMessage::decode(&bytes), Ok(msg));
    }

    #[test]
    fn test_game_time_truncated() {
        assert_eq!(
            GameTimeMessage::decode(&[0; 11]),
            Err(ProtocolError::Truncated { needed: 12, got: 11 })
        );
    }

    #[test]
    fn test_decoder_handles_split_and_merged_frames() {
        let first = Frame::new(0, Message::Welcome { slot: 2, players: 3, compress: true });
        let second = Frame::new(
            2,
            Message::GameTime(GameTimeMessage {
                latency_ticks: 1,
                check_time: 300,
                check_crc: 7,
                wanted_latency: 110,
            }),
        );
        let third = Frame::new(1, Message::Leave);

        let mut stream = first.encode().unwrap();
        stream.extend(second.encode().unwrap());
        stream.extend(third.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames, vec![first, second, third]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_unknown_kind_is_consumed() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[99, 0, 0, 1, 0xAA]);
        decoder.push(&Frame::new(3, Message::Leave).encode().unwrap());

        assert_eq!(decoder.next_frame(), Err(ProtocolError::UnknownKind(99)));
        assert_eq!(
            decoder.next_frame(),
            Ok(Some(Frame::new(3, Message::Leave)))
        );
    }

    #[test]
    fn test_bad_payload_length() {
        let header = [MessageKind::Start as u8, 0, 0, 2];
        assert_eq!(
            Frame::decode(&header, &[0, 1]),
            Err(ProtocolError::BadPayload {
                kind: MessageKind::Start,
                len: 2
            })
        );
    }
}
