// Bilateral Firmware - Sync Frame Codec
//
// Fixed 62-byte little-endian frame:
//
//   0..2   magic 0xFE 0xFE
//   2      kind
//   3      sequence
//   4      stratum
//   5      quality
//   6..38  T1, T2, T3, T4 (u64 us each)
//   38..42 interval_ms (u32)
//   42     epoch present (0/1)
//   43     epoch generation
//   44..52 epoch_us (u64)
//   52..56 epoch period_ms (u32)
//   56..60 epoch active_ms (u32)
//   60..62 CRC-16/CCITT-FALSE over bytes 0..60, big-endian

use crate::error::TransportError;
use crate::params::MotorEpoch;

pub const FRAME_LEN: usize = 62;
pub const FRAME_MAGIC: [u8; 2] = [0xFE, 0xFE];
const CRC_OFFSET: usize = FRAME_LEN - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    HandshakeRequest,
    HandshakeReply,
    HandshakeComplete,
    Beacon,
    BeaconRequest,
    ResyncRequest,
}

impl MessageKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::HandshakeRequest => 0x01,
            Self::HandshakeReply => 0x02,
            Self::HandshakeComplete => 0x03,
            Self::Beacon => 0x04,
            Self::BeaconRequest => 0x05,
            Self::ResyncRequest => 0x06,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, TransportError> {
        Ok(match byte {
            0x01 => Self::HandshakeRequest,
            0x02 => Self::HandshakeReply,
            0x03 => Self::HandshakeComplete,
            0x04 => Self::Beacon,
            0x05 => Self::BeaconRequest,
            0x06 => Self::ResyncRequest,
            other => return Err(TransportError::UnknownKind(other)),
        })
    }
}

/// One sync message. Handshake kinds use all four timestamps; beacons only
/// carry `t1`, the SERVER's synchronized time at send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconMessage {
    pub kind: MessageKind,
    pub sequence: u8,
    pub stratum: u8,
    pub quality: u8,
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
    pub t4: u64,
    /// Sender's current beacon cadence.
    pub interval_ms: u32,
    pub epoch: Option<MotorEpoch>,
}

impl BeaconMessage {
    pub fn new(kind: MessageKind, sequence: u8) -> Self {
        Self {
            kind,
            sequence,
            stratum: 0,
            quality: 0,
            t1: 0,
            t2: 0,
            t3: 0,
            t4: 0,
            interval_ms: 0,
            epoch: None,
        }
    }

    pub fn timestamps(&self) -> ExchangeTimestamps {
        ExchangeTimestamps { t1: self.t1, t2: self.t2, t3: self.t3, t4: self.t4 }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0..2].copy_from_slice(&FRAME_MAGIC);
        buf[2] = self.kind.to_byte();
        buf[3] = self.sequence;
        buf[4] = self.stratum;
        buf[5] = self.quality;
        buf[6..14].copy_from_slice(&self.t1.to_le_bytes());
        buf[14..22].copy_from_slice(&self.t2.to_le_bytes());
        buf[22..30].copy_from_slice(&self.t3.to_le_bytes());
        buf[30..38].copy_from_slice(&self.t4.to_le_bytes());
        buf[38..42].copy_from_slice(&self.interval_ms.to_le_bytes());
        if let Some(epoch) = &self.epoch {
            buf[42] = 1;
            buf[43] = epoch.generation;
            buf[44..52].copy_from_slice(&epoch.epoch_us.to_le_bytes());
            buf[52..56].copy_from_slice(&epoch.period_ms.to_le_bytes());
            buf[56..60].copy_from_slice(&epoch.active_ms.to_le_bytes());
        }
        let crc = crc16(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        if frame.len() != FRAME_LEN {
            return Err(TransportError::Truncated { expected: FRAME_LEN, actual: frame.len() });
        }
        if frame[0..2] != FRAME_MAGIC {
            return Err(TransportError::BadMagic(u16::from_be_bytes([frame[0], frame[1]])));
        }
        let expected = u16::from_be_bytes([frame[CRC_OFFSET], frame[CRC_OFFSET + 1]]);
        let actual = crc16(&frame[..CRC_OFFSET]);
        if expected != actual {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }
        let kind = MessageKind::from_byte(frame[2])?;

        let epoch = if frame[42] != 0 {
            Some(MotorEpoch {
                generation: frame[43],
                epoch_us: read_u64(frame, 44),
                period_ms: read_u32(frame, 52),
                active_ms: read_u32(frame, 56),
            })
        } else {
            None
        };

        Ok(Self {
            kind,
            sequence: frame[3],
            stratum: frame[4],
            quality: frame[5],
            t1: read_u64(frame, 6),
            t2: read_u64(frame, 14),
            t3: read_u64(frame, 22),
            t4: read_u64(frame, 30),
            interval_ms: read_u32(frame, 38),
            epoch,
        })
    }
}

fn read_u64(frame: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(frame: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&frame[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

// ---------------------------------------------------------------------------
// Four-timestamp exchange
// ---------------------------------------------------------------------------

/// T1 origin send, T2 peer receive, T3 peer send, T4 origin receive. T1/T4
/// are on the origin's clock, T2/T3 on the peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTimestamps {
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
    pub t4: u64,
}

impl ExchangeTimestamps {
    /// Peer clock minus origin clock: `((T2 - T1) + (T3 - T4)) / 2`.
    pub fn offset_us(&self) -> i64 {
        let (t1, t2, t3, t4) = self.signed();
        ((t2 - t1) + (t3 - t4)) / 2
    }

    /// Time on the wire, excluding the peer's turnaround: `(T4 - T1) - (T3 - T2)`.
    pub fn round_trip_us(&self) -> i64 {
        let (t1, t2, t3, t4) = self.signed();
        (t4 - t1) - (t3 - t2)
    }

    fn signed(&self) -> (i64, i64, i64, i64) {
        (self.t1 as i64, self.t2 as i64, self.t3 as i64, self.t4 as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BeaconMessage {
        BeaconMessage {
            stratum: 1,
            quality: 75,
            t1: 1_000_123,
            interval_ms: 4_000,
            epoch: Some(MotorEpoch {
                epoch_us: 42_000_000,
                period_ms: 1000,
                active_ms: 500,
                generation: 3,
            }),
            ..BeaconMessage::new(MessageKind::Beacon, 254)
        }
    }

    #[test]
    fn crc_matches_ccitt_false_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn frame_survives_the_codec() {
        let msg = sample();
        let frame = msg.encode();
        assert_eq!(&frame[0..2], &FRAME_MAGIC);
        assert_eq!(BeaconMessage::decode(&frame), Ok(msg));
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut frame = sample().encode();
        frame[10] ^= 0x40;
        assert!(matches!(
            BeaconMessage::decode(&frame),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn short_frame_is_truncated() {
        let frame = sample().encode();
        assert_eq!(
            BeaconMessage::decode(&frame[..40]),
            Err(TransportError::Truncated { expected: FRAME_LEN, actual: 40 })
        );
    }

    #[test]
    fn wrong_magic_is_rejected_before_checksum() {
        let mut frame = sample().encode();
        frame[0] = 0xAB;
        assert_eq!(BeaconMessage::decode(&frame), Err(TransportError::BadMagic(0xABFE)));
    }

    #[test]
    fn unknown_kind_with_valid_checksum() {
        let mut frame = sample().encode();
        frame[2] = 0x7F;
        let crc = crc16(&frame[..CRC_OFFSET]);
        frame[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(BeaconMessage::decode(&frame), Err(TransportError::UnknownKind(0x7F)));
    }

    #[test]
    fn symmetric_latency_exchange() {
        // Peer runs 250 ms ahead, 3 ms each way, 1 ms turnaround.
        let ts = ExchangeTimestamps {
            t1: 10_000_000,
            t2: 10_253_000,
            t3: 10_254_000,
            t4: 10_007_000,
        };
        assert_eq!(ts.offset_us(), 250_000);
        assert_eq!(ts.round_trip_us(), 6_000);
    }
}
