//! Binary framing for the replication wire protocol (spec.md §6.1).
//!
//! Every message is a fixed header (opcode + body length) followed by a
//! body whose layout depends on the opcode. Multi-byte integers are
//! little-endian throughout; variable-length fields (keys, values) are
//! length-prefixed with a `u32`.

use crate::checkpoint::SystemEventKind;
use crate::error::{EngineError, Result};

const HEADER_LEN: usize = 5; // opcode (u8) + body length (u32)

macro_rules! opcode {
    ($($name:ident = $val:expr),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        enum Opcode {
            $($name = $val),*
        }

        impl Opcode {
            fn from_u8(b: u8) -> Result<Self> {
                match b {
                    $($val => Ok(Opcode::$name),)*
                    other => Err(EngineError::Corruption(format!(
                        "unknown DCP opcode {other}"
                    ))),
                }
            }
        }
    };
}

opcode! {
    StreamReq = 0,
    AddStreamResp = 1,
    SnapshotMarker = 2,
    Mutation = 3,
    Deletion = 4,
    StreamEnd = 5,
    SetVBucketStateMsg = 6,
    SystemEventMsg = 7,
    Noop = 8,
    BufferAck = 9,
}

/// Snapshot-marker flag bits (spec.md §6.1: memory/disk/chk/ack).
pub mod snapshot_flags {
    pub const MEMORY: u32 = 1 << 0;
    pub const DISK: u32 = 1 << 1;
    pub const CHECKPOINT: u32 = 1 << 2;
    pub const ACK_REQUIRED: u32 = 1 << 3;
}

/// `StreamEnd` flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndFlag {
    /// The stream reached `end` cleanly.
    Ok = 0,
    /// The consumer closed the stream.
    Closed = 1,
    /// The source vbucket changed state mid-stream.
    StateChanged = 2,
    /// The connection was dropped.
    Disconnected = 3,
}

impl StreamEndFlag {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Closed),
            2 => Ok(Self::StateChanged),
            3 => Ok(Self::Disconnected),
            other => Err(EngineError::Corruption(format!(
                "unknown stream-end flag {other}"
            ))),
        }
    }
}

/// A parsed DCP wire message.
#[derive(Debug, Clone)]
pub enum DcpMessage {
    /// A stream open request.
    StreamReq {
        flags: u32,
        start: i64,
        end: i64,
        vbuuid: u64,
        snap_start: i64,
        snap_end: i64,
    },
    /// Response to `StreamReq`. `status` 0 = ok, 1 = rollback (body then
    /// carries the rollback seqno in `rollback_seqno`).
    AddStreamResp { opaque: u32, status: u8, rollback_seqno: Option<i64> },
    /// Marks the start of an in-order batch of mutations.
    SnapshotMarker { start: i64, end: i64, flags: u32 },
    /// A document upsert.
    Mutation {
        key: Vec<u8>,
        value: Vec<u8>,
        cas: i64,
        by_seqno: i64,
        rev_seqno: u64,
        flags: u32,
        exptime: u32,
        lock: bool,
    },
    /// A tombstone.
    Deletion { key: Vec<u8>, cas: i64, by_seqno: i64, rev_seqno: u64 },
    /// Stream termination.
    StreamEnd { reason: StreamEndFlag },
    /// A vbucket state transition propagated down the stream.
    SetVBucketState { state: u8 },
    /// A collection lifecycle marker.
    SystemEvent {
        kind: SystemEventKind,
        vbucket: u16,
        by_seqno: i64,
        key: Vec<u8>,
        data: Vec<u8>,
    },
    /// Keepalive; the peer must reply with the same opaque.
    Noop { opaque: u32 },
    /// Flow-control acknowledgement of `bytes` consumed.
    BufferAck { bytes: u32 },
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(EngineError::Corruption("truncated DCP message body".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn system_event_kind_to_u8(kind: SystemEventKind) -> u8 {
    match kind {
        SystemEventKind::CreateCollection => 0,
        SystemEventKind::BeginDeleteCollection => 1,
        SystemEventKind::DeleteCollectionHard => 2,
        SystemEventKind::DeleteCollectionSoft => 3,
        SystemEventKind::CollectionsSeparatorChanged => 4,
    }
}

fn system_event_kind_from_u8(b: u8) -> Result<SystemEventKind> {
    match b {
        0 => Ok(SystemEventKind::CreateCollection),
        1 => Ok(SystemEventKind::BeginDeleteCollection),
        2 => Ok(SystemEventKind::DeleteCollectionHard),
        3 => Ok(SystemEventKind::DeleteCollectionSoft),
        4 => Ok(SystemEventKind::CollectionsSeparatorChanged),
        other => Err(EngineError::Corruption(format!(
            "unknown system-event kind {other}"
        ))),
    }
}

impl DcpMessage {
    fn opcode(&self) -> Opcode {
        match self {
            DcpMessage::StreamReq { .. } => Opcode::StreamReq,
            DcpMessage::AddStreamResp { .. } => Opcode::AddStreamResp,
            DcpMessage::SnapshotMarker { .. } => Opcode::SnapshotMarker,
            DcpMessage::Mutation { .. } => Opcode::Mutation,
            DcpMessage::Deletion { .. } => Opcode::Deletion,
            DcpMessage::StreamEnd { .. } => Opcode::StreamEnd,
            DcpMessage::SetVBucketState { .. } => Opcode::SetVBucketStateMsg,
            DcpMessage::SystemEvent { .. } => Opcode::SystemEventMsg,
            DcpMessage::Noop { .. } => Opcode::Noop,
            DcpMessage::BufferAck { .. } => Opcode::BufferAck,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            DcpMessage::StreamReq { flags, start, end, vbuuid, snap_start, snap_end } => {
                put_u32(out, *flags);
                put_i64(out, *start);
                put_i64(out, *end);
                put_u64(out, *vbuuid);
                put_i64(out, *snap_start);
                put_i64(out, *snap_end);
            }
            DcpMessage::AddStreamResp { opaque, status, rollback_seqno } => {
                put_u32(out, *opaque);
                out.push(*status);
                put_i64(out, rollback_seqno.unwrap_or(0));
            }
            DcpMessage::SnapshotMarker { start, end, flags } => {
                put_i64(out, *start);
                put_i64(out, *end);
                put_u32(out, *flags);
            }
            DcpMessage::Mutation { key, value, cas, by_seqno, rev_seqno, flags, exptime, lock } => {
                put_bytes(out, key);
                put_bytes(out, value);
                put_i64(out, *cas);
                put_i64(out, *by_seqno);
                put_u64(out, *rev_seqno);
                put_u32(out, *flags);
                put_u32(out, *exptime);
                out.push(*lock as u8);
            }
            DcpMessage::Deletion { key, cas, by_seqno, rev_seqno } => {
                put_bytes(out, key);
                put_i64(out, *cas);
                put_i64(out, *by_seqno);
                put_u64(out, *rev_seqno);
            }
            DcpMessage::StreamEnd { reason } => out.push(*reason as u8),
            DcpMessage::SetVBucketState { state } => out.push(*state),
            DcpMessage::SystemEvent { kind, vbucket, by_seqno, key, data } => {
                out.push(system_event_kind_to_u8(*kind));
                out.extend_from_slice(&vbucket.to_le_bytes());
                put_i64(out, *by_seqno);
                put_bytes(out, key);
                put_bytes(out, data);
            }
            DcpMessage::Noop { opaque } => put_u32(out, *opaque),
            DcpMessage::BufferAck { bytes } => put_u32(out, *bytes),
        }
    }

    /// Serializes this message as `[opcode:1][body_len:4][body]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode_body(&mut body);
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(self.opcode() as u8);
        put_u32(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
        out
    }

    /// Parses a single framed message from the front of `buf`, returning
    /// the message and the number of bytes consumed. `None` if `buf` does
    /// not yet hold a complete frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let opcode = Opcode::from_u8(buf[0])?;
        let body_len = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
        if buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }
        let mut r = Reader::new(&buf[HEADER_LEN..HEADER_LEN + body_len]);
        let msg = match opcode {
            Opcode::StreamReq => DcpMessage::StreamReq {
                flags: r.u32()?,
                start: r.i64()?,
                end: r.i64()?,
                vbuuid: r.u64()?,
                snap_start: r.i64()?,
                snap_end: r.i64()?,
            },
            Opcode::AddStreamResp => {
                let opaque = r.u32()?;
                let status = r.u8()?;
                let rollback = r.i64()?;
                DcpMessage::AddStreamResp {
                    opaque,
                    status,
                    rollback_seqno: if status == 1 { Some(rollback) } else { None },
                }
            }
            Opcode::SnapshotMarker => DcpMessage::SnapshotMarker {
                start: r.i64()?,
                end: r.i64()?,
                flags: r.u32()?,
            },
            Opcode::Mutation => DcpMessage::Mutation {
                key: r.bytes()?,
                value: r.bytes()?,
                cas: r.i64()?,
                by_seqno: r.i64()?,
                rev_seqno: r.u64()?,
                flags: r.u32()?,
                exptime: r.u32()?,
                lock: r.u8()? != 0,
            },
            Opcode::Deletion => DcpMessage::Deletion {
                key: r.bytes()?,
                cas: r.i64()?,
                by_seqno: r.i64()?,
                rev_seqno: r.u64()?,
            },
            Opcode::StreamEnd => DcpMessage::StreamEnd {
                reason: StreamEndFlag::from_u8(r.u8()?)?,
            },
            Opcode::SetVBucketStateMsg => DcpMessage::SetVBucketState { state: r.u8()? },
            Opcode::SystemEventMsg => DcpMessage::SystemEvent {
                kind: system_event_kind_from_u8(r.u8()?)?,
                vbucket: r.u16()?,
                by_seqno: r.i64()?,
                key: r.bytes()?,
                data: r.bytes()?,
            },
            Opcode::Noop => DcpMessage::Noop { opaque: r.u32()? },
            Opcode::BufferAck => DcpMessage::BufferAck { bytes: r.u32()? },
        };
        Ok(Some((msg, HEADER_LEN + body_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: DcpMessage) -> DcpMessage {
        let encoded = msg.encode();
        let (decoded, consumed) = DcpMessage::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        decoded
    }

    #[test]
    fn stream_req_round_trips() {
        let msg = DcpMessage::StreamReq {
            flags: 0,
            start: 10,
            end: i64::MAX,
            vbuuid: 42,
            snap_start: 10,
            snap_end: 10,
        };
        match round_trip(msg) {
            DcpMessage::StreamReq { vbuuid, start, .. } => {
                assert_eq!(vbuuid, 42);
                assert_eq!(start, 10);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rollback_response_carries_seqno_only_when_status_is_rollback() {
        let msg = DcpMessage::AddStreamResp { opaque: 1, status: 1, rollback_seqno: Some(77) };
        match round_trip(msg) {
            DcpMessage::AddStreamResp { rollback_seqno, .. } => assert_eq!(rollback_seqno, Some(77)),
            other => panic!("wrong variant: {other:?}"),
        }

        let msg = DcpMessage::AddStreamResp { opaque: 1, status: 0, rollback_seqno: None };
        match round_trip(msg) {
            DcpMessage::AddStreamResp { rollback_seqno, .. } => assert_eq!(rollback_seqno, None),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn mutation_round_trips_with_key_and_value() {
        let msg = DcpMessage::Mutation {
            key: b"meat::ribeye".to_vec(),
            value: b"12oz".to_vec(),
            cas: 99,
            by_seqno: 5,
            rev_seqno: 2,
            flags: 0,
            exptime: 0,
            lock: false,
        };
        match round_trip(msg) {
            DcpMessage::Mutation { key, value, cas, .. } => {
                assert_eq!(key, b"meat::ribeye");
                assert_eq!(value, b"12oz");
                assert_eq!(cas, 99);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn system_event_round_trips() {
        let msg = DcpMessage::SystemEvent {
            kind: SystemEventKind::BeginDeleteCollection,
            vbucket: 3,
            by_seqno: 9,
            key: b"$collections::delete:meat".to_vec(),
            data: 1u64.to_le_bytes().to_vec(),
        };
        match round_trip(msg) {
            DcpMessage::SystemEvent { kind, vbucket, .. } => {
                assert_eq!(kind, SystemEventKind::BeginDeleteCollection);
                assert_eq!(vbucket, 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decode_reports_incomplete_frame_as_none() {
        let msg = DcpMessage::Noop { opaque: 7 };
        let encoded = msg.encode();
        assert!(DcpMessage::decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn unknown_opcode_is_corruption() {
        let mut bad = vec![250u8];
        bad.extend_from_slice(&0u32.to_le_bytes());
        assert!(DcpMessage::decode(&bad).is_err());
    }
}
