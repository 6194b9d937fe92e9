// ABOUTME: Streaming replication wire format carried inside CopyData frames
// ABOUTME: Parses XLogData and keepalives, encodes standby status updates

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Result, SourceError};
use crate::utils::quote_literal;
use crate::wal::Lsn;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01 UTC).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
const STANDBY_STATUS_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Bounds-checked big-endian reader over one frame.
///
/// Every read past the end is a [`SourceError::Decode`] rather than a panic.
pub(crate) struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(SourceError::decode(format!(
                "truncated frame reading {}: need {} bytes at offset {}, have {}",
                what,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn i32(&mut self, what: &str) -> Result<i32> {
        let b = self.take(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i64(&mut self, what: &str) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, what)?);
        Ok(i64::from_be_bytes(raw))
    }

    pub(crate) fn u64(&mut self, what: &str) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn lsn(&mut self, what: &str) -> Result<Lsn> {
        self.u64(what).map(Lsn::new)
    }

    pub(crate) fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        self.take(len, what)
    }

    /// Null-terminated UTF-8 string.
    pub(crate) fn cstring(&mut self, what: &str) -> Result<String> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| SourceError::decode(format!("unterminated string reading {}", what)))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| SourceError::decode(format!("invalid UTF-8 in {}: {}", what, e)))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// Convert microseconds since 2000-01-01 to a UTC timestamp.
pub fn pg_timestamp_to_utc(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros.saturating_add(PG_EPOCH_OFFSET_SECS * 1_000_000);
    DateTime::<Utc>::from_timestamp_micros(unix_micros).unwrap_or(DateTime::<Utc>::default())
}

pub fn utc_to_pg_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// A server message inside the CopyBoth stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `w`: a pgoutput payload
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time: i64,
        data: Bytes,
    },
    /// `k`: server heartbeat, possibly demanding an immediate status reply
    PrimaryKeepalive {
        wal_end: Lsn,
        server_time: i64,
        reply_requested: bool,
    },
}

pub fn parse_server_message(payload: Bytes) -> Result<ServerMessage> {
    let tag = *payload
        .first()
        .ok_or_else(|| SourceError::decode("empty CopyData payload"))?;
    match tag {
        b'w' => {
            if payload.len() < XLOG_DATA_HEADER_LEN {
                return Err(SourceError::decode(format!(
                    "truncated XLogData: {} bytes, header needs {}",
                    payload.len(),
                    XLOG_DATA_HEADER_LEN
                )));
            }
            let mut reader = FrameReader::new(&payload[1..XLOG_DATA_HEADER_LEN]);
            let wal_start = reader.lsn("XLogData start")?;
            let wal_end = reader.lsn("XLogData end")?;
            let server_time = reader.i64("XLogData server time")?;
            Ok(ServerMessage::XLogData {
                wal_start,
                wal_end,
                server_time,
                data: payload.slice(XLOG_DATA_HEADER_LEN..),
            })
        }
        b'k' => {
            if payload.len() < KEEPALIVE_LEN {
                return Err(SourceError::decode(format!(
                    "truncated keepalive: {} bytes, need {}",
                    payload.len(),
                    KEEPALIVE_LEN
                )));
            }
            let mut reader = FrameReader::new(&payload[1..]);
            let wal_end = reader.lsn("keepalive end")?;
            let server_time = reader.i64("keepalive server time")?;
            let reply_requested = reader.u8("keepalive reply flag")? != 0;
            Ok(ServerMessage::PrimaryKeepalive {
                wal_end,
                server_time,
                reply_requested,
            })
        }
        other => Err(SourceError::decode(format!(
            "unknown replication message tag 0x{:02X}",
            other
        ))),
    }
}

/// Standby status update (`r`).
///
/// `confirmed` is reported as the write, flush and apply position alike: the
/// server may discard everything before it, so it must already be durable
/// downstream.
pub fn encode_standby_status(confirmed: Lsn, now: DateTime<Utc>, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(STANDBY_STATUS_LEN);
    buf.put_u8(b'r');
    buf.put_u64(confirmed.as_u64());
    buf.put_u64(confirmed.as_u64());
    buf.put_u64(confirmed.as_u64());
    buf.put_i64(utc_to_pg_timestamp(now));
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// `START_REPLICATION` command for a validated slot and publication name.
pub fn start_replication_command(slot: &str, start: Lsn, publication: &str) -> String {
    format!(
        "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names {})",
        slot,
        start,
        quote_literal(publication)
    )
}
