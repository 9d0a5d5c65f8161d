// packages/engine/src/wire/chunk.rs
//! CallRecordChunk payload layout
//!
//! ```text
//! chunk  = [recording id i32][record count u32] record*
//! record = [tag u8][body length u32][body]
//! enter  = [call id u64][method id u64][timestamp i64][callee obj][arg count u32][arg obj]*
//! exit   = [call id u64][thrown u8][timestamp i64][obj]
//! obj    = [length u32][encoded object]
//! ```
//!
//! A timestamp of -1 means none. A record's address is the absolute stream
//! offset of its tag byte; the reader keeps it so the full record can be
//! fetched again later without re-scanning the stream.

use crate::model::record::{CallId, EnterRecord, ExitRecord, ExitValue};
use crate::objects::{decode_object, ObjectRecord, TypeResolver};
use crate::utils::errors::{EngineError, Result};
use crate::wire::binary::{BinaryOutput, ByteReader};
use crate::wire::frame::Frame;
use bytes::Bytes;
use tracing::debug;

pub const ENTER_TAG: u8 = 1;
pub const EXIT_TAG: u8 = 2;

/// `[recording id][record count]`
pub const CHUNK_HEADER_LEN: usize = 8;

/// `[tag][body length]`
pub const RECORD_HEADER_LEN: usize = 5;

const NO_TIMESTAMP: i64 = -1;

fn encode_timestamp(ts: Option<i64>) -> i64 {
    ts.unwrap_or(NO_TIMESTAMP)
}

fn decode_timestamp(raw: i64) -> Option<i64> {
    if raw < 0 {
        None
    } else {
        Some(raw)
    }
}

/// Append an enter record; returns the number of bytes written
pub fn write_enter<O: BinaryOutput + ?Sized>(
    out: &mut O,
    call_id: CallId,
    method_id: u64,
    timestamp_nanos: Option<i64>,
    callee: &[u8],
    args: &[Vec<u8>],
) -> usize {
    let body_len = 8 + 8 + 8 + 4 + callee.len() + 4 + args.iter().map(|a| 4 + a.len()).sum::<usize>();

    out.write_u8(ENTER_TAG);
    out.write_u32(body_len as u32);
    out.write_u64(call_id.0);
    out.write_u64(method_id);
    out.write_i64(encode_timestamp(timestamp_nanos));
    out.write_blob(callee);
    out.write_u32(args.len() as u32);
    for arg in args {
        out.write_blob(arg);
    }
    RECORD_HEADER_LEN + body_len
}

/// Append an exit record; returns the number of bytes written
pub fn write_exit<O: BinaryOutput + ?Sized>(
    out: &mut O,
    call_id: CallId,
    thrown: bool,
    timestamp_nanos: Option<i64>,
    value: &[u8],
) -> usize {
    let body_len = 8 + 1 + 8 + 4 + value.len();

    out.write_u8(EXIT_TAG);
    out.write_u32(body_len as u32);
    out.write_u64(call_id.0);
    out.write_bool(thrown);
    out.write_i64(encode_timestamp(timestamp_nanos));
    out.write_blob(value);
    RECORD_HEADER_LEN + body_len
}

/// Enter record with its objects still encoded
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnter {
    pub address: u64,
    pub call_id: CallId,
    pub method_id: u64,
    pub timestamp_nanos: Option<i64>,
    pub callee: Bytes,
    pub args: Vec<Bytes>,
}

impl RawEnter {
    /// Decode the objects; each undecodable one becomes `NotRecorded`
    pub fn decode(&self, recording_id: i32, types: &dyn TypeResolver) -> EnterRecord {
        let callee = decode_or_not_recorded(&self.callee, types, self.call_id, "callee");
        let args = self
            .args
            .iter()
            .map(|arg| decode_or_not_recorded(arg, types, self.call_id, "argument"))
            .collect();
        EnterRecord {
            recording_id,
            call_id: self.call_id,
            method_id: self.method_id,
            callee,
            args,
            timestamp_nanos: self.timestamp_nanos,
        }
    }
}

/// Exit record with its object still encoded
#[derive(Debug, Clone, PartialEq)]
pub struct RawExit {
    pub address: u64,
    pub call_id: CallId,
    pub thrown: bool,
    pub timestamp_nanos: Option<i64>,
    pub value: Bytes,
}

impl RawExit {
    pub fn decode(&self, recording_id: i32, types: &dyn TypeResolver) -> ExitRecord {
        let record = decode_or_not_recorded(&self.value, types, self.call_id, "exit value");
        let value = if self.thrown {
            ExitValue::Thrown(record)
        } else {
            ExitValue::Returned(record)
        };
        ExitRecord {
            recording_id,
            call_id: self.call_id,
            value,
            timestamp_nanos: self.timestamp_nanos,
        }
    }
}

fn decode_or_not_recorded(data: &[u8], types: &dyn TypeResolver, call_id: CallId, what: &str) -> ObjectRecord {
    decode_object(data, types).unwrap_or_else(|e| {
        debug!("Undecodable {} of call {}: {}", what, call_id, e);
        ObjectRecord::NotRecorded
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Enter(RawEnter),
    Exit(RawExit),
}

impl RawRecord {
    pub fn call_id(&self) -> CallId {
        match self {
            RawRecord::Enter(enter) => enter.call_id,
            RawRecord::Exit(exit) => exit.call_id,
        }
    }

    pub fn address(&self) -> u64 {
        match self {
            RawRecord::Enter(enter) => enter.address,
            RawRecord::Exit(exit) => exit.address,
        }
    }
}

/// Parse one complete record (`[tag][len][body]`) found at `address`
pub fn parse_record(record: &Bytes, address: u64) -> Result<RawRecord> {
    let mut reader = ByteReader::new(record);
    let tag = reader.read_u8()?;
    let len = reader.read_u32()? as usize;
    if reader.remaining() < len {
        return Err(EngineError::DecodingFailed(format!(
            "Record at {} declares {} bytes, {} available",
            address,
            len,
            reader.remaining()
        )));
    }
    let body = record.slice(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len);
    parse_body(tag, &body, address)
}

fn parse_body(tag: u8, body: &Bytes, address: u64) -> Result<RawRecord> {
    let mut reader = ByteReader::new(body);
    let record = match tag {
        ENTER_TAG => {
            let call_id = CallId(reader.read_u64()?);
            let method_id = reader.read_u64()?;
            let timestamp_nanos = decode_timestamp(reader.read_i64()?);
            let callee = read_object_slice(&mut reader, body)?;
            let count = reader.read_u32()?;
            let mut args = Vec::with_capacity(count.min(256) as usize);
            for _ in 0..count {
                args.push(read_object_slice(&mut reader, body)?);
            }
            RawRecord::Enter(RawEnter {
                address,
                call_id,
                method_id,
                timestamp_nanos,
                callee,
                args,
            })
        }
        EXIT_TAG => {
            let call_id = CallId(reader.read_u64()?);
            let thrown = reader.read_bool()?;
            let timestamp_nanos = decode_timestamp(reader.read_i64()?);
            let value = read_object_slice(&mut reader, body)?;
            RawRecord::Exit(RawExit {
                address,
                call_id,
                thrown,
                timestamp_nanos,
                value,
            })
        }
        other => {
            return Err(EngineError::DecodingFailed(format!(
                "Unknown record tag {} at {}",
                other, address
            )))
        }
    };
    Ok(record)
}

fn read_object_slice(reader: &mut ByteReader<'_>, body: &Bytes) -> Result<Bytes> {
    let len = reader.read_u32()? as usize;
    let start = reader.position();
    reader.read_bytes(len)?;
    Ok(body.slice(start..start + len))
}

/// Decoded chunk header plus lazy record iteration
#[derive(Debug, Clone)]
pub struct Chunk {
    pub recording_id: i32,
    pub record_count: u32,
    payload: Bytes,
    payload_offset: u64,
}

impl Chunk {
    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut reader = ByteReader::new(&frame.payload);
        let recording_id = reader.read_i32()?;
        let record_count = reader.read_u32()?;
        Ok(Self {
            recording_id,
            record_count,
            payload: frame.payload.clone(),
            payload_offset: frame.payload_offset(),
        })
    }

    /// Records in arrival order
    ///
    /// A record whose body is malformed yields an error and iteration moves
    /// on to the next record; a record header running past the chunk ends it.
    pub fn records(&self) -> ChunkRecords<'_> {
        ChunkRecords {
            chunk: self,
            position: CHUNK_HEADER_LEN,
            done: false,
        }
    }
}

pub struct ChunkRecords<'a> {
    chunk: &'a Chunk,
    position: usize,
    done: bool,
}

impl Iterator for ChunkRecords<'_> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let payload = &self.chunk.payload;
        if self.done || self.position >= payload.len() {
            return None;
        }

        let address = self.chunk.payload_offset + self.position as u64;
        let mut reader = ByteReader::new(&payload[self.position..]);
        let header = reader.read_u8().and_then(|tag| Ok((tag, reader.read_u32()? as usize)));
        let (tag, len) = match header {
            Ok((tag, len)) if len <= reader.remaining() => (tag, len),
            Ok((_, len)) => {
                self.done = true;
                return Some(Err(EngineError::DecodingFailed(format!(
                    "Record at {} declares {} bytes past the end of its chunk",
                    address, len
                ))));
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let body_start = self.position + RECORD_HEADER_LEN;
        let body = payload.slice(body_start..body_start + len);
        self.position = body_start + len;
        Some(parse_body(tag, &body, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{BuiltinResolver, ObjectRecorderRegistry, RecorderKind, Value};
    use crate::wire::frame::{encode_frame, frames, FrameKind, FRAME_HEADER_LEN};

    fn encoded(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        ObjectRecorderRegistry::new(3).encode(value, &mut out).unwrap();
        out
    }

    fn chunk_frame(recording_id: i32, body: impl FnOnce(&mut Vec<u8>) -> u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.write_i32(recording_id);
        payload.write_u32(0);
        let count = body(&mut payload);
        payload[4..8].copy_from_slice(&count.to_le_bytes());

        let mut stream = Vec::new();
        encode_frame(FrameKind::CallRecordChunk, &payload, &mut stream);
        stream
    }

    #[test]
    fn test_records_and_addresses() {
        let stream = chunk_frame(3, |out| {
            write_enter(out, CallId(1), 7, Some(10), &[], &[encoded(&Value::from("x"))]);
            write_exit(out, CallId(1), false, None, &encoded(&Value::from("x")));
            2
        });

        let frame = frames(&stream).next().unwrap().unwrap();
        let chunk = Chunk::decode(&frame).unwrap();
        assert_eq!(chunk.recording_id, 3);
        assert_eq!(chunk.record_count, 2);

        let records: Vec<RawRecord> = chunk.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address(), (FRAME_HEADER_LEN + CHUNK_HEADER_LEN) as u64);

        let enter = match &records[0] {
            RawRecord::Enter(enter) => enter.decode(3, &BuiltinResolver),
            other => panic!("expected enter, got {:?}", other),
        };
        assert_eq!(enter.method_id, 7);
        assert_eq!(enter.timestamp_nanos, Some(10));
        assert_eq!(enter.callee, ObjectRecord::NotRecorded);
        assert_eq!(enter.args, vec![ObjectRecord::String { value: "x".into() }]);

        // a record can be parsed again from its address alone
        let address = records[1].address() as usize;
        let again = parse_record(&Bytes::copy_from_slice(&stream[address..]), address as u64).unwrap();
        assert_eq!(again, records[1]);
        match again {
            RawRecord::Exit(exit) => {
                let exit = exit.decode(3, &BuiltinResolver);
                assert_eq!(exit.value, ExitValue::Returned(ObjectRecord::String { value: "x".into() }));
                assert_eq!(exit.timestamp_nanos, None);
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_record_is_contained() {
        let stream = chunk_frame(1, |out| {
            // unknown tag with a well-formed length
            out.write_u8(9);
            out.write_u32(2);
            out.write_bytes(&[0, 0]);
            write_exit(out, CallId(4), true, None, &[]);
            2
        });

        let frame = frames(&stream).next().unwrap().unwrap();
        let chunk = Chunk::decode(&frame).unwrap();
        let records: Vec<_> = chunk.records().collect();

        assert_eq!(records.len(), 2);
        assert!(records[0].is_err());
        assert_eq!(records[1].as_ref().unwrap().call_id(), CallId(4));
    }

    #[test]
    fn test_overrunning_record_ends_iteration() {
        let stream = chunk_frame(1, |out| {
            out.write_u8(ENTER_TAG);
            out.write_u32(1000);
            1
        });

        let frame = frames(&stream).next().unwrap().unwrap();
        let records: Vec<_> = Chunk::decode(&frame).unwrap().records().collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_err());
    }

    #[test]
    fn test_undecodable_value_is_not_recorded_alone() {
        // string recorder holding invalid UTF-8
        let mut bad = vec![RecorderKind::String.id()];
        bad.extend_from_slice(&crate::model::BUILTIN_TYPES.string.id.to_le_bytes());
        bad.write_blob(&[0xff, 0xfe]);

        let stream = chunk_frame(2, |out| {
            write_enter(
                out,
                CallId(1),
                5,
                None,
                &encoded(&Value::from("ok")),
                &[encoded(&Value::from("ok")), bad.clone()],
            );
            write_exit(out, CallId(1), false, None, &bad);
            2
        });

        let frame = frames(&stream).next().unwrap().unwrap();
        let records: Vec<RawRecord> = Chunk::decode(&frame).unwrap().records().collect::<Result<_>>().unwrap();
        let (RawRecord::Enter(enter), RawRecord::Exit(exit)) = (&records[0], &records[1]) else {
            panic!("expected enter then exit, got {:?}", records);
        };

        let enter = enter.decode(2, &BuiltinResolver);
        assert_eq!(enter.callee, ObjectRecord::String { value: "ok".into() });
        assert_eq!(
            enter.args,
            vec![ObjectRecord::String { value: "ok".into() }, ObjectRecord::NotRecorded]
        );
        assert_eq!(exit.decode(2, &BuiltinResolver).value, ExitValue::Returned(ObjectRecord::NotRecorded));
    }
}
