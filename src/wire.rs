use bytes::{BufMut, BytesMut};

// Field numbers shared with the collector's schema. The envelope fields are
// varints, counters and traces are length-delimited.
const TAG_CORE: u32 = 1;
const TAG_PID: u32 = 2;
const TAG_TID: u32 = 3;
const TAG_TIMESTAMP: u32 = 4;
const TAG_COUNTERS: u32 = 5;
const TAG_TRACES: u32 = 6;

// ... and inside a counter entry.
const TAG_ENTRY_KEY: u32 = 1;
const TAG_ENTRY_VALUE: u32 = 2;

const WIRE_VARINT: u32 = 0;
const WIRE_BYTES: u32 = 2;

/// One record for the collector: the envelope, the counter values read from
/// the group, and the unwound stack (innermost frame first). A thread-exit
/// record is the same shape with everything but `tid` zeroed or empty.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Payload {
    pub core: u32,
    pub pid: u32,
    pub tid: u32,
    pub timestamp: u64,
    pub counters: Vec<(String, u64)>,
    pub traces: Vec<String>,
}

impl Payload {
    /// The degenerate record announcing that `tid` is gone.
    pub fn exit(tid: u32) -> Payload {
        Payload {
            tid,
            ..Payload::default()
        }
    }

    /// The on-wire frame: a 4-byte big-endian length followed by the encoded
    /// record. Encoding is deterministic for a given record.
    pub fn frame(&self) -> BytesMut {
        let body = self.encode();
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32_be(body.len() as u32);
        frame.extend_from_slice(&body);
        frame
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // zero-valued envelope fields are omitted and decode back to zero
        put_varint_field(&mut buf, TAG_CORE, self.core as u64);
        put_varint_field(&mut buf, TAG_PID, self.pid as u64);
        put_varint_field(&mut buf, TAG_TID, self.tid as u64);
        put_varint_field(&mut buf, TAG_TIMESTAMP, self.timestamp);

        for &(ref key, value) in &self.counters {
            let mut entry = BytesMut::new();
            put_bytes_field(&mut entry, TAG_ENTRY_KEY, key.as_bytes());
            put_varint_field(&mut entry, TAG_ENTRY_VALUE, value);
            put_bytes_field(&mut buf, TAG_COUNTERS, &entry);
        }

        for trace in &self.traces {
            put_bytes_field(&mut buf, TAG_TRACES, trace.as_bytes());
        }

        buf
    }

    /// Decode one encoded record (without the length prefix). Unknown fields
    /// are an error: both ends of this wire are pinned to the same schema.
    pub fn decode(mut body: &[u8]) -> ::std::result::Result<Payload, DecodeError> {
        let mut payload = Payload::default();

        while !body.is_empty() {
            let key = get_varint(&mut body)?;
            let (tag, wire) = ((key >> 3) as u32, (key & 0x7) as u32);

            match (tag, wire) {
                (TAG_CORE, WIRE_VARINT) => payload.core = get_varint(&mut body)? as u32,
                (TAG_PID, WIRE_VARINT) => payload.pid = get_varint(&mut body)? as u32,
                (TAG_TID, WIRE_VARINT) => payload.tid = get_varint(&mut body)? as u32,
                (TAG_TIMESTAMP, WIRE_VARINT) => payload.timestamp = get_varint(&mut body)?,
                (TAG_COUNTERS, WIRE_BYTES) => {
                    let mut entry = get_bytes(&mut body)?;
                    payload.counters.push(decode_entry(&mut entry)?);
                }
                (TAG_TRACES, WIRE_BYTES) => {
                    let raw = get_bytes(&mut body)?;
                    payload.traces.push(decode_string(raw)?);
                }
                _ => return Err(DecodeError::UnknownField { key }),
            }
        }

        Ok(payload)
    }
}

fn decode_entry(entry: &mut &[u8]) -> ::std::result::Result<(String, u64), DecodeError> {
    let mut name = String::new();
    let mut value = 0;

    while !entry.is_empty() {
        let key = get_varint(entry)?;
        match ((key >> 3) as u32, (key & 0x7) as u32) {
            (TAG_ENTRY_KEY, WIRE_BYTES) => name = decode_string(get_bytes(entry)?)?,
            (TAG_ENTRY_VALUE, WIRE_VARINT) => value = get_varint(entry)?,
            _ => return Err(DecodeError::UnknownField { key }),
        }
    }

    Ok((name, value))
}

fn decode_string(raw: &[u8]) -> ::std::result::Result<String, DecodeError> {
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::BadString)
}

fn put_varint_field(buf: &mut BytesMut, tag: u32, value: u64) {
    if value == 0 {
        return;
    }
    put_varint(buf, ((tag << 3) | WIRE_VARINT) as u64);
    put_varint(buf, value);
}

fn put_bytes_field(buf: &mut BytesMut, tag: u32, bytes: &[u8]) {
    put_varint(buf, ((tag << 3) | WIRE_BYTES) as u64);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    // a u64 varint never needs more than ten bytes
    let mut scratch = [0u8; 10];
    let mut used = 0;

    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            scratch[used] = byte;
            used += 1;
            break;
        }
        scratch[used] = byte | 0x80;
        used += 1;
    }

    buf.extend_from_slice(&scratch[..used]);
}

fn get_varint(buf: &mut &[u8]) -> ::std::result::Result<u64, DecodeError> {
    let mut value = 0u64;
    let mut shift = 0;

    loop {
        let byte = match buf.first() {
            Some(&b) => b,
            None => return Err(DecodeError::Truncated),
        };
        *buf = &buf[1..];

        if shift >= 64 {
            return Err(DecodeError::VarintTooLong);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn get_bytes<'a>(buf: &mut &'a [u8]) -> ::std::result::Result<&'a [u8], DecodeError> {
    let len = get_varint(buf)? as usize;
    if buf.len() < len {
        return Err(DecodeError::Truncated);
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    Ok(bytes)
}

#[derive(Debug, Fail, Eq, PartialEq)]
pub enum DecodeError {
    #[fail(display = "record ended in the middle of a field")]
    Truncated,
    #[fail(display = "varint ran past 64 bits")]
    VarintTooLong,
    #[fail(display = "unknown field key {}", key)]
    UnknownField { key: u64 },
    #[fail(display = "a string field held invalid utf-8")]
    BadString,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Payload {
        Payload {
            core: 3,
            pid: 4242,
            tid: 4243,
            timestamp: 1_234_567_890_123,
            counters: vec![
                ("unhalted_cycles".to_string(), 1_000_017),
                ("unhalted_reference_cycles".to_string(), 899_997),
            ],
            traces: vec![
                "busy_loop".to_string(),
                "run".to_string(),
                "main".to_string(),
            ],
        }
    }

    #[test]
    fn round_trip() {
        let payload = sample();
        let decoded = Payload::decode(&payload.encode()).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn round_trip_exit_record() {
        let exit = Payload::exit(777);
        let decoded = Payload::decode(&exit.encode()).unwrap();
        assert_eq!(decoded.tid, 777);
        assert_eq!(decoded.core, 0);
        assert_eq!(decoded.pid, 0);
        assert_eq!(decoded.timestamp, 0);
        assert!(decoded.counters.is_empty());
        assert!(decoded.traces.is_empty());
    }

    #[test]
    fn frame_carries_a_big_endian_length_prefix() {
        let payload = sample();
        let frame = payload.frame();
        let body_len = frame.len() - 4;
        let prefix = ((frame[0] as usize) << 24)
            | ((frame[1] as usize) << 16)
            | ((frame[2] as usize) << 8)
            | frame[3] as usize;
        assert_eq!(prefix, body_len);
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(sample().encode(), sample().encode());
    }

    #[test]
    fn known_bytes() {
        let payload = Payload {
            core: 1,
            pid: 2,
            tid: 3,
            timestamp: 4,
            counters: vec![("c".to_string(), 5)],
            traces: vec!["main".to_string()],
        };
        assert_eq!(
            &payload.encode()[..],
            &[
                0x08, 1, // core
                0x10, 2, // pid
                0x18, 3, // tid
                0x20, 4, // timestamp
                0x2a, 5, 0x0a, 1, b'c', 0x10, 5, // one counter entry
                0x32, 4, b'm', b'a', b'i', b'n', // one trace
            ][..]
        );
    }

    #[test]
    fn truncated_input_is_rejected() {
        let body = sample().encode();
        assert_eq!(
            Payload::decode(&body[..body.len() - 1]),
            Err(DecodeError::Truncated)
        );
    }
}
