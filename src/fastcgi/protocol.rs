//! FastCGI 1.0 record codec.
//!
//! Records are an 8-byte header, up to 65535 content bytes and zero padding
//! that rounds the record to a multiple of 8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::fastcgi::FastCgiError;

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 0xffff;

pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_KEEP_CONN: u8 = 1;

/// Protocol status carried by `FCGI_END_REQUEST`.
pub const FCGI_REQUEST_COMPLETE: u8 = 0;

/// Record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, request_id: u16, content_length: usize) -> Self {
        Self {
            version: FCGI_VERSION_1,
            record_type: record_type as u8,
            request_id,
            content_length: content_length as u16,
            padding_length: padding_for(content_length),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.record_type);
        buf.put_u16(self.request_id);
        buf.put_u16(self.content_length);
        buf.put_u8(self.padding_length);
        buf.put_u8(0);
    }

    pub fn parse(raw: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: raw[0],
            record_type: raw[1],
            request_id: u16::from_be_bytes([raw[2], raw[3]]),
            content_length: u16::from_be_bytes([raw[4], raw[5]]),
            padding_length: raw[6],
        }
    }

    /// Header plus content plus padding.
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// A complete record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

/// Zero bytes needed to round `len` up to a multiple of 8.
pub fn padding_for(len: usize) -> u8 {
    ((8 - len % 8) % 8) as u8
}

fn put_record(buf: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    let header = RecordHeader::new(record_type, request_id, content.len());
    header.encode(buf);
    buf.extend_from_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
}

/// Append `content` as one or more records of `record_type`.
///
/// Content is split at [`MAX_CONTENT_LEN`]. With `allow_empty` the stream is
/// terminated by an empty record; without it, empty content emits nothing.
pub fn encode_stream(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
    allow_empty: bool,
) {
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        put_record(buf, record_type, request_id, chunk);
    }
    if allow_empty {
        put_record(buf, record_type, request_id, &[]);
    }
}

/// Body of `FCGI_BEGIN_REQUEST`: role, flags and five reserved bytes.
pub fn begin_request_body(role: u16, flags: u8) -> [u8; 8] {
    let role = role.to_be_bytes();
    [role[0], role[1], flags, 0, 0, 0, 0, 0]
}

/// Body of `FCGI_END_REQUEST`: application status, protocol status, reserved.
pub fn end_request_body(app_status: u32, protocol_status: u8) -> [u8; 8] {
    let app = app_status.to_be_bytes();
    [app[0], app[1], app[2], app[3], protocol_status, 0, 0, 0]
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len <= 127 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Encode name/value pairs for `FCGI_PARAMS`.
pub fn encode_name_values<'a, I>(pairs: I) -> BytesMut
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        put_length(&mut buf, name.len());
        put_length(&mut buf, value.len());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

fn take_length(buf: &mut &[u8]) -> Result<usize, FastCgiError> {
    let first = *buf
        .first()
        .ok_or_else(|| FastCgiError::Protocol("truncated name/value length".into()))?;
    if first & 0x80 == 0 {
        buf.advance(1);
        return Ok(first as usize);
    }
    if buf.len() < 4 {
        return Err(FastCgiError::Protocol("truncated name/value length".into()));
    }
    Ok((buf.get_u32() & 0x7fff_ffff) as usize)
}

/// Decode a `FCGI_PARAMS` payload.
pub fn decode_name_values(mut buf: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, FastCgiError> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let name_len = take_length(&mut buf)?;
        let value_len = take_length(&mut buf)?;
        if buf.len() < name_len + value_len {
            return Err(FastCgiError::Protocol("truncated name/value pair".into()));
        }
        let name = buf[..name_len].to_vec();
        let value = buf[name_len..name_len + value_len].to_vec();
        buf.advance(name_len + value_len);
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Split one complete record off the front of `buf`.
///
/// Returns `None` until the whole record, padding included, is buffered.
pub fn decode(buf: &mut BytesMut) -> Option<Record> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&buf[..HEADER_LEN]);
    let header = RecordHeader::parse(&raw);
    if buf.len() < header.record_len() {
        return None;
    }
    buf.advance(HEADER_LEN);
    let content = buf.split_to(header.content_length as usize).freeze();
    buf.advance(header.padding_length as usize);
    Some(Record { header, content })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut buf: BytesMut) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(record) = decode(&mut buf) {
            records.push(record);
        }
        assert!(buf.is_empty(), "trailing bytes after last record");
        records
    }

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        encode_stream(&mut buf, RecordType::Stdin, 0x0102, b"abc", false);
        assert_eq!(&buf[..8], &[1, 5, 1, 2, 0, 3, 5, 0]);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[8..11], b"abc");
        assert!(buf[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn payloads_survive_splitting_and_padding() {
        for len in [0usize, 1, 7, 8, 9, 65534, 65535, 65536, 70000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = BytesMut::new();
            encode_stream(&mut buf, RecordType::Stdout, 3, &payload, true);
            let records = decode_all(buf);

            let data: Vec<&Record> = records.iter().filter(|r| !r.content.is_empty()).collect();
            assert_eq!(data.len(), len.div_ceil(MAX_CONTENT_LEN), "len {}", len);
            if len > MAX_CONTENT_LEN {
                assert_eq!(data[0].content.len(), MAX_CONTENT_LEN);
            }
            for record in &records {
                let total = record.header.content_length as usize + record.header.padding_length as usize;
                assert_eq!(total % 8, 0);
                assert_eq!(record.header.request_id, 3);
            }
            assert!(records.last().is_some_and(|r| r.content.is_empty()));
            let joined: Vec<u8> = records.iter().flat_map(|r| r.content.iter().copied()).collect();
            assert_eq!(joined, payload);
        }
    }

    #[test]
    fn empty_content_without_allow_empty_emits_nothing() {
        let mut buf = BytesMut::new();
        encode_stream(&mut buf, RecordType::Stdin, 1, b"", false);
        assert!(buf.is_empty());
    }

    #[test]
    fn name_value_lengths() {
        let long = "v".repeat(200);
        let buf = encode_name_values([("A", "b"), ("LONG", long.as_str())]);
        assert_eq!(&buf[..4], &[1, 1, b'A', b'b']);
        assert_eq!(buf[4], 4);
        assert_eq!(&buf[5..9], &(200u32 | 0x8000_0000).to_be_bytes());

        let pairs = decode_name_values(&buf).unwrap();
        assert_eq!(pairs[0], (b"A".to_vec(), b"b".to_vec()));
        assert_eq!(pairs[1].1.len(), 200);
    }

    #[test]
    fn partial_records_wait_for_more_bytes() {
        let mut full = BytesMut::new();
        encode_stream(&mut full, RecordType::Stdout, 1, b"hello", false);
        let mut partial = BytesMut::from(&full[..10]);
        assert!(decode(&mut partial).is_none());
        partial.extend_from_slice(&full[10..]);
        let record = decode(&mut partial).unwrap();
        assert_eq!(&record.content[..], b"hello");
    }

    #[test]
    fn begin_request_body_layout() {
        assert_eq!(
            begin_request_body(FCGI_RESPONDER, FCGI_KEEP_CONN),
            [0, 1, 1, 0, 0, 0, 0, 0]
        );
    }
}
