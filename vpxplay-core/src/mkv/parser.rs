//! Minimal EBML parsing helpers.
//!
//! Element bodies are parsed out of [`Bytes`] with the [`Buf`] cursor API; the
//! streaming side in `mkv.rs` only ever reads element headers directly from
//! the byte source.

use std::io::{self, Read};

use bytes::{Buf, Bytes};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Missing vint byte")]
    MissingVint,
    #[error("Invalid vint length")]
    InvalidVint,
    #[error("Truncated {0}")]
    Truncated(&'static str),
    #[error("Invalid {what} size: {size}")]
    InvalidSize { what: &'static str, size: u64 },
    #[error("Bad lacing: {0}")]
    Lacing(&'static str),
}

/// Size value reserved for elements of unknown length (live streams).
pub const UNKNOWN_SIZE: Option<u64> = None;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vint {
    pub length: usize,
    pub value: u64,
}

impl Vint {
    /// All value bits set means "unknown size".
    pub fn is_unknown(&self) -> bool {
        self.value == (1u64 << (7 * self.length)) - 1
    }
}

pub fn read_vint<B: Buf>(buf: &mut B) -> Result<Vint, ParseError> {
    if !buf.has_remaining() {
        return Err(ParseError::MissingVint);
    }

    let first = buf.get_u8();
    let length = vint_length(first)?;
    let mask = 0x80u8 >> (length - 1);

    let mut value = (first & !mask) as u64;
    for _ in 1..length {
        if !buf.has_remaining() {
            return Err(ParseError::Truncated("vint"));
        }
        value = (value << 8) | buf.get_u8() as u64;
    }

    Ok(Vint { length, value })
}

/// Signed vint as used by EBML lacing: stored with a bias of half the range.
pub fn read_signed_vint<B: Buf>(buf: &mut B) -> Result<i64, ParseError> {
    let vint = read_vint(buf)?;
    let bias = (1i64 << (7 * vint.length - 1)) - 1;
    Ok(vint.value as i64 - bias)
}

fn vint_length(first: u8) -> Result<usize, ParseError> {
    let length = first.leading_zeros() as usize + 1;
    if length > 8 {
        return Err(ParseError::InvalidVint);
    }
    Ok(length)
}

// ============================================================================
// Element headers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    /// Element ID with its length marker kept.
    pub id: u32,
    /// Body size, `None` for unknown-size elements.
    pub size: Option<u64>,
    /// Bytes taken by the ID and size fields.
    pub header_len: usize,
}

pub fn read_element_header<B: Buf>(buf: &mut B) -> Result<ElementHeader, ParseError> {
    if !buf.has_remaining() {
        return Err(ParseError::MissingVint);
    }
    let first = buf.get_u8();
    let id_len = vint_length(first)?;
    if id_len > 4 {
        return Err(ParseError::InvalidVint);
    }
    let mut id = first as u32;
    for _ in 1..id_len {
        if !buf.has_remaining() {
            return Err(ParseError::Truncated("element id"));
        }
        id = (id << 8) | buf.get_u8() as u32;
    }

    let size = read_vint(buf)?;
    Ok(ElementHeader {
        id,
        size: if size.is_unknown() { UNKNOWN_SIZE } else { Some(size.value) },
        header_len: id_len + size.length,
    })
}

/// Reads an element header straight from the byte source.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte.
pub fn read_element_header_from<R: Read>(reader: &mut R) -> io::Result<Option<ElementHeader>> {
    let mut first = [0u8; 1];
    loop {
        match reader.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let id_len = vint_length(first[0]).map_err(invalid_data)?;
    if id_len > 4 {
        return Err(invalid_data(ParseError::InvalidVint));
    }
    let mut id_bytes = [0u8; 4];
    id_bytes[0] = first[0];
    reader.read_exact(&mut id_bytes[1..id_len])?;
    let id = id_bytes[..id_len]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | *b as u32);

    let mut size_first = [0u8; 1];
    reader.read_exact(&mut size_first)?;
    let size_len = vint_length(size_first[0]).map_err(invalid_data)?;
    let mut size_bytes = [0u8; 8];
    size_bytes[0] = size_first[0];
    reader.read_exact(&mut size_bytes[1..size_len])?;
    let size = read_vint(&mut &size_bytes[..size_len]).map_err(invalid_data)?;

    Ok(Some(ElementHeader {
        id,
        size: if size.is_unknown() { UNKNOWN_SIZE } else { Some(size.value) },
        header_len: id_len + size_len,
    }))
}

fn invalid_data(e: ParseError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// ============================================================================
// Element values
// ============================================================================

pub fn read_uint<B: Buf>(buf: &mut B, size: u64) -> Result<u64, ParseError> {
    if size > 8 {
        return Err(ParseError::InvalidSize { what: "uint", size });
    }
    if (buf.remaining() as u64) < size {
        return Err(ParseError::Truncated("uint"));
    }
    Ok(buf.get_uint(size as usize))
}

pub fn read_float<B: Buf>(buf: &mut B, size: u64) -> Result<f64, ParseError> {
    if (buf.remaining() as u64) < size {
        return Err(ParseError::Truncated("float"));
    }
    match size {
        0 => Ok(0.0),
        4 => Ok(buf.get_f32() as f64),
        8 => Ok(buf.get_f64()),
        _ => Err(ParseError::InvalidSize { what: "float", size }),
    }
}

pub fn read_string<B: Buf>(buf: &mut B, size: u64) -> Result<String, ParseError> {
    let bytes = take_bytes(buf, size, "string")?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.trim_end_matches('\0').to_string())
}

pub fn take_bytes<B: Buf>(buf: &mut B, size: u64, what: &'static str) -> Result<Bytes, ParseError> {
    if (buf.remaining() as u64) < size {
        return Err(ParseError::Truncated(what));
    }
    Ok(buf.copy_to_bytes(size as usize))
}

// ============================================================================
// Blocks
// ============================================================================

/// Parsed (Simple)Block: header fields plus the laced frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub track_number: u64,
    pub relative_timecode: i16,
    pub flags: u8,
    pub frames: Vec<Bytes>,
}

impl Block {
    pub const FLAG_KEYFRAME: u8 = 0x80;

    pub fn is_keyframe(&self) -> bool {
        self.flags & Self::FLAG_KEYFRAME != 0
    }
}

pub fn parse_block(mut body: Bytes) -> Result<Block, ParseError> {
    let track_number = read_vint(&mut body)?.value;
    if body.remaining() < 3 {
        return Err(ParseError::Truncated("block header"));
    }
    let relative_timecode = body.get_i16();
    let flags = body.get_u8();

    let frames = match (flags >> 1) & 0x03 {
        0b00 => vec![body],
        0b01 => split_xiph(body)?,
        0b10 => split_fixed(body)?,
        _ => split_ebml(body)?,
    };

    Ok(Block {
        track_number,
        relative_timecode,
        flags,
        frames,
    })
}

fn lace_count(body: &mut Bytes) -> Result<usize, ParseError> {
    if !body.has_remaining() {
        return Err(ParseError::Truncated("lace count"));
    }
    Ok(body.get_u8() as usize + 1)
}

fn split_sizes(mut body: Bytes, sizes: &[u64]) -> Result<Vec<Bytes>, ParseError> {
    let mut frames = Vec::with_capacity(sizes.len() + 1);
    for &size in sizes {
        if size > body.remaining() as u64 {
            return Err(ParseError::Lacing("frame exceeds block"));
        }
        frames.push(body.split_to(size as usize));
    }
    frames.push(body);
    Ok(frames)
}

fn split_xiph(mut body: Bytes) -> Result<Vec<Bytes>, ParseError> {
    let count = lace_count(&mut body)?;
    let mut sizes = Vec::with_capacity(count - 1);
    for _ in 1..count {
        let mut size = 0u64;
        loop {
            if !body.has_remaining() {
                return Err(ParseError::Truncated("xiph lace size"));
            }
            let byte = body.get_u8();
            size += byte as u64;
            if byte != 0xFF {
                break;
            }
        }
        sizes.push(size);
    }
    split_sizes(body, &sizes)
}

fn split_fixed(mut body: Bytes) -> Result<Vec<Bytes>, ParseError> {
    let count = lace_count(&mut body)?;
    if body.remaining() % count != 0 {
        return Err(ParseError::Lacing("fixed lace does not divide block"));
    }
    let size = (body.remaining() / count) as u64;
    split_sizes(body, &vec![size; count - 1])
}

fn split_ebml(mut body: Bytes) -> Result<Vec<Bytes>, ParseError> {
    let count = lace_count(&mut body)?;
    let mut sizes = Vec::with_capacity(count - 1);
    if count > 1 {
        let mut size = read_vint(&mut body)?.value as i64;
        sizes.push(size as u64);
        for _ in 2..count {
            size += read_signed_vint(&mut body)?;
            if size < 0 {
                return Err(ParseError::Lacing("negative ebml lace size"));
            }
            sizes.push(size as u64);
        }
    }
    split_sizes(body, &sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_single_byte_vint() {
        let mut data = &b"\x81"[..];
        let vint = read_vint(&mut data).expect("vint");
        assert_eq!(vint.length, 1);
        assert_eq!(vint.value, 0x01);
    }

    #[test]
    fn reads_two_byte_vint() {
        let mut data = &b"\x40\x7F"[..];
        let vint = read_vint(&mut data).expect("vint");
        assert_eq!(vint.length, 2);
        assert_eq!(vint.value, 0x7F);
    }

    #[test]
    fn fails_on_truncated_vint() {
        let mut data = &b"\x40"[..];
        let err = read_vint(&mut data).unwrap_err();
        assert!(err.to_string().contains("Truncated"));
    }

    #[test]
    fn detects_unknown_size() {
        let mut data = &b"\x01\xFF\xFF\xFF\xFF\xFF\xFF\xFF"[..];
        assert!(read_vint(&mut data).unwrap().is_unknown());
        let mut data = &b"\xFF"[..];
        assert!(read_vint(&mut data).unwrap().is_unknown());
    }

    #[test]
    fn element_header_keeps_id_marker() {
        // Segment ID, unknown size
        let mut data = &b"\x18\x53\x80\x67\xFF"[..];
        let header = read_element_header(&mut data).unwrap();
        assert_eq!(header.id, 0x1853_8067);
        assert_eq!(header.size, None);
        assert_eq!(header.header_len, 5);
    }

    #[test]
    fn streaming_header_matches_buffered_header() {
        let bytes = b"\x2A\xD7\xB1\x83\x0F\x42\x40";
        let mut reader = std::io::Cursor::new(&bytes[..]);
        let header = read_element_header_from(&mut reader).unwrap().unwrap();
        assert_eq!(header.id, 0x2AD7B1);
        assert_eq!(header.size, Some(3));
        assert_eq!(read_element_header_from(&mut std::io::Cursor::new(&b""[..])).unwrap(), None);
    }

    #[test]
    fn signed_vint_is_biased() {
        // 0xBF = length 1, value 0x3F = bias -> 0
        assert_eq!(read_signed_vint(&mut &b"\xBF"[..]).unwrap(), 0);
        assert_eq!(read_signed_vint(&mut &b"\xBE"[..]).unwrap(), -1);
        assert_eq!(read_signed_vint(&mut &b"\xC0"[..]).unwrap(), 1);
    }

    #[test]
    fn reads_floats_of_both_widths() {
        let mut data = &100.5f32.to_be_bytes()[..];
        assert_eq!(read_float(&mut data, 4).unwrap(), 100.5);
        let mut data = &2.25f64.to_be_bytes()[..];
        assert_eq!(read_float(&mut data, 8).unwrap(), 2.25);
        assert!(read_float(&mut &[0u8; 3][..], 3).is_err());
    }

    #[test]
    fn parses_unlaced_simple_block() {
        let body = Bytes::from_static(b"\x81\x00\x10\x80abc");
        let block = parse_block(body).unwrap();
        assert_eq!(block.track_number, 1);
        assert_eq!(block.relative_timecode, 16);
        assert!(block.is_keyframe());
        assert_eq!(block.frames, vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn parses_xiph_laced_block() {
        // 3 frames: 2 bytes, 256 bytes, rest (1 byte)
        let mut raw = vec![0x82, 0x00, 0x00, 0x02, 0x02, 0x02, 0xFF, 0x01];
        raw.extend_from_slice(b"xy");
        raw.extend(std::iter::repeat(7u8).take(256));
        raw.push(b'z');
        let block = parse_block(Bytes::from(raw)).unwrap();
        assert_eq!(block.track_number, 2);
        assert_eq!(block.frames.len(), 3);
        assert_eq!(&block.frames[0][..], b"xy");
        assert_eq!(block.frames[1].len(), 256);
        assert_eq!(&block.frames[2][..], b"z");
    }

    #[test]
    fn parses_fixed_and_ebml_lacing() {
        let fixed = Bytes::from_static(b"\x81\x00\x00\x04\x01aabb");
        let block = parse_block(fixed).unwrap();
        assert_eq!(block.frames, vec![Bytes::from_static(b"aa"), Bytes::from_static(b"bb")]);

        // EBML lacing, 3 frames: 3 bytes, 3 - 1 = 2 bytes, rest
        let ebml = Bytes::from_static(b"\x81\x00\x00\x06\x02\x83\xBEabcdeXY");
        let block = parse_block(ebml).unwrap();
        assert_eq!(
            block.frames,
            vec![
                Bytes::from_static(b"abc"),
                Bytes::from_static(b"de"),
                Bytes::from_static(b"XY"),
            ]
        );
    }

    #[test]
    fn rejects_lace_larger_than_block() {
        let body = Bytes::from_static(b"\x81\x00\x00\x02\x01\x09ab");
        assert!(matches!(parse_block(body), Err(ParseError::Lacing(_))));
    }
}
