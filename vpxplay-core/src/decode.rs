//! # Video Decode Module
//!
//! Codec sessions turn compressed VP8/VP9 payloads into planar YUV frames.
//!
//! A session is fed with [`CodecSession::decode`] and drained with
//! [`CodecSession::next_frame`]. Frames borrow the session's internal
//! buffers, so a frame must be released before the next decode call.

use thiserror::Error;

use crate::vpx::VpxSession;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoder library unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Decoder init failed: {0}")]
    Init(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),
}

/// Video codec types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Vp8,
    Vp9,
}

impl Codec {
    /// Map a Matroska CodecID.
    pub fn from_codec_id(codec_id: &str) -> Option<Self> {
        match codec_id {
            "V_VP8" => Some(Codec::Vp8),
            "V_VP9" => Some(Codec::Vp9),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
        }
    }
}

/// One image plane borrowed from the decoder.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    /// Bytes per row in `data`; may exceed the visible width.
    pub stride: usize,
    pub rows: usize,
}

/// A decoded 8-bit 4:2:0 picture, planes in Y, U, V order.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub planes: [Plane<'a>; 3],
}

impl DecodedFrame<'_> {
    pub fn luma(&self) -> &Plane<'_> {
        &self.planes[0]
    }
}

/// Rows in a 4:2:0 chroma plane for a picture of `height` rows.
pub fn chroma_rows(height: u32) -> usize {
    (height as usize + 1) / 2
}

/// Decoder session trait - one per elementary stream
pub trait CodecSession: Send {
    fn codec(&self) -> Codec;

    /// Decoder name for logging
    fn name(&self) -> &str;

    /// Feed one compressed payload.
    fn decode(&mut self, data: &[u8]) -> Result<(), DecodeError>;

    /// Next picture produced by the last `decode`, `None` when drained.
    fn next_frame(&mut self) -> Option<DecodedFrame<'_>>;
}

/// Open a libvpx session for a container CodecID.
pub fn open_session(codec_id: &str, threads: u32) -> Result<Box<dyn CodecSession>, DecodeError> {
    let codec = Codec::from_codec_id(codec_id)
        .ok_or_else(|| DecodeError::UnsupportedCodec(codec_id.to_string()))?;
    let session = VpxSession::open(codec, threads)?;
    tracing::info!("Opened {} decoder: {}", codec.name(), session.name());
    Ok(Box::new(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_webm_codec_ids() {
        assert_eq!(Codec::from_codec_id("V_VP8"), Some(Codec::Vp8));
        assert_eq!(Codec::from_codec_id("V_VP9"), Some(Codec::Vp9));
        assert_eq!(Codec::from_codec_id("V_AV1"), None);
        assert_eq!(Codec::from_codec_id("A_VORBIS"), None);
    }

    #[test]
    fn chroma_rows_round_up() {
        assert_eq!(chroma_rows(48), 24);
        assert_eq!(chroma_rows(49), 25);
        assert_eq!(chroma_rows(1), 1);
    }

    #[test]
    fn unknown_codec_id_is_rejected_before_loading() {
        let err = open_session("V_MPEG4/ISO/AVC", 0).err().unwrap();
        assert!(matches!(err, DecodeError::UnsupportedCodec(id) if id == "V_MPEG4/ISO/AVC"));
    }
}
