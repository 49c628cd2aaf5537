//! Demuxer facade: the track/packet model the playback pipeline consumes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::mkv::DemuxError;

/// Frame rate used when the container carries no usable frame duration.
pub const FALLBACK_FPS: u32 = 24;

/// BlockAddID carrying the VP8/VP9 alpha channel in WebM.
pub const ALPHA_ADD_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub has_alpha: bool,
    pub target_fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: f64,
    pub channels: u32,
    pub bit_depth: u32,
}

/// One elementary stream, discovered once when the container is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Index in track order; packets refer to tracks by this id.
    pub id: usize,
    /// Container track number.
    pub number: u64,
    pub kind: TrackKind,
    pub codec_id: String,
    /// Nominal frame duration, zero when the container does not say.
    pub default_duration_ns: u64,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl Track {
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }
}

/// Whole frames per second for a nominal frame duration, rounded down.
pub fn fps_from_frame_duration(frame_duration_ns: u64) -> u32 {
    if frame_duration_ns == 0 {
        return FALLBACK_FPS;
    }
    match (1_000_000_000 / frame_duration_ns) as u32 {
        0 => FALLBACK_FPS,
        fps => fps,
    }
}

/// A timestamped unit of compressed data for one track.
///
/// Dropping the packet releases it back to the demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub track: usize,
    pub timestamp_ns: u64,
    pub keyframe: bool,
    /// Coded sub-units ("frames-in-packet"), in decode order.
    pub frames: Vec<Bytes>,
    /// Block additions keyed by BlockAddID.
    pub additions: Vec<(u64, Bytes)>,
}

impl Packet {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn additional_data(&self, add_id: u64) -> Option<&Bytes> {
        self.additions
            .iter()
            .find(|(id, _)| *id == add_id)
            .map(|(_, data)| data)
    }
}

/// Container demultiplexer.
pub trait Demuxer {
    fn tracks(&self) -> &[Track];

    fn track(&self, id: usize) -> Option<&Track> {
        self.tracks().get(id)
    }

    fn track_count(&self) -> usize {
        self.tracks().len()
    }

    /// Stream duration, when the container records one.
    fn duration_ns(&self) -> Option<u64>;

    /// Next packet in file order, `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError>;

    /// Reposition one track. All tracks share one interleaved stream, so
    /// repositioning any track repositions the whole reader.
    fn seek_track(&mut self, track: usize, position_ns: u64) -> Result<(), DemuxError>;
}

/// First video track, if any.
pub fn first_video_track(demuxer: &dyn Demuxer) -> Option<&Track> {
    demuxer.tracks().iter().find(|t| t.is_video())
}

/// Log the stream layout: duration, then one line per track.
pub fn log_stream_info(demuxer: &dyn Demuxer) {
    match demuxer.duration_ns() {
        Some(ns) => tracing::info!(
            "Stream: {} tracks, {:.3}s",
            demuxer.track_count(),
            ns as f64 / 1e9
        ),
        None => tracing::info!("Stream: {} tracks, unknown duration", demuxer.track_count()),
    }
    for track in demuxer.tracks() {
        match (&track.video, &track.audio) {
            (Some(v), _) => tracing::info!(
                "  #{} video {}: {}x{} (display {}x{}) @ {} fps{}",
                track.id,
                track.codec_id,
                v.pixel_width,
                v.pixel_height,
                v.display_width,
                v.display_height,
                v.target_fps,
                if v.has_alpha { ", alpha" } else { "" }
            ),
            (None, Some(a)) => tracing::info!(
                "  #{} audio {}: {} Hz, {} ch, {} bit",
                track.id,
                track.codec_id,
                a.sample_rate,
                a.channels,
                a.bit_depth
            ),
            (None, None) => tracing::info!("  #{} {:?} {}", track.id, track.kind, track.codec_id),
        }
    }
}
