// WebM (Matroska subset) demuxer
// Streams clusters straight off a Read + Seek byte source; only the header
// elements (Info, Tracks) are buffered whole.

pub mod parser;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::demuxer::{
    fps_from_frame_duration, AudioParams, Demuxer, Packet, Track, TrackKind, VideoParams,
};
use parser::{
    parse_block, read_element_header, read_element_header_from, read_float, read_string,
    read_uint, take_bytes, Block, ElementHeader, ParseError,
};

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("Failed to open container: {0}")]
    Open(String),
    #[error("Malformed stream metadata: {0}")]
    Metadata(String),
    #[error("Corrupt element at byte {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: ParseError,
    },
    #[error("No track with id {0}")]
    UnknownTrack(usize),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Element IDs
// ============================================================================

mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x1853_8067;

    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const INFO: u32 = 0x1549_A966;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const DISPLAY_WIDTH: u32 = 0x54B0;
    pub const DISPLAY_HEIGHT: u32 = 0x54BA;
    pub const ALPHA_MODE: u32 = 0x53C0;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const REFERENCE_BLOCK: u32 = 0xFB;
    pub const BLOCK_ADDITIONS: u32 = 0x75A1;
    pub const BLOCK_MORE: u32 = 0xA6;
    pub const BLOCK_ADD_ID: u32 = 0xEE;
    pub const BLOCK_ADDITIONAL: u32 = 0xA5;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CHAPTERS: u32 = 0x1043_A770;
    pub const TAGS: u32 = 0x1254_C367;
    pub const ATTACHMENTS: u32 = 0x1941_A469;
}

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;
const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// Header elements larger than this are rejected rather than buffered.
const MAX_HEADER_ELEMENT: u64 = 16 * 1024 * 1024;
/// Same guard for a single block.
const MAX_BLOCK: u64 = 256 * 1024 * 1024;

fn is_top_level(id: u32) -> bool {
    matches!(
        id,
        ids::CLUSTER
            | ids::CUES
            | ids::TAGS
            | ids::CHAPTERS
            | ids::ATTACHMENTS
            | ids::SEEK_HEAD
            | ids::INFO
            | ids::TRACKS
    )
}

// ============================================================================
// WebM Demuxer
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ClusterCursor {
    /// Absolute end offset, `None` for unknown-size clusters.
    end: Option<u64>,
    timecode: u64,
}

pub struct WebmDemuxer<R: Read + Seek> {
    reader: R,
    doc_type: String,
    tracks: Vec<Track>,
    track_ids: HashMap<u64, usize>,
    timecode_scale: u64,
    duration_ns: Option<u64>,
    segment_end: Option<u64>,
    first_cluster: Option<u64>,
    cluster: Option<ClusterCursor>,
}

impl WebmDemuxer<BufReader<File>> {
    /// Open a WebM file from disk.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self, DemuxError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| DemuxError::Open(format!("{}: {}", path.display(), e)))?;
        Self::open(BufReader::new(file))
    }
}

impl<R: Read + Seek> WebmDemuxer<R> {
    /// Parse the EBML header, segment info and track list.
    ///
    /// The reader is left positioned at the first cluster.
    pub fn open(mut reader: R) -> Result<Self, DemuxError> {
        reader.seek(SeekFrom::Start(0))?;

        let header = read_element_header_from(&mut reader)
            .map_err(|e| DemuxError::Open(format!("Unreadable EBML header: {}", e)))?
            .ok_or_else(|| DemuxError::Open("Empty stream".into()))?;
        if header.id != ids::EBML {
            return Err(DemuxError::Open("Not an EBML file".into()));
        }
        let body = read_sized_body(&mut reader, &header, "EBML header")
            .map_err(|e| DemuxError::Open(e.to_string()))?;
        let doc_type = parse_doc_type(body)?;
        if doc_type != "webm" && doc_type != "matroska" {
            return Err(DemuxError::Open(format!("Unsupported DocType: {}", doc_type)));
        }

        let segment_end = loop {
            let header = read_element_header_from(&mut reader)?
                .ok_or_else(|| DemuxError::Open("No Segment element".into()))?;
            if header.id == ids::SEGMENT {
                let start = reader.stream_position()?;
                break header.size.map(|size| start + size);
            }
            skip_element(&mut reader, &header)
                .map_err(|_| DemuxError::Open("Unknown-size element before Segment".into()))?;
        };

        let mut demuxer = Self {
            reader,
            doc_type,
            tracks: Vec::new(),
            track_ids: HashMap::new(),
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration_ns: None,
            segment_end,
            first_cluster: None,
            cluster: None,
        };
        demuxer.parse_segment_headers()?;

        if demuxer.tracks.is_empty() {
            return Err(DemuxError::Metadata("Stream has no tracks".into()));
        }
        if let Some(pos) = demuxer.first_cluster {
            demuxer.reader.seek(SeekFrom::Start(pos))?;
        }

        tracing::debug!(
            "Opened {} stream: {} tracks, timecode scale {}",
            demuxer.doc_type,
            demuxer.tracks.len(),
            demuxer.timecode_scale
        );
        Ok(demuxer)
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn timecode_scale(&self) -> u64 {
        self.timecode_scale
    }

    /// Walk top-level segment children up to the first cluster.
    fn parse_segment_headers(&mut self) -> Result<(), DemuxError> {
        let mut duration: Option<f64> = None;
        loop {
            let pos = self.reader.stream_position()?;
            if self.segment_end.is_some_and(|end| pos >= end) {
                break;
            }
            let Some(header) = read_element_header_from(&mut self.reader)? else {
                break;
            };
            match header.id {
                ids::CLUSTER => {
                    self.first_cluster = Some(pos);
                    break;
                }
                ids::INFO => {
                    let body = read_sized_body(&mut self.reader, &header, "Info")?;
                    let (scale, raw_duration) = parse_info(body)?;
                    self.timecode_scale = scale;
                    duration = raw_duration;
                }
                ids::TRACKS => {
                    let body = read_sized_body(&mut self.reader, &header, "Tracks")?;
                    self.tracks = parse_tracks(body)?;
                }
                _ => skip_element(&mut self.reader, &header)?,
            }
        }

        if let Some(duration) = duration {
            let ns = duration * self.timecode_scale as f64;
            if !ns.is_finite() || ns < 0.0 {
                return Err(DemuxError::Metadata(format!("Invalid duration: {}", duration)));
            }
            self.duration_ns = Some(ns as u64);
        }

        self.track_ids = self.tracks.iter().map(|t| (t.number, t.id)).collect();
        Ok(())
    }

    fn block_to_packet(&self, block: Block, keyframe: bool, additions: Vec<(u64, Bytes)>, cluster_timecode: u64) -> Option<Packet> {
        let Some(&track) = self.track_ids.get(&block.track_number) else {
            tracing::trace!("Skipping block for unknown track {}", block.track_number);
            return None;
        };
        let timecode = (cluster_timecode as i64 + block.relative_timecode as i64).max(0) as u64;
        Some(Packet {
            track,
            timestamp_ns: timecode.saturating_mul(self.timecode_scale),
            keyframe: keyframe || block.is_keyframe(),
            frames: block.frames,
            additions,
        })
    }

    fn read_block_body(&mut self, header: &ElementHeader, offset: u64) -> Result<Option<Bytes>, DemuxError> {
        let size = header.size.ok_or(DemuxError::Corrupt {
            offset,
            source: ParseError::InvalidSize { what: "block", size: u64::MAX },
        })?;
        if size > MAX_BLOCK {
            return Err(DemuxError::Corrupt {
                offset,
                source: ParseError::InvalidSize { what: "block", size },
            });
        }
        let mut body = vec![0u8; size as usize];
        match self.reader.read_exact(&mut body) {
            Ok(()) => Ok(Some(Bytes::from(body))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::warn!("Truncated block at byte {}, treating as end of stream", offset);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Timecode of the cluster starting at `pos`, if it is the first child.
    fn peek_cluster_timecode(&mut self, pos: u64) -> Result<Option<(ElementHeader, u64)>, DemuxError> {
        self.reader.seek(SeekFrom::Start(pos))?;
        let Some(cluster) = read_element_header_from(&mut self.reader)? else {
            return Ok(None);
        };
        if cluster.id != ids::CLUSTER {
            return Ok(None);
        }
        let Some(child) = read_element_header_from(&mut self.reader)? else {
            return Ok(None);
        };
        if child.id != ids::TIMECODE {
            return Ok(Some((cluster, 0)));
        }
        let body = read_sized_body(&mut self.reader, &child, "Timecode")?;
        let size = body.len() as u64;
        let timecode = read_uint(&mut body.clone(), size).map_err(|source| DemuxError::Corrupt { offset: pos, source })?;
        Ok(Some((cluster, timecode)))
    }
}

impl<R: Read + Seek> Demuxer for WebmDemuxer<R> {
    fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    fn duration_ns(&self) -> Option<u64> {
        self.duration_ns
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DemuxError> {
        loop {
            let pos = self.reader.stream_position()?;

            let Some(mut cluster) = self.cluster else {
                if self.segment_end.is_some_and(|end| pos >= end) {
                    return Ok(None);
                }
                let Some(header) = read_element_header_from(&mut self.reader)? else {
                    return Ok(None);
                };
                if header.id == ids::CLUSTER {
                    let body_start = pos + header.header_len as u64;
                    self.cluster = Some(ClusterCursor {
                        end: header.size.map(|size| body_start + size),
                        timecode: 0,
                    });
                } else if skip_element(&mut self.reader, &header).is_err() {
                    // Unknown-size trailer we cannot step over.
                    return Ok(None);
                }
                continue;
            };

            if cluster.end.is_some_and(|end| pos >= end) {
                self.cluster = None;
                continue;
            }
            let Some(header) = read_element_header_from(&mut self.reader)? else {
                self.cluster = None;
                return Ok(None);
            };

            if cluster.end.is_none() && is_top_level(header.id) {
                // An unknown-size cluster ends where the next top-level element starts.
                self.reader.seek(SeekFrom::Start(pos))?;
                self.cluster = None;
                continue;
            }

            match header.id {
                ids::TIMECODE => {
                    let body = read_sized_body(&mut self.reader, &header, "Timecode")?;
                    let size = body.len() as u64;
                    cluster.timecode = read_uint(&mut body.clone(), size)
                        .map_err(|source| DemuxError::Corrupt { offset: pos, source })?;
                    self.cluster = Some(cluster);
                }
                ids::SIMPLE_BLOCK => {
                    let Some(body) = self.read_block_body(&header, pos)? else {
                        return Ok(None);
                    };
                    let block = parse_block(body).map_err(|source| DemuxError::Corrupt { offset: pos, source })?;
                    if let Some(packet) = self.block_to_packet(block, false, Vec::new(), cluster.timecode) {
                        return Ok(Some(packet));
                    }
                }
                ids::BLOCK_GROUP => {
                    let Some(body) = self.read_block_body(&header, pos)? else {
                        return Ok(None);
                    };
                    let group = parse_block_group(body).map_err(|source| DemuxError::Corrupt { offset: pos, source })?;
                    if let Some(block) = group.block {
                        let keyframe = !group.has_reference;
                        if let Some(packet) = self.block_to_packet(block, keyframe, group.additions, cluster.timecode) {
                            return Ok(Some(packet));
                        }
                    }
                }
                _ => skip_element(&mut self.reader, &header).map_err(|_| DemuxError::Corrupt {
                    offset: pos,
                    source: ParseError::InvalidSize { what: "cluster child", size: u64::MAX },
                })?,
            }
        }
    }

    fn seek_track(&mut self, track: usize, position_ns: u64) -> Result<(), DemuxError> {
        if track >= self.tracks.len() {
            return Err(DemuxError::UnknownTrack(track));
        }
        self.cluster = None;
        let Some(first) = self.first_cluster else {
            return Ok(());
        };

        let mut target = first;
        if position_ns > 0 {
            let mut pos = first;
            // Linear walk over sized clusters; there is no Cues lookup.
            while let Some((cluster, timecode)) = self.peek_cluster_timecode(pos)? {
                if timecode.saturating_mul(self.timecode_scale) > position_ns {
                    break;
                }
                target = pos;
                match cluster.size {
                    Some(size) => pos += cluster.header_len as u64 + size,
                    None => break,
                }
            }
        }

        self.reader.seek(SeekFrom::Start(target))?;
        tracing::debug!("Track {} repositioned to byte {}", track, target);
        Ok(())
    }
}

// ============================================================================
// Element helpers
// ============================================================================

fn read_sized_body<R: Read>(reader: &mut R, header: &ElementHeader, what: &str) -> Result<Bytes, DemuxError> {
    let size = header
        .size
        .ok_or_else(|| DemuxError::Metadata(format!("{} has unknown size", what)))?;
    if size > MAX_HEADER_ELEMENT {
        return Err(DemuxError::Metadata(format!("{} is too large ({} bytes)", what, size)));
    }
    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body)?;
    Ok(Bytes::from(body))
}

fn skip_element<R: Seek>(reader: &mut R, header: &ElementHeader) -> io::Result<()> {
    let size = header.size.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "cannot skip unknown-size element")
    })?;
    let offset = i64::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "element too large"))?;
    reader.seek(SeekFrom::Current(offset))?;
    Ok(())
}

/// Calls `f` for every child of a buffered master element.
fn for_each_child<F>(mut body: Bytes, mut f: F) -> Result<(), ParseError>
where
    F: FnMut(u32, Bytes) -> Result<(), ParseError>,
{
    while body.has_remaining() {
        let header = read_element_header(&mut body)?;
        let size = header.size.ok_or(ParseError::InvalidSize {
            what: "child element",
            size: u64::MAX,
        })?;
        let child = take_bytes(&mut body, size, "child element")?;
        f(header.id, child)?;
    }
    Ok(())
}

fn uint_value(body: Bytes) -> Result<u64, ParseError> {
    let size = body.len() as u64;
    read_uint(&mut body.clone(), size)
}

fn metadata(what: &str) -> impl Fn(ParseError) -> DemuxError + '_ {
    move |e| DemuxError::Metadata(format!("{}: {}", what, e))
}

fn parse_doc_type(body: Bytes) -> Result<String, DemuxError> {
    let mut doc_type = String::from("matroska");
    for_each_child(body, |id, child| {
        if id == ids::DOC_TYPE {
            let size = child.len() as u64;
            doc_type = read_string(&mut child.clone(), size)?;
        }
        Ok(())
    })
    .map_err(|e| DemuxError::Open(format!("Bad EBML header: {}", e)))?;
    Ok(doc_type)
}

fn parse_info(body: Bytes) -> Result<(u64, Option<f64>), DemuxError> {
    let mut scale = DEFAULT_TIMECODE_SCALE;
    let mut duration = None;
    for_each_child(body, |id, child| {
        match id {
            ids::TIMECODE_SCALE => scale = uint_value(child)?,
            ids::DURATION => {
                let size = child.len() as u64;
                duration = Some(read_float(&mut child.clone(), size)?);
            }
            _ => {}
        }
        Ok(())
    })
    .map_err(metadata("Info"))?;

    if scale == 0 {
        return Err(DemuxError::Metadata("TimecodeScale is zero".into()));
    }
    Ok((scale, duration))
}

fn parse_tracks(body: Bytes) -> Result<Vec<Track>, DemuxError> {
    let mut entries = Vec::new();
    for_each_child(body, |id, child| {
        if id == ids::TRACK_ENTRY {
            entries.push(child);
        }
        Ok(())
    })
    .map_err(metadata("Tracks"))?;

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| parse_track_entry(index, entry))
        .collect()
}

fn parse_track_entry(index: usize, body: Bytes) -> Result<Track, DemuxError> {
    let mut number = None;
    let mut track_type = 0u64;
    let mut codec_id = String::new();
    let mut default_duration_ns = 0u64;
    let mut video_body = None;
    let mut audio_body = None;

    for_each_child(body, |id, child| {
        match id {
            ids::TRACK_NUMBER => number = Some(uint_value(child)?),
            ids::TRACK_TYPE => track_type = uint_value(child)?,
            ids::CODEC_ID => {
                let size = child.len() as u64;
                codec_id = read_string(&mut child.clone(), size)?;
            }
            ids::DEFAULT_DURATION => default_duration_ns = uint_value(child)?,
            ids::VIDEO => video_body = Some(child),
            ids::AUDIO => audio_body = Some(child),
            _ => {}
        }
        Ok(())
    })
    .map_err(metadata("TrackEntry"))?;

    let number = number
        .filter(|n| *n > 0)
        .ok_or_else(|| DemuxError::Metadata(format!("Track {} has no TrackNumber", index)))?;

    let kind = match track_type {
        TRACK_TYPE_VIDEO => TrackKind::Video,
        TRACK_TYPE_AUDIO => TrackKind::Audio,
        _ => TrackKind::Other,
    };

    let video = match kind {
        TrackKind::Video => {
            let body = video_body.ok_or_else(|| {
                DemuxError::Metadata(format!("Video track {} has no Video element", number))
            })?;
            Some(parse_video(body, default_duration_ns)?)
        }
        _ => None,
    };
    let audio = match (kind, audio_body) {
        (TrackKind::Audio, Some(body)) => Some(parse_audio(body)?),
        (TrackKind::Audio, None) => Some(AudioParams {
            sample_rate: 8000.0,
            channels: 1,
            bit_depth: 0,
        }),
        _ => None,
    };

    Ok(Track {
        id: index,
        number,
        kind,
        codec_id,
        default_duration_ns,
        video,
        audio,
    })
}

fn parse_video(body: Bytes, default_duration_ns: u64) -> Result<VideoParams, DemuxError> {
    let mut pixel_width = 0u64;
    let mut pixel_height = 0u64;
    let mut display_width = None;
    let mut display_height = None;
    let mut alpha_mode = 0u64;

    for_each_child(body, |id, child| {
        match id {
            ids::PIXEL_WIDTH => pixel_width = uint_value(child)?,
            ids::PIXEL_HEIGHT => pixel_height = uint_value(child)?,
            ids::DISPLAY_WIDTH => display_width = Some(uint_value(child)?),
            ids::DISPLAY_HEIGHT => display_height = Some(uint_value(child)?),
            ids::ALPHA_MODE => alpha_mode = uint_value(child)?,
            _ => {}
        }
        Ok(())
    })
    .map_err(metadata("Video"))?;

    let to_u32 = |v: u64, what: &str| {
        u32::try_from(v)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| DemuxError::Metadata(format!("Invalid {}: {}", what, v)))
    };
    let pixel_width = to_u32(pixel_width, "PixelWidth")?;
    let pixel_height = to_u32(pixel_height, "PixelHeight")?;

    Ok(VideoParams {
        pixel_width,
        pixel_height,
        display_width: display_width
            .map(|w| to_u32(w, "DisplayWidth"))
            .transpose()?
            .unwrap_or(pixel_width),
        display_height: display_height
            .map(|h| to_u32(h, "DisplayHeight"))
            .transpose()?
            .unwrap_or(pixel_height),
        has_alpha: alpha_mode == 1,
        target_fps: fps_from_frame_duration(default_duration_ns),
    })
}

fn parse_audio(body: Bytes) -> Result<AudioParams, DemuxError> {
    let mut params = AudioParams {
        sample_rate: 8000.0,
        channels: 1,
        bit_depth: 0,
    };
    for_each_child(body, |id, child| {
        match id {
            ids::SAMPLING_FREQUENCY => {
                let size = child.len() as u64;
                params.sample_rate = read_float(&mut child.clone(), size)?;
            }
            ids::CHANNELS => params.channels = uint_value(child)? as u32,
            ids::BIT_DEPTH => params.bit_depth = uint_value(child)? as u32,
            _ => {}
        }
        Ok(())
    })
    .map_err(metadata("Audio"))?;
    Ok(params)
}

struct BlockGroup {
    block: Option<Block>,
    has_reference: bool,
    additions: Vec<(u64, Bytes)>,
}

fn parse_block_group(body: Bytes) -> Result<BlockGroup, ParseError> {
    let mut group = BlockGroup {
        block: None,
        has_reference: false,
        additions: Vec::new(),
    };
    for_each_child(body, |id, child| {
        match id {
            ids::BLOCK => group.block = Some(parse_block(child)?),
            ids::REFERENCE_BLOCK => group.has_reference = true,
            ids::BLOCK_ADDITIONS => {
                for_each_child(child, |id, more| {
                    if id == ids::BLOCK_MORE {
                        group.additions.push(parse_block_more(more)?);
                    }
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(group)
}

fn parse_block_more(body: Bytes) -> Result<(u64, Bytes), ParseError> {
    let mut add_id = 1u64;
    let mut data = Bytes::new();
    for_each_child(body, |id, child| {
        match id {
            ids::BLOCK_ADD_ID => add_id = uint_value(child)?,
            ids::BLOCK_ADDITIONAL => data = child,
            _ => {}
        }
        Ok(())
    })?;
    Ok((add_id, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxer::ALPHA_ADD_ID;
    use std::io::Cursor;

    // ------------------------------------------------------------------------
    // Tiny EBML writer for synthetic streams
    // ------------------------------------------------------------------------

    fn id_bytes(id: u32) -> Vec<u8> {
        let bytes = id.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        bytes[skip..].to_vec()
    }

    fn el(id: u32, body: &[u8]) -> Vec<u8> {
        let mut out = id_bytes(id);
        out.push(0x01);
        out.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    fn el_unknown(id: u32, body: &[u8]) -> Vec<u8> {
        let mut out = id_bytes(id);
        out.push(0xFF);
        out.extend_from_slice(body);
        out
    }

    fn uint(id: u32, value: u64) -> Vec<u8> {
        el(id, &value.to_be_bytes())
    }

    fn float(id: u32, value: f64) -> Vec<u8> {
        el(id, &value.to_be_bytes())
    }

    fn string(id: u32, value: &str) -> Vec<u8> {
        el(id, value.as_bytes())
    }

    fn simple_block(track: u8, rel: i16, keyframe: bool, data: &[u8]) -> Vec<u8> {
        let mut body = vec![0x80 | track];
        body.extend_from_slice(&rel.to_be_bytes());
        body.push(if keyframe { 0x80 } else { 0x00 });
        body.extend_from_slice(data);
        el(ids::SIMPLE_BLOCK, &body)
    }

    fn block_group(track: u8, rel: i16, data: &[u8], alpha: &[u8]) -> Vec<u8> {
        let mut block = vec![0x80 | track];
        block.extend_from_slice(&rel.to_be_bytes());
        block.push(0x00);
        block.extend_from_slice(data);

        let more = [uint(ids::BLOCK_ADD_ID, ALPHA_ADD_ID), el(ids::BLOCK_ADDITIONAL, alpha)].concat();
        let additions = el(ids::BLOCK_ADDITIONS, &el(ids::BLOCK_MORE, &more));
        el(ids::BLOCK_GROUP, &[el(ids::BLOCK, &block), additions].concat())
    }

    fn ebml_header(doc_type: &str) -> Vec<u8> {
        el(ids::EBML, &string(ids::DOC_TYPE, doc_type))
    }

    fn video_track(number: u64, default_duration: Option<u64>, alpha: bool) -> Vec<u8> {
        let mut video = [uint(ids::PIXEL_WIDTH, 64), uint(ids::PIXEL_HEIGHT, 48)].concat();
        if alpha {
            video.extend(uint(ids::ALPHA_MODE, 1));
        }
        let mut entry = [
            uint(ids::TRACK_NUMBER, number),
            uint(ids::TRACK_TYPE, TRACK_TYPE_VIDEO),
            string(ids::CODEC_ID, "V_VP8"),
            el(ids::VIDEO, &video),
        ]
        .concat();
        if let Some(duration) = default_duration {
            entry.extend(uint(ids::DEFAULT_DURATION, duration));
        }
        el(ids::TRACK_ENTRY, &entry)
    }

    fn audio_track(number: u64) -> Vec<u8> {
        let audio = [
            float(ids::SAMPLING_FREQUENCY, 48000.0),
            uint(ids::CHANNELS, 2),
            uint(ids::BIT_DEPTH, 16),
        ]
        .concat();
        el(
            ids::TRACK_ENTRY,
            &[
                uint(ids::TRACK_NUMBER, number),
                uint(ids::TRACK_TYPE, TRACK_TYPE_AUDIO),
                string(ids::CODEC_ID, "A_VORBIS"),
                el(ids::AUDIO, &audio),
            ]
            .concat(),
        )
    }

    fn info() -> Vec<u8> {
        el(
            ids::INFO,
            &[uint(ids::TIMECODE_SCALE, 1_000_000), float(ids::DURATION, 2000.0)].concat(),
        )
    }

    fn clusters() -> Vec<u8> {
        let first = [
            uint(ids::TIMECODE, 0),
            simple_block(1, 0, true, b"f0"),
            simple_block(2, 0, true, b"a0"),
            block_group(1, 40, b"f1", b"alpha1"),
        ]
        .concat();
        let second = [uint(ids::TIMECODE, 1000), simple_block(1, 0, true, b"f2")].concat();
        [el(ids::CLUSTER, &first), el(ids::CLUSTER, &second)].concat()
    }

    fn sample_stream(default_duration: Option<u64>) -> Vec<u8> {
        let tracks = el(
            ids::TRACKS,
            &[video_track(1, default_duration, true), audio_track(2)].concat(),
        );
        let segment = [el(ids::SEEK_HEAD, &[0xEC, 0x80]), info(), tracks, clusters()].concat();
        [ebml_header("webm"), el(ids::SEGMENT, &segment)].concat()
    }

    fn open(bytes: Vec<u8>) -> WebmDemuxer<Cursor<Vec<u8>>> {
        WebmDemuxer::open(Cursor::new(bytes)).expect("open")
    }

    fn drain(demuxer: &mut impl Demuxer) -> Vec<Packet> {
        std::iter::from_fn(|| demuxer.read_packet().expect("read")).collect()
    }

    // ------------------------------------------------------------------------

    #[test]
    fn parses_tracks_and_info() {
        let demuxer = open(sample_stream(Some(40_000_000)));
        assert_eq!(demuxer.doc_type(), "webm");
        assert_eq!(demuxer.track_count(), 2);
        assert_eq!(demuxer.duration_ns(), Some(2_000_000_000));

        let video = demuxer.track(0).unwrap();
        assert_eq!(video.kind, TrackKind::Video);
        assert_eq!(video.codec_id, "V_VP8");
        let params = video.video.as_ref().unwrap();
        assert_eq!((params.pixel_width, params.pixel_height), (64, 48));
        assert_eq!((params.display_width, params.display_height), (64, 48));
        assert!(params.has_alpha);
        assert_eq!(params.target_fps, 25);

        let audio = demuxer.track(1).unwrap();
        assert_eq!(audio.kind, TrackKind::Audio);
        let params = audio.audio.as_ref().unwrap();
        assert_eq!(params.sample_rate, 48000.0);
        assert_eq!((params.channels, params.bit_depth), (2, 16));
    }

    #[test]
    fn missing_frame_duration_means_24_fps() {
        let demuxer = open(sample_stream(None));
        for track in demuxer.tracks().iter().filter(|t| t.is_video()) {
            assert_eq!(track.video.as_ref().unwrap().target_fps, 24);
        }
    }

    #[test]
    fn reads_packets_in_file_order() {
        let mut demuxer = open(sample_stream(None));
        let packets = drain(&mut demuxer);
        let summary: Vec<(usize, u64, &[u8])> = packets
            .iter()
            .map(|p| (p.track, p.timestamp_ns, &p.frames[0][..]))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, 0, &b"f0"[..]),
                (1, 0, &b"a0"[..]),
                (0, 40_000_000, &b"f1"[..]),
                (0, 1_000_000_000, &b"f2"[..]),
            ]
        );
        assert!(packets[0].keyframe);
        assert!(packets[2].keyframe, "block group without ReferenceBlock is a keyframe");
    }

    #[test]
    fn exposes_alpha_block_additions() {
        let mut demuxer = open(sample_stream(None));
        let packets = drain(&mut demuxer);
        assert!(packets[0].additional_data(ALPHA_ADD_ID).is_none());
        assert_eq!(&packets[2].additional_data(ALPHA_ADD_ID).unwrap()[..], b"alpha1");
    }

    #[test]
    fn rewinding_after_eof_replays_from_first_packet() {
        let mut demuxer = open(sample_stream(None));
        let first_pass = drain(&mut demuxer);
        assert!(demuxer.read_packet().unwrap().is_none());

        for track in 0..demuxer.track_count() {
            demuxer.seek_track(track, 0).unwrap();
        }
        let replay = demuxer.read_packet().unwrap().expect("packet after rewind");
        assert_eq!(replay, first_pass[0]);
        let second_pass: Vec<Packet> = std::iter::once(replay).chain(drain(&mut demuxer)).collect();
        assert_eq!(second_pass, first_pass);
    }

    #[test]
    fn seek_lands_on_cluster_at_or_before_position() {
        let mut demuxer = open(sample_stream(None));
        demuxer.seek_track(0, 1_500_000_000).unwrap();
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(&packet.frames[0][..], b"f2");

        demuxer.seek_track(0, 500_000_000).unwrap();
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(&packet.frames[0][..], b"f0");

        assert!(matches!(demuxer.seek_track(9, 0), Err(DemuxError::UnknownTrack(9))));
    }

    #[test]
    fn handles_unknown_size_segment_and_clusters() {
        let tracks = el(ids::TRACKS, &video_track(1, Some(40_000_000), false));
        let c1 = el_unknown(
            ids::CLUSTER,
            &[uint(ids::TIMECODE, 0), simple_block(1, 0, true, b"u0")].concat(),
        );
        let c2 = el_unknown(
            ids::CLUSTER,
            &[uint(ids::TIMECODE, 40), simple_block(1, 0, false, b"u1")].concat(),
        );
        let segment = [info(), tracks, c1, c2].concat();
        let bytes = [ebml_header("webm"), el_unknown(ids::SEGMENT, &segment)].concat();

        let mut demuxer = open(bytes);
        let packets = drain(&mut demuxer);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[1].frames[0][..], b"u1");
        assert_eq!(packets[1].timestamp_ns, 40_000_000);
        assert!(!packets[1].keyframe);

        demuxer.seek_track(0, 0).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap(), packets[0]);
    }

    #[test]
    fn rejects_non_ebml_input() {
        let err = WebmDemuxer::open(Cursor::new(b"RIFF\0\0\0\0AVI ".to_vec())).err().unwrap();
        assert!(matches!(err, DemuxError::Open(_)));
    }

    #[test]
    fn rejects_unsupported_doc_type() {
        let bytes = [ebml_header("mp4ish"), el(ids::SEGMENT, &[])].concat();
        let err = WebmDemuxer::open(Cursor::new(bytes)).err().unwrap();
        assert!(err.to_string().contains("DocType"));
    }

    #[test]
    fn stream_without_tracks_is_a_metadata_error() {
        let bytes = [ebml_header("webm"), el(ids::SEGMENT, &info())].concat();
        let err = WebmDemuxer::open(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, DemuxError::Metadata(_)));
    }

    #[test]
    fn malformed_duration_is_a_metadata_error() {
        let bad_info = el(ids::INFO, &el(ids::DURATION, &[0, 0, 0]));
        let tracks = el(ids::TRACKS, &video_track(1, None, false));
        let bytes = [ebml_header("webm"), el(ids::SEGMENT, &[bad_info, tracks].concat())].concat();
        let err = WebmDemuxer::open(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, DemuxError::Metadata(_)));
    }

    #[test]
    fn truncated_final_block_ends_the_stream() {
        let mut bytes = sample_stream(None);
        bytes.truncate(bytes.len() - 1);
        let mut demuxer = open(bytes);
        let packets = drain(&mut demuxer);
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn opens_files_from_disk() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sample_stream(Some(40_000_000))).unwrap();
        let mut demuxer = WebmDemuxer::open_file(file.path()).unwrap();
        assert_eq!(drain(&mut demuxer).len(), 4);

        let missing = WebmDemuxer::open_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(DemuxError::Open(_))));
    }
}
