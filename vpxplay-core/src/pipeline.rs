//! # Playback Pipeline
//!
//! The control loop of the player. Runs on the thread that owns the display
//! and drives three collaborators:
//!
//! ```text
//!   Demuxer ──packet──► PlaybackPipeline ──DecodeRequest──► TaskQueue ──► DecodeWorker
//!                            ▲    │                                          │
//!                            │    └──harvest (after ticket fires)◄───────────┘
//!                            ▼
//!                        Presenter
//! ```
//!
//! ## States
//! - `Priming`: nothing in flight; the next video sub-unit is submitted.
//! - `Steady`: one request in flight. Each iteration waits briefly on its
//!   ticket; once it fires the sessions are harvested, the frame is
//!   presented and paced, and the next sub-unit is submitted.
//! - `Draining`: end of stream; every track is rewound and playback
//!   resumes in `Priming`.
//! - `Stopped`: quit requested; the worker is joined and resources dropped.
//!
//! At most one request is ever in flight, so the queue never holds more
//! than one item and a session is never harvested while it is decoding.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PlayerConfig;
use crate::decode::{CodecSession, DecodeError};
use crate::decode_worker::{
    share_session, DecodeOutcome, DecodeRequest, DecodeTicket, DecodeWorker, PayloadStatus, SharedSession,
};
use crate::demuxer::{Demuxer, Packet, ALPHA_ADD_ID};
use crate::mkv::DemuxError;
use crate::presenter::{InputEvent, PresentError, Presenter};
use crate::sync::FramePacer;
use crate::task_queue::TaskQueue;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Demux error: {0}")]
    Demux(#[from] DemuxError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Present error: {0}")]
    Present(#[from] PresentError),
    #[error("Stream has no video track")]
    NoVideoTrack,
    #[error("Stream has no video packets")]
    EmptyStream,
    #[error("Failed to start decode worker: {0}")]
    WorkerSpawn(#[source] io::Error),
}

impl PlaybackError {
    /// Whether playback must stop. Per-frame decode failures are not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PlaybackError::Decode(DecodeError::DecodeFailed(_) | DecodeError::UnsupportedImage(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Priming,
    Steady,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStats {
    pub requests_submitted: u64,
    pub frames_presented: u64,
    pub decode_failures: u64,
    pub packets_skipped: u64,
    pub loops: u64,
}

struct InFlight {
    sequence: u64,
    ticket: DecodeTicket,
    submitted_at: Instant,
}

pub struct PlaybackPipeline<D: Demuxer, P: Presenter> {
    demuxer: D,
    presenter: P,
    config: PlayerConfig,
    video_track: usize,

    primary: SharedSession,
    alpha: Option<SharedSession>,
    queue: Arc<TaskQueue<DecodeRequest>>,
    worker: Option<DecodeWorker>,

    state: PipelineState,
    /// Sub-units of the current packet not yet submitted.
    pending: VecDeque<Bytes>,
    pending_alpha: Option<Bytes>,
    in_flight: Option<InFlight>,
    requests_this_pass: u64,
    next_sequence: u64,

    pacer: FramePacer,
    stats: PlaybackStats,
}

impl<D: Demuxer, P: Presenter> PlaybackPipeline<D, P> {
    /// Bind the collaborators and start the decode worker.
    ///
    /// `alpha` is only used when the video track carries an alpha channel.
    pub fn new(
        demuxer: D,
        presenter: P,
        primary: Box<dyn CodecSession>,
        alpha: Option<Box<dyn CodecSession>>,
        config: PlayerConfig,
    ) -> Result<Self, PlaybackError> {
        let track = demuxer
            .tracks()
            .iter()
            .find(|t| t.is_video())
            .ok_or(PlaybackError::NoVideoTrack)?;
        let video_track = track.id;
        let has_alpha = track.video.as_ref().is_some_and(|v| v.has_alpha);
        let fps = track
            .video
            .as_ref()
            .map(|v| v.target_fps)
            .filter(|fps| *fps > 0)
            .unwrap_or(config.fallback_fps);

        let alpha = match (has_alpha, alpha) {
            (true, Some(session)) => Some(share_session(session)),
            (true, None) => {
                tracing::warn!("Track {} has alpha but no alpha decoder; alpha ignored", video_track);
                None
            }
            (false, _) => None,
        };

        let queue = Arc::new(TaskQueue::new());
        let worker = DecodeWorker::spawn(queue.clone()).map_err(PlaybackError::WorkerSpawn)?;

        tracing::debug!(
            "Pipeline ready: video track {}, {} fps, alpha {}",
            video_track,
            fps,
            alpha.is_some()
        );

        Ok(Self {
            demuxer,
            presenter,
            config,
            video_track,
            primary: share_session(primary),
            alpha,
            queue,
            worker: Some(worker),
            state: PipelineState::Priming,
            pending: VecDeque::new(),
            pending_alpha: None,
            in_flight: None,
            requests_this_pass: 0,
            next_sequence: 0,
            pacer: FramePacer::new(fps),
            stats: PlaybackStats::default(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn queue(&self) -> &Arc<TaskQueue<DecodeRequest>> {
        &self.queue
    }

    /// Loop until quit, then shut down.
    pub fn run(mut self) -> Result<PlaybackStats, PlaybackError> {
        let result = loop {
            match self.step() {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let stats = self.shutdown();
        result.map(|()| stats)
    }

    /// One loop iteration. Returns false once stopped.
    pub fn step(&mut self) -> Result<bool, PlaybackError> {
        if self.state == PipelineState::Stopped {
            return Ok(false);
        }

        match self.presenter.poll_event() {
            Some(InputEvent::Quit) => {
                self.set_state(PipelineState::Stopped);
                return Ok(false);
            }
            Some(InputEvent::ToggleFullscreen) => self.presenter.toggle_fullscreen(),
            None => {}
        }

        if let Some(in_flight) = &self.in_flight {
            let Some(outcome) = in_flight.ticket.wait_timeout(self.config.decode_wait) else {
                // Still decoding; no new packet this iteration.
                return Ok(true);
            };
            tracing::trace!(
                "Request {} completed after {}us",
                in_flight.sequence,
                in_flight.submitted_at.elapsed().as_micros()
            );
            self.in_flight = None;
            self.harvest(outcome)?;
        }

        self.submit_next()?;
        Ok(true)
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            tracing::debug!("Pipeline {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    // ========================================================================
    // Harvest & Present
    // ========================================================================

    fn harvest(&mut self, outcome: DecodeOutcome) -> Result<(), PlaybackError> {
        for status in [outcome.primary, outcome.alpha] {
            if status == PayloadStatus::Failed {
                self.stats.decode_failures += 1;
            }
        }
        if outcome.primary != PayloadStatus::Decoded {
            return Ok(());
        }

        let start = Instant::now();
        let mut size = None;
        {
            let mut session = self.primary.lock();
            while let Some(frame) = session.next_frame() {
                let overlay = self.presenter.begin_frame(frame.width, frame.height)?;
                overlay.blit_frame(&frame)?;
                size = Some((frame.width, frame.height));
            }
        }
        let Some((width, height)) = size else {
            return Ok(());
        };

        if let Some(alpha) = &self.alpha {
            let overlay = self.presenter.begin_frame(width, height)?;
            if outcome.alpha == PayloadStatus::Decoded {
                let mut session = alpha.lock();
                while let Some(frame) = session.next_frame() {
                    overlay.blit_alpha(&frame, self.config.alpha_composite)?;
                }
            } else {
                overlay.clear_alpha();
            }
        }
        tracing::trace!("Copied {}x{} frame in {}us", width, height, start.elapsed().as_micros());

        self.presenter.end_frame()?;
        self.stats.frames_presented += 1;
        self.pacer.frame_presented();
        Ok(())
    }

    // ========================================================================
    // Submit
    // ========================================================================

    fn submit_next(&mut self) -> Result<(), PlaybackError> {
        if self.pending.is_empty() {
            match self.next_video_packet()? {
                Some(packet) => self.split_packet(packet),
                None => return self.drain(),
            }
        }

        let Some(primary) = self.pending.pop_front() else {
            return Ok(());
        };
        let alpha = self.pending_alpha.take();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let (request, ticket) = DecodeRequest::new(
            sequence,
            primary,
            alpha,
            self.primary.clone(),
            self.alpha.clone(),
        );
        if !self.queue.push(request) {
            // Only happens once shutdown has begun.
            self.set_state(PipelineState::Stopped);
            return Ok(());
        }
        self.in_flight = Some(InFlight {
            sequence,
            ticket,
            submitted_at: Instant::now(),
        });
        self.stats.requests_submitted += 1;
        self.requests_this_pass += 1;
        self.set_state(PipelineState::Steady);
        Ok(())
    }

    /// Next packet of the video track; other tracks are dropped.
    fn next_video_packet(&mut self) -> Result<Option<Packet>, PlaybackError> {
        while let Some(packet) = self.demuxer.read_packet()? {
            if packet.track == self.video_track {
                return Ok(Some(packet));
            }
            self.stats.packets_skipped += 1;
        }
        Ok(None)
    }

    fn split_packet(&mut self, packet: Packet) {
        if self.alpha.is_some() {
            self.pending_alpha = packet.additional_data(ALPHA_ADD_ID).cloned();
        }
        self.pending.extend(packet.frames);
    }

    /// End of stream: rewind every track and start over.
    fn drain(&mut self) -> Result<(), PlaybackError> {
        self.set_state(PipelineState::Draining);
        if self.requests_this_pass == 0 {
            return Err(PlaybackError::EmptyStream);
        }
        for track in 0..self.demuxer.track_count() {
            self.demuxer.seek_track(track, 0)?;
        }
        self.pending.clear();
        self.pending_alpha = None;
        self.requests_this_pass = 0;
        self.stats.loops += 1;
        tracing::debug!("End of stream, looping (pass {})", self.stats.loops + 1);
        self.set_state(PipelineState::Priming);
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Join the worker, then drop sessions, demuxer and presenter in that order.
    pub fn shutdown(mut self) -> PlaybackStats {
        self.set_state(PipelineState::Stopped);
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        let Self {
            demuxer,
            presenter,
            primary,
            alpha,
            in_flight,
            stats,
            ..
        } = self;
        drop(in_flight);
        drop(alpha);
        drop(primary);
        drop(demuxer);
        drop(presenter);
        tracing::info!(
            "Playback stopped: {} frames presented, {} requests, {} decode failures, {} loops",
            stats.frames_presented,
            stats.requests_submitted,
            stats.decode_failures,
            stats.loops
        );
        stats
    }
}
