//! # vpxplay Core
//!
//! Looping WebM (VP8/VP9, optional alpha) playback: container demuxing,
//! libvpx decoding on a worker thread, and a paced YV12 presenter.

// ============================================================================
// Container
// ============================================================================
pub mod mkv;
pub mod demuxer;

// ============================================================================
// Decoding
// ============================================================================
pub mod decode;
pub mod vpx;
pub mod task_queue;
pub mod decode_worker;

// ============================================================================
// Presentation
// ============================================================================
pub mod presenter;
pub mod render;
pub mod window;
pub mod sync;

// ============================================================================
// Playback
// ============================================================================
pub mod config;
pub mod pipeline;
