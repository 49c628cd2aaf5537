//! # vpxplay
//!
//! Plays a WebM file in a window, looping until Escape or window close.
//!
//! ```text
//! vpxplay <file.webm>
//! ```

use std::path::Path;

use anyhow::{Context, Result};

use vpxplay_core::config::PlayerConfig;
use vpxplay_core::decode::open_session;
use vpxplay_core::demuxer::{first_video_track, log_stream_info};
use vpxplay_core::mkv::WebmDemuxer;
use vpxplay_core::pipeline::{PlaybackError, PlaybackPipeline};
use vpxplay_core::window::WindowPresenter;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage(args.first().map_or("vpxplay", String::as_str));
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter("vpxplay=info,wgpu=warn,winit=warn")
        .init();

    tracing::info!("vpxplay v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = play(Path::new(&args[1])) {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

fn print_usage(program: &str) {
    eprintln!("\nUsage:\n  {} <file.webm>\n", program);
}

fn play(path: &Path) -> Result<()> {
    let title = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let config = PlayerConfig::default().with_title(title);

    tracing::info!("Opening: {:?}", path);
    let demuxer = WebmDemuxer::open_file(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    log_stream_info(&demuxer);

    let track = first_video_track(&demuxer)
        .cloned()
        .ok_or(PlaybackError::NoVideoTrack)?;
    let video = track.video.clone().unwrap_or_default();

    let primary = open_session(&track.codec_id, config.decoder_threads)
        .with_context(|| format!("Failed to open {} decoder", track.codec_id))?;
    let alpha = if video.has_alpha {
        let session = open_session(&track.codec_id, config.decoder_threads)
            .context("Failed to open alpha decoder")?;
        Some(session)
    } else {
        None
    };

    let presenter = WindowPresenter::new(&config.window_title, video.display_width, video.display_height)
        .context("Failed to open video window")?;

    let stats = PlaybackPipeline::new(demuxer, presenter, primary, alpha, config)?.run()?;
    tracing::info!(
        "Done: {} frames presented over {} loops",
        stats.frames_presented,
        stats.loops + 1
    );
    Ok(())
}
