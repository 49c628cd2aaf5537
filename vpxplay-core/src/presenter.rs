//! # Frame Presenter
//!
//! Display-side contract of the playback loop. A presenter owns a YV12
//! [`Overlay`] (Y, V, U planes plus an optional alpha plane); decoded frames
//! are blitted into it row by row and published with `end_frame`.
//!
//! Presenters are single-threaded: only the playback thread touches them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::{chroma_rows, DecodedFrame, Plane};

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("Presenter init failed: {0}")]
    Init(String),
    #[error("Invalid overlay plane index {0}")]
    InvalidPlane(usize),
    #[error("Surface error: {0}")]
    Surface(String),
}

/// Input events surfaced to the playback loop, at most one per poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Quit,
    ToggleFullscreen,
}

/// How the alpha decoder's luma output reaches the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlphaComposite {
    /// Store it as a separate mask plane, blended by the renderer.
    #[default]
    Mask,
    /// Overwrite the overlay's first plane with it.
    LumaOverwrite,
}

pub trait Presenter {
    /// Lock the overlay for a `width` x `height` picture, resizing it if needed.
    fn begin_frame(&mut self, width: u32, height: u32) -> Result<&mut Overlay, PresentError>;

    /// Unlock and publish the overlay.
    fn end_frame(&mut self) -> Result<(), PresentError>;

    /// Non-blocking; at most one event per call.
    fn poll_event(&mut self) -> Option<InputEvent>;

    fn toggle_fullscreen(&mut self);
}

// ============================================================================
// Overlay
// ============================================================================

pub const PLANE_Y: usize = 0;
pub const PLANE_V: usize = 1;
pub const PLANE_U: usize = 2;
pub const PLANE_ALPHA: usize = 3;

#[derive(Debug, Clone)]
pub struct OverlayPlane {
    /// Bytes per destination row.
    pub pitch: usize,
    pub rows: usize,
    pub data: Vec<u8>,
}

impl OverlayPlane {
    fn new(pitch: usize, rows: usize, fill: u8) -> Self {
        Self {
            pitch,
            rows,
            data: vec![fill; pitch * rows],
        }
    }

    pub fn row(&self, index: usize) -> &[u8] {
        &self.data[index * self.pitch..(index + 1) * self.pitch]
    }
}

/// YV12 pixel buffer in system memory.
#[derive(Debug, Clone)]
pub struct Overlay {
    width: u32,
    height: u32,
    planes: [OverlayPlane; 4],
}

impl Overlay {
    pub fn new(width: u32, height: u32) -> Self {
        let w = width as usize;
        let h = height as usize;
        let cw = (w + 1) / 2;
        let ch = chroma_rows(height);
        Self {
            width,
            height,
            planes: [
                OverlayPlane::new(w, h, 0),
                OverlayPlane::new(cw, ch, 128),
                OverlayPlane::new(cw, ch, 128),
                // Opaque until an alpha frame arrives.
                OverlayPlane::new(w, h, 255),
            ],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn plane(&self, index: usize) -> Option<&OverlayPlane> {
        self.planes.get(index)
    }

    /// Copy `rows` rows from `src` into plane `index`.
    ///
    /// Each destination row receives `min(src_stride, pitch)` bytes and is
    /// zero-padded past that, so differing strides never bleed into the
    /// neighbouring row. Rows beyond the plane or the source are ignored.
    pub fn blit_plane(&mut self, index: usize, src: &[u8], src_stride: usize, rows: usize) -> Result<(), PresentError> {
        let plane = self
            .planes
            .get_mut(index)
            .ok_or(PresentError::InvalidPlane(index))?;
        let pitch = plane.pitch;
        if src_stride == 0 || pitch == 0 {
            return Ok(());
        }
        let available = (src.len() + src_stride - 1) / src_stride;
        let rows = rows.min(plane.rows).min(available);

        for (row, dst) in plane.data.chunks_exact_mut(pitch).take(rows).enumerate() {
            let start = row * src_stride;
            let copy = pitch.min(src_stride).min(src.len() - start);
            dst[..copy].copy_from_slice(&src[start..start + copy]);
            dst[copy..].fill(0);
        }
        Ok(())
    }

    fn blit(&mut self, index: usize, plane: &Plane<'_>) -> Result<(), PresentError> {
        self.blit_plane(index, plane.data, plane.stride, plane.rows)
    }

    /// Copy a decoded 4:2:0 frame: luma at full height, U and V into the
    /// YV12 slots at half height.
    pub fn blit_frame(&mut self, frame: &DecodedFrame<'_>) -> Result<(), PresentError> {
        let chroma = chroma_rows(frame.height);
        let [y, u, v] = frame.planes;
        self.blit(PLANE_Y, &y)?;
        self.blit(PLANE_V, &Plane { rows: chroma, ..v })?;
        self.blit(PLANE_U, &Plane { rows: chroma, ..u })?;
        Ok(())
    }

    /// Copy the luma plane of an alpha-channel frame.
    pub fn blit_alpha(&mut self, frame: &DecodedFrame<'_>, mode: AlphaComposite) -> Result<(), PresentError> {
        let target = match mode {
            AlphaComposite::Mask => PLANE_ALPHA,
            AlphaComposite::LumaOverwrite => PLANE_Y,
        };
        self.blit(target, frame.luma())
    }

    /// Reset the alpha plane to fully opaque.
    pub fn clear_alpha(&mut self) {
        self.planes[PLANE_ALPHA].data.fill(255);
    }
}

// ============================================================================
// Surface Lock
// ============================================================================

/// Overlay plus the begin/end bookkeeping every presenter needs.
#[derive(Debug, Default)]
pub struct OverlaySurface {
    overlay: Option<Overlay>,
    locked: bool,
}

impl OverlaySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the overlay, reallocating it when the picture size changes.
    /// Locking an already locked surface returns the same overlay.
    pub fn begin(&mut self, width: u32, height: u32) -> Result<&mut Overlay, PresentError> {
        if width == 0 || height == 0 {
            return Err(PresentError::Surface(format!("invalid frame size {}x{}", width, height)));
        }
        self.locked = true;
        let overlay = match self.overlay.take() {
            Some(overlay) if overlay.width == width && overlay.height == height => overlay,
            previous => {
                if previous.is_some() {
                    tracing::debug!("Overlay resized to {}x{}", width, height);
                }
                Overlay::new(width, height)
            }
        };
        Ok(self.overlay.insert(overlay))
    }

    /// Unlock and hand back the overlay to publish.
    pub fn end(&mut self) -> Result<&Overlay, PresentError> {
        if !self.locked {
            return Err(PresentError::Surface("end_frame without begin_frame".into()));
        }
        self.locked = false;
        self.overlay
            .as_ref()
            .ok_or_else(|| PresentError::Surface("no overlay allocated".into()))
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(data: &[u8], stride: usize, rows: usize) -> Plane<'_> {
        Plane { data, stride, rows }
    }

    #[test]
    fn wider_source_stride_is_truncated_per_row() {
        let mut overlay = Overlay::new(4, 2);
        // Stride 6 with padding bytes 9.
        let src = [1, 2, 3, 4, 9, 9, 5, 6, 7, 8, 9, 9];
        overlay.blit_plane(PLANE_Y, &src, 6, 2).unwrap();
        let y = overlay.plane(PLANE_Y).unwrap();
        assert_eq!(y.row(0), &[1, 2, 3, 4]);
        assert_eq!(y.row(1), &[5, 6, 7, 8]);
    }

    #[test]
    fn narrower_source_stride_does_not_bleed_into_next_row() {
        let mut overlay = Overlay::new(4, 2);
        let src = [1, 2, 3, 4, 5, 6];
        overlay.blit_plane(PLANE_Y, &src, 3, 2).unwrap();
        let y = overlay.plane(PLANE_Y).unwrap();
        assert_eq!(y.row(0), &[1, 2, 3, 0]);
        assert_eq!(y.row(1), &[4, 5, 6, 0]);
    }

    #[test]
    fn rows_are_clamped_to_plane_and_source() {
        let mut overlay = Overlay::new(2, 2);
        let src = [7u8; 2 * 10];
        overlay.blit_plane(PLANE_Y, &src, 2, 10).unwrap();
        assert_eq!(overlay.plane(PLANE_Y).unwrap().data, vec![7; 4]);

        // Short final row.
        let mut overlay = Overlay::new(4, 2);
        overlay.blit_plane(PLANE_Y, &[1, 2, 3, 4, 5], 4, 2).unwrap();
        assert_eq!(overlay.plane(PLANE_Y).unwrap().row(1), &[5, 0, 0, 0]);
    }

    #[test]
    fn invalid_plane_is_an_error() {
        let mut overlay = Overlay::new(2, 2);
        let err = overlay.blit_plane(4, &[0; 4], 2, 2).unwrap_err();
        assert!(matches!(err, PresentError::InvalidPlane(4)));
    }

    #[test]
    fn odd_sizes_round_chroma_up() {
        let overlay = Overlay::new(5, 3);
        assert_eq!(overlay.plane(PLANE_U).unwrap().pitch, 3);
        assert_eq!(overlay.plane(PLANE_U).unwrap().rows, 2);
        assert_eq!(overlay.plane(PLANE_ALPHA).unwrap().rows, 3);
    }

    #[test]
    fn frame_chroma_lands_in_yv12_order() {
        let y = [10u8; 4 * 4];
        let u = [20u8; 2 * 2];
        let v = [30u8; 2 * 2];
        let frame = DecodedFrame {
            width: 4,
            height: 4,
            planes: [plane(&y, 4, 4), plane(&u, 2, 2), plane(&v, 2, 2)],
        };
        let mut overlay = Overlay::new(4, 4);
        overlay.blit_frame(&frame).unwrap();
        assert!(overlay.plane(PLANE_Y).unwrap().data.iter().all(|b| *b == 10));
        assert!(overlay.plane(PLANE_V).unwrap().data.iter().all(|b| *b == 30));
        assert!(overlay.plane(PLANE_U).unwrap().data.iter().all(|b| *b == 20));
    }

    #[test]
    fn alpha_modes_pick_destination_plane() {
        let luma = [42u8; 4];
        let chroma = [0u8; 1];
        let alpha = DecodedFrame {
            width: 2,
            height: 2,
            planes: [plane(&luma, 2, 2), plane(&chroma, 1, 1), plane(&chroma, 1, 1)],
        };

        let mut overlay = Overlay::new(2, 2);
        overlay.blit_alpha(&alpha, AlphaComposite::Mask).unwrap();
        assert_eq!(overlay.plane(PLANE_ALPHA).unwrap().data, vec![42; 4]);
        assert_eq!(overlay.plane(PLANE_Y).unwrap().data, vec![0; 4]);

        overlay.clear_alpha();
        overlay.blit_alpha(&alpha, AlphaComposite::LumaOverwrite).unwrap();
        assert_eq!(overlay.plane(PLANE_Y).unwrap().data, vec![42; 4]);
        assert_eq!(overlay.plane(PLANE_ALPHA).unwrap().data, vec![255; 4]);
    }

    #[test]
    fn surface_reuses_overlay_until_size_changes() {
        let mut surface = OverlaySurface::new();
        assert!(surface.end().is_err());

        surface.begin(4, 4).unwrap().blit_plane(PLANE_Y, &[5; 16], 4, 4).unwrap();
        assert!(surface.is_locked());
        assert_eq!(surface.end().unwrap().plane(PLANE_Y).unwrap().data[0], 5);

        assert_eq!(surface.begin(4, 4).unwrap().plane(PLANE_Y).unwrap().data[0], 5);
        surface.end().unwrap();
        assert_eq!(surface.begin(8, 4).unwrap().plane(PLANE_Y).unwrap().data[0], 0);
        assert!(surface.begin(0, 4).is_err());
    }
}
