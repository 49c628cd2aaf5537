//! Window presenter: winit window + wgpu renderer behind the `Presenter` trait.
//!
//! The event loop is pumped from the playback thread instead of owning it,
//! so input polling stays non-blocking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Fullscreen, Window, WindowId};

use crate::presenter::{InputEvent, Overlay, OverlaySurface, PresentError, Presenter};
use crate::render::GpuRenderer;

/// Pump iterations allowed for the window to appear.
const STARTUP_PUMPS: usize = 200;

pub fn map_key(code: KeyCode) -> Option<InputEvent> {
    match code {
        KeyCode::Escape => Some(InputEvent::Quit),
        KeyCode::Space => Some(InputEvent::ToggleFullscreen),
        _ => None,
    }
}

struct WindowState {
    title: String,
    initial_size: PhysicalSize<u32>,
    window: Option<Arc<Window>>,
    renderer: Option<GpuRenderer>,
    events: VecDeque<InputEvent>,
    init_error: Option<PresentError>,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attributes = Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(self.initial_size);
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.init_error = Some(PresentError::Init(format!("Window creation failed: {}", e)));
                event_loop.exit();
                return;
            }
        };
        match pollster::block_on(GpuRenderer::new(window.clone())) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => {
                self.init_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.events.push_back(InputEvent::Quit),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => {
                if let Some(input) = map_key(code) {
                    self.events.push_back(input);
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            _ => {}
        }
    }
}

pub struct WindowPresenter {
    event_loop: EventLoop<()>,
    state: WindowState,
    surface: OverlaySurface,
}

impl WindowPresenter {
    /// Open a window of `width` x `height` and wait for its renderer.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self, PresentError> {
        let event_loop = EventLoop::new().map_err(|e| PresentError::Init(e.to_string()))?;
        let mut presenter = Self {
            event_loop,
            state: WindowState {
                title: title.to_string(),
                initial_size: PhysicalSize::new(width.max(1), height.max(1)),
                window: None,
                renderer: None,
                events: VecDeque::new(),
                init_error: None,
            },
            surface: OverlaySurface::new(),
        };

        for _ in 0..STARTUP_PUMPS {
            let status = presenter
                .event_loop
                .pump_app_events(Some(Duration::from_millis(10)), &mut presenter.state);
            if let Some(e) = presenter.state.init_error.take() {
                return Err(e);
            }
            if presenter.state.renderer.is_some() {
                tracing::info!("Window opened at {}x{}", width, height);
                return Ok(presenter);
            }
            if let PumpStatus::Exit(code) = status {
                return Err(PresentError::Init(format!("Event loop exited with code {}", code)));
            }
        }
        Err(PresentError::Init("Window was never created".into()))
    }
}

impl Presenter for WindowPresenter {
    fn begin_frame(&mut self, width: u32, height: u32) -> Result<&mut Overlay, PresentError> {
        self.surface.begin(width, height)
    }

    fn end_frame(&mut self) -> Result<(), PresentError> {
        let overlay = self.surface.end()?;
        let renderer = self
            .state
            .renderer
            .as_mut()
            .ok_or_else(|| PresentError::Surface("renderer is gone".into()))?;
        renderer.upload(overlay);
        renderer.render()
    }

    fn poll_event(&mut self) -> Option<InputEvent> {
        if self.state.events.is_empty() {
            let status = self
                .event_loop
                .pump_app_events(Some(Duration::ZERO), &mut self.state);
            if let PumpStatus::Exit(_) = status {
                self.state.events.push_back(InputEvent::Quit);
            }
        }
        self.state.events.pop_front()
    }

    fn toggle_fullscreen(&mut self) {
        let Some(window) = &self.state.window else {
            return;
        };
        if window.fullscreen().is_some() {
            window.set_fullscreen(None);
            tracing::debug!("Leaving fullscreen");
        } else {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            tracing::debug!("Entering fullscreen");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bindings() {
        assert_eq!(map_key(KeyCode::Escape), Some(InputEvent::Quit));
        assert_eq!(map_key(KeyCode::Space), Some(InputEvent::ToggleFullscreen));
        assert_eq!(map_key(KeyCode::KeyQ), None);
    }
}
