// Window system collaborators
//
// Everything that talks to SDL lives here: window creation, monitor
// and cursor handles, gamepad queries and the event pump. All of it
// is main thread only; the instance asserts that at its boundaries.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sdl2::event::{Event, WindowEvent as SdlWindowEvent};

use crate::window::{WindowCreateInfo, WindowEvent};
use crate::{Result, SquallError};

lazy_static! {
    /// Instances alive in this process. The window system library is
    /// effectively process global, so creation and destruction of
    /// instances serialize on this.
    pub(crate) static ref INSTANCE_COUNT: Mutex<u64> = Mutex::new(0);
}

/// Shared mailbox the event pump sorts window events into, keyed by
/// the window system's window id. Windows drain their own queue.
pub(crate) type EventRegistry = Arc<Mutex<HashMap<u32, VecDeque<WindowEvent>>>>;

/// Video mode of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorVideoMode {
    pub size: (u32, u32),
    pub refresh_rate: u32,
}

/// A connected monitor.
#[derive(Debug, Clone)]
pub struct Monitor {
    pub(crate) m_index: u32,
    m_name: String,
    m_position: (i32, i32),
    m_size: (u32, u32),
    m_current_mode: MonitorVideoMode,
    m_modes: Vec<MonitorVideoMode>,
}

impl Monitor {
    pub fn name(&self) -> &str {
        &self.m_name
    }

    pub fn position(&self) -> (i32, i32) {
        self.m_position
    }

    pub fn size(&self) -> (u32, u32) {
        self.m_size
    }

    pub fn current_video_mode(&self) -> MonitorVideoMode {
        self.m_current_mode
    }

    pub fn video_modes(&self) -> &[MonitorVideoMode] {
        &self.m_modes
    }
}

/// A hardware cursor image.
pub struct Cursor {
    c_cursor: sdl2::mouse::Cursor,
    c_size: (u32, u32),
    c_hot_spot: (i32, i32),
}

impl Cursor {
    pub fn size(&self) -> (u32, u32) {
        self.c_size
    }

    pub fn hot_spot(&self) -> (i32, i32) {
        self.c_hot_spot
    }

    pub(crate) fn sdl_cursor(&self) -> &sdl2::mouse::Cursor {
        &self.c_cursor
    }
}

/// Gamepad slots, one per possible controller index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gamepad {
    Gamepad1 = 0,
    Gamepad2,
    Gamepad3,
    Gamepad4,
    Gamepad5,
    Gamepad6,
    Gamepad7,
    Gamepad8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamepadConnectionEvent {
    Connected,
    Disconnected,
}

/// Snapshot of one gamepad's buttons and axes.
#[derive(Debug, Clone, Copy, Default)]
pub struct GamepadState {
    pub buttons: [bool; 15],
    pub axes: [f32; 6],
}

pub type GamepadEventFn = Box<dyn Fn(Gamepad, GamepadConnectionEvent, &str)>;
pub type MonitorUpdateFn = Box<dyn Fn()>;

/// Events the pump produced that the instance has to act on.
pub(crate) struct PumpResults {
    pub monitors_changed: bool,
    pub gamepad_events: Vec<(u32, GamepadConnectionEvent, String)>,
}

pub(crate) struct WindowSystem {
    /// Held for its lifetime, SDL tears down with it.
    #[allow(dead_code)]
    ws_context: sdl2::Sdl,
    ws_video: sdl2::VideoSubsystem,
    ws_controller: sdl2::GameControllerSubsystem,
    ws_event_pump: RefCell<sdl2::EventPump>,
    /// Opened controller handles, kept so button state stays readable.
    ws_open_controllers: RefCell<HashMap<u32, sdl2::controller::GameController>>,
    ws_registry: EventRegistry,
}

impl WindowSystem {
    pub fn new() -> Result<Self> {
        let context = sdl2::init().map_err(|e| {
            log::error!("could not initialize the window system: {}", e);
            SquallError::WINDOW_SYSTEM_ERROR
        })?;
        let video = context.video().map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;
        let controller = context
            .game_controller()
            .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;
        let event_pump = context
            .event_pump()
            .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;

        Ok(WindowSystem {
            ws_context: context,
            ws_video: video,
            ws_controller: controller,
            ws_event_pump: RefCell::new(event_pump),
            ws_open_controllers: RefCell::new(HashMap::new()),
            ws_registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn registry(&self) -> EventRegistry {
        self.ws_registry.clone()
    }

    /// The instance extensions vulkan needs to present onto this
    /// window system. Queried through a hidden probe window since the
    /// window system only answers with a window in hand.
    pub fn required_instance_extensions(&self) -> Result<Vec<CString>> {
        let probe = self
            .ws_video
            .window("squall probe", 1, 1)
            .vulkan()
            .hidden()
            .build()
            .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;
        let names = probe
            .vulkan_instance_extensions()
            .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;
        Ok(names
            .into_iter()
            .map(|n| CString::new(n).unwrap())
            .collect())
    }

    /// Create the window described by `info`, vulkan capable.
    /// A non-zero fullscreen monitor index selects that monitor.
    pub fn create_window(&self, info: &WindowCreateInfo) -> Result<sdl2::video::Window> {
        if info.transparent_framebuffer {
            log::warn!("transparent framebuffers are not supported by this window system");
        }

        let mut builder = self
            .ws_video
            .window(&info.title, info.size.0, info.size.1);
        builder.vulkan();
        if info.resizeable {
            builder.resizable();
        }
        if !info.visible {
            builder.hidden();
        }
        if !info.decorated {
            builder.borderless();
        }
        if info.maximized {
            builder.maximized();
        }
        if info.fullscreen_monitor > 0 {
            // Land the window on the requested monitor before going
            // fullscreen there.
            match self.monitor(info.fullscreen_monitor - 1) {
                Some(monitor) => {
                    builder.position(monitor.m_position.0, monitor.m_position.1);
                }
                None => {
                    log::warn!(
                        "fullscreen monitor {} does not exist, using the primary one",
                        info.fullscreen_monitor
                    );
                }
            }
            builder.fullscreen();
        } else {
            builder.position_centered();
        }

        let mut window = builder.build().map_err(|e| {
            log::error!("could not create a window: {}", e);
            SquallError::WINDOW_SYSTEM_ERROR
        })?;

        if info.min_size != (0, 0) {
            let _ = window.set_minimum_size(info.min_size.0, info.min_size.1);
        }
        if info.max_size != (0, 0) {
            let _ = window.set_maximum_size(info.max_size.0, info.max_size.1);
        }
        if info.fullscreen_monitor > 0 && info.fullscreen_refresh_rate > 0 {
            let mode = sdl2::video::DisplayMode::new(
                sdl2::pixels::PixelFormatEnum::Unknown,
                info.size.0 as i32,
                info.size.1 as i32,
                info.fullscreen_refresh_rate as i32,
            );
            if let Err(e) = window.set_display_mode(mode) {
                log::warn!("could not apply the requested refresh rate: {}", e);
            }
        }
        if info.focused {
            window.raise();
        }
        Ok(window)
    }

    /// Start routing events to a window. Registration happens once
    /// the window object is fully constructed so an aborted creation
    /// leaves no trace here.
    pub fn register_window(&self, window_id: u32) {
        self.ws_registry
            .lock()
            .unwrap()
            .insert(window_id, VecDeque::new());
    }

    pub fn forget_window(&self, window_id: u32) {
        self.ws_registry.lock().unwrap().remove(&window_id);
    }

    pub fn open_window_count(&self) -> usize {
        self.ws_registry.lock().unwrap().len()
    }

    fn monitor(&self, index: u32) -> Option<Monitor> {
        let name = self.ws_video.display_name(index as i32).ok()?;
        let bounds = self.ws_video.display_bounds(index as i32).ok()?;
        let current = self.ws_video.desktop_display_mode(index as i32).ok()?;

        let mode_count = self.ws_video.num_display_modes(index as i32).ok()?;
        let mut modes = Vec::with_capacity(mode_count as usize);
        for m in 0..mode_count {
            if let Ok(mode) = self.ws_video.display_mode(index as i32, m) {
                modes.push(MonitorVideoMode {
                    size: (mode.w as u32, mode.h as u32),
                    refresh_rate: mode.refresh_rate as u32,
                });
            }
        }

        Some(Monitor {
            m_index: index,
            m_name: name,
            m_position: (bounds.x(), bounds.y()),
            m_size: (bounds.width(), bounds.height()),
            m_current_mode: MonitorVideoMode {
                size: (current.w as u32, current.h as u32),
                refresh_rate: current.refresh_rate as u32,
            },
            m_modes: modes,
        })
    }

    pub fn monitors(&self) -> Vec<Monitor> {
        let count = self.ws_video.num_video_displays().unwrap_or(0);
        (0..count as u32).filter_map(|i| self.monitor(i)).collect()
    }

    pub fn primary_monitor(&self) -> Option<Monitor> {
        self.monitor(0)
    }

    /// Cursor from an image file.
    pub fn create_cursor_from_file(
        &self,
        path: &Path,
        hot_spot: (i32, i32),
    ) -> Result<Cursor> {
        let decoded = image::open(path)
            .map_err(|e| {
                log::warn!("could not decode cursor image {:?}: {}", path, e);
                SquallError::RESOURCE_LOAD_FAILED
            })?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        self.create_cursor_from_pixels(&decoded.into_raw(), (width, height), hot_spot)
    }

    /// Cursor from raw RGBA8 pixels.
    pub fn create_cursor_from_pixels(
        &self,
        pixels: &[u8],
        size: (u32, u32),
        hot_spot: (i32, i32),
    ) -> Result<Cursor> {
        if pixels.len() != (size.0 * size.1 * 4) as usize {
            return Err(SquallError::INVALID_CREATE_INFO);
        }

        let mut owned = pixels.to_vec();
        let surface = sdl2::surface::Surface::from_data(
            owned.as_mut_slice(),
            size.0,
            size.1,
            size.0 * 4,
            sdl2::pixels::PixelFormatEnum::ABGR8888,
        )
        .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;

        let cursor = sdl2::mouse::Cursor::from_surface(&surface, hot_spot.0, hot_spot.1)
            .map_err(|_| SquallError::WINDOW_SYSTEM_ERROR)?;
        Ok(Cursor {
            c_cursor: cursor,
            c_size: size,
            c_hot_spot: hot_spot,
        })
    }

    pub fn is_gamepad_present(&self, gamepad: Gamepad) -> bool {
        let index = gamepad as u32;
        match self.ws_controller.num_joysticks() {
            Ok(n) => index < n && self.ws_controller.is_game_controller(index),
            Err(_) => false,
        }
    }

    pub fn gamepad_name(&self, gamepad: Gamepad) -> String {
        let index = gamepad as u32;
        self.ws_controller.name_for_index(index).unwrap_or_default()
    }

    /// Read the current button and axis state of a gamepad.
    pub fn query_gamepad_state(&self, gamepad: Gamepad) -> GamepadState {
        use sdl2::controller::{Axis, Button};

        let index = gamepad as u32;
        let mut open = self.ws_open_controllers.borrow_mut();
        if !open.contains_key(&index) {
            match self.ws_controller.open(index) {
                Ok(c) => {
                    open.insert(index, c);
                }
                Err(_) => return GamepadState::default(),
            }
        }
        let controller = &open[&index];

        let buttons = [
            Button::A,
            Button::B,
            Button::X,
            Button::Y,
            Button::LeftShoulder,
            Button::RightShoulder,
            Button::Back,
            Button::Start,
            Button::Guide,
            Button::LeftStick,
            Button::RightStick,
            Button::DPadUp,
            Button::DPadRight,
            Button::DPadDown,
            Button::DPadLeft,
        ];
        let axes = [
            Axis::LeftX,
            Axis::LeftY,
            Axis::RightX,
            Axis::RightY,
            Axis::TriggerLeft,
            Axis::TriggerRight,
        ];

        let mut state = GamepadState::default();
        for (i, b) in buttons.iter().enumerate() {
            state.buttons[i] = controller.button(*b);
        }
        for (i, a) in axes.iter().enumerate() {
            state.axes[i] = controller.axis(*a) as f32 / i16::MAX as f32;
        }
        state
    }

    /// Drain the window system event queue, sorting per-window events
    /// into the registry and returning instance level happenings.
    pub fn pump_events(&self) -> PumpResults {
        let mut results = PumpResults {
            monitors_changed: false,
            gamepad_events: Vec::new(),
        };

        let mut pump = self.ws_event_pump.borrow_mut();
        for event in pump.poll_iter() {
            match event {
                Event::Window {
                    window_id,
                    win_event,
                    ..
                } => {
                    let translated = match win_event {
                        SdlWindowEvent::Close => Some(WindowEvent::CloseRequested),
                        SdlWindowEvent::SizeChanged(w, h) | SdlWindowEvent::Resized(w, h) => {
                            Some(WindowEvent::Resized(w.max(0) as u32, h.max(0) as u32))
                        }
                        SdlWindowEvent::FocusGained => Some(WindowEvent::FocusChanged(true)),
                        SdlWindowEvent::FocusLost => Some(WindowEvent::FocusChanged(false)),
                        SdlWindowEvent::Minimized => Some(WindowEvent::Iconified(true)),
                        SdlWindowEvent::Restored => Some(WindowEvent::Iconified(false)),
                        _ => None,
                    };
                    if let Some(e) = translated {
                        if let Some(queue) =
                            self.ws_registry.lock().unwrap().get_mut(&window_id)
                        {
                            queue.push_back(e);
                        }
                    }
                }
                Event::KeyDown {
                    window_id,
                    scancode: Some(code),
                    ..
                } => self.push_window_event(
                    window_id,
                    WindowEvent::Key {
                        scancode: code as i32,
                        pressed: true,
                    },
                ),
                Event::KeyUp {
                    window_id,
                    scancode: Some(code),
                    ..
                } => self.push_window_event(
                    window_id,
                    WindowEvent::Key {
                        scancode: code as i32,
                        pressed: false,
                    },
                ),
                Event::MouseButtonDown {
                    window_id,
                    mouse_btn,
                    ..
                } => self.push_window_event(
                    window_id,
                    WindowEvent::MouseButton {
                        button: mouse_btn as u8,
                        pressed: true,
                    },
                ),
                Event::MouseButtonUp {
                    window_id,
                    mouse_btn,
                    ..
                } => self.push_window_event(
                    window_id,
                    WindowEvent::MouseButton {
                        button: mouse_btn as u8,
                        pressed: false,
                    },
                ),
                Event::MouseMotion {
                    window_id, x, y, ..
                } => self.push_window_event(
                    window_id,
                    WindowEvent::CursorMoved(x as f64, y as f64),
                ),
                Event::MouseWheel {
                    window_id, x, y, ..
                } => self
                    .push_window_event(window_id, WindowEvent::Scroll(x as f32, y as f32)),
                Event::Display { .. } => {
                    results.monitors_changed = true;
                }
                Event::ControllerDeviceAdded { which, .. } => {
                    let name = self.ws_controller.name_for_index(which).unwrap_or_default();
                    results
                        .gamepad_events
                        .push((which, GamepadConnectionEvent::Connected, name));
                }
                Event::ControllerDeviceRemoved { which, .. } => {
                    self.ws_open_controllers.borrow_mut().remove(&which);
                    results
                        .gamepad_events
                        .push((which, GamepadConnectionEvent::Disconnected, String::new()));
                }
                _ => (),
            }
        }
        results
    }

    fn push_window_event(&self, window_id: u32, event: WindowEvent) {
        if let Some(queue) = self.ws_registry.lock().unwrap().get_mut(&window_id) {
            queue.push_back(event);
        }
    }
}
