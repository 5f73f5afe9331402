// Wayland overlay module
// Layer-shell surfaces, input routing, timers and CPU rendering for the widget

use crate::animator::RESIZE_TICK;
use crate::geometry::{Point, Size, WindowGeometry};
use crate::image_loader::{AnimatedImage, ImageError, Playback};
use crate::mask::RoundedMask;
use crate::panel::{
    KeyInput, PanelIntent, PanelModel, PanelRenderer, PANEL_HEIGHT, PANEL_WIDTH,
};
use crate::session::{ControlPanel, OverlaySurface, SessionController};
use crate::store::OpacityLevel;
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use smithay_client_toolkit::{
    compositor::{CompositorHandler, CompositorState, Region},
    delegate_compositor, delegate_keyboard, delegate_layer, delegate_output, delegate_pointer,
    delegate_registry, delegate_seat, delegate_shm,
    output::{OutputHandler, OutputState},
    reexports::{
        calloop::{
            timer::{TimeoutAction, Timer},
            EventLoop, LoopHandle, RegistrationToken,
        },
        calloop_wayland_source::WaylandSource,
    },
    registry::{ProvidesRegistryState, RegistryState},
    registry_handlers,
    seat::{
        keyboard::{KeyEvent, KeyboardHandler, Keysym, Modifiers},
        pointer::{PointerEvent, PointerEventKind, PointerHandler},
        Capability, SeatHandler, SeatState,
    },
    shell::{
        wlr_layer::{
            Anchor, KeyboardInteractivity, Layer, LayerShell, LayerShellHandler, LayerSurface,
            LayerSurfaceConfigure,
        },
        WaylandSurface,
    },
    shm::{
        slot::{Buffer, SlotPool},
        Shm, ShmHandler,
    },
};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};
use wayland_client::{
    globals::registry_queue_init,
    protocol::{wl_keyboard, wl_output, wl_pointer, wl_seat, wl_shm, wl_surface},
    Connection, QueueHandle,
};

/// Mouse button constants
const BTN_LEFT: u32 = 272;
const BTN_RIGHT: u32 = 273;

/// Opacity adjustment step for scroll wheel, in percent
const OPACITY_STEP: i32 = 5;

/// Window size used when no geometry was saved
pub const FALLBACK_SIZE: Size = Size::new(200, 200);

/// Panel fade frame interval
const PANEL_FRAME: Duration = Duration::from_millis(16);

/// Fill shown until an image is loaded (BGRA)
const PLACEHOLDER: [u8; 4] = [70, 90, 60, 200];

/// Own size requests kept until the compositor echoes them back
const MAX_PENDING_SIZES: usize = 256;

/// Sizes this client asked for that no configure has answered yet
#[derive(Debug, Default)]
struct RequestedSizes {
    pending: VecDeque<Size>,
}

impl RequestedSizes {
    fn record(&mut self, size: Size) {
        if self.pending.len() == MAX_PENDING_SIZES {
            self.pending.pop_front();
        }
        self.pending.push_back(size);
    }

    /// Whether `size` answers one of our own requests. Configures arrive in
    /// request order, so older requests are settled along with it.
    fn acknowledge(&mut self, size: Size) -> bool {
        match self.pending.iter().position(|pending| *pending == size) {
            Some(index) => {
                self.pending.drain(..=index);
                true
            }
            None => false,
        }
    }
}

/// Stride and byte length of an ARGB8888 buffer, or `None` when the size
/// cannot be a window
fn buffer_layout(size: Size) -> Option<(i32, usize)> {
    if !size.is_valid() {
        return None;
    }
    let stride = size.width.checked_mul(4)?;
    let len = usize::try_from(stride)
        .ok()?
        .checked_mul(usize::try_from(size.height).ok()?)?;
    Some((stride, len))
}

/// The image surface: everything the session drives through `OverlaySurface`
/// and `ControlPanel`
struct OverlayWindow {
    compositor_state: CompositorState,
    shm: Shm,
    loop_handle: LoopHandle<'static, WaylandApp>,

    layer_surface: LayerSurface,
    pool: Option<SlotPool>,
    buffer: Option<Buffer>,
    size: Size,
    requested: RequestedSizes,
    configured: bool,

    mask: RoundedMask,
    alpha: f32,
    playback: Option<Playback>,
    frame_timer: Option<RegistrationToken>,

    panel: PanelModel,

    needs_redraw: bool,
    panel_dirty: bool,
}

impl OverlayWindow {
    fn new(
        compositor_state: CompositorState,
        shm: Shm,
        loop_handle: LoopHandle<'static, WaylandApp>,
        layer_surface: LayerSurface,
    ) -> Self {
        Self {
            compositor_state,
            shm,
            loop_handle,
            layer_surface,
            pool: None,
            buffer: None,
            size: FALLBACK_SIZE,
            requested: RequestedSizes::default(),
            configured: false,
            mask: RoundedMask::for_size(FALLBACK_SIZE.width, FALLBACK_SIZE.height),
            alpha: OpacityLevel::DEFAULT.alpha(),
            playback: None,
            frame_timer: None,
            panel: PanelModel::new(),
            needs_redraw: false,
            panel_dirty: false,
        }
    }

    fn cancel_frame_timer(&mut self) {
        if let Some(token) = self.frame_timer.take() {
            self.loop_handle.remove(token);
        }
    }

    fn schedule_frame(&mut self, delay: Option<Duration>) {
        self.cancel_frame_timer();
        let Some(delay) = delay else {
            return;
        };
        match self
            .loop_handle
            .insert_source(Timer::from_duration(delay), |_, _, app| app.advance_frame())
        {
            Ok(token) => self.frame_timer = Some(token),
            Err(err) => error!("Failed to schedule next GIF frame: {}", err.error),
        }
    }

    /// Draw the current frame to the surface buffer
    fn draw(&mut self) {
        if !self.configured || !self.needs_redraw {
            return;
        }

        let (width, height) = (self.size.width, self.size.height);
        let Some((stride, buffer_size)) = buffer_layout(self.size) else {
            error!("Refusing to draw a {}x{} overlay", width, height);
            self.needs_redraw = false;
            return;
        };

        if self.pool.is_none() {
            match SlotPool::new(buffer_size, &self.shm) {
                Ok(pool) => self.pool = Some(pool),
                Err(e) => {
                    error!("Failed to create slot pool: {}. Buffer size: {} bytes", e, buffer_size);
                    return;
                }
            }
        }
        let Some(pool) = self.pool.as_mut() else {
            return;
        };

        if pool.len() < buffer_size {
            if let Err(e) = pool.resize(buffer_size) {
                error!("Failed to resize pool to {} bytes: {}", buffer_size, e);
                self.pool = None;
                return;
            }
        }

        let (buffer, canvas) =
            match pool.create_buffer(width, height, stride, wl_shm::Format::Argb8888) {
                Ok(buf) => buf,
                Err(e) => {
                    error!("Failed to create buffer {}x{}: {}", width, height, e);
                    return;
                }
            };

        render_overlay(
            canvas,
            width,
            height,
            self.playback.as_ref(),
            &self.mask,
            self.alpha,
        );

        let surface = self.layer_surface.wl_surface();
        if let Err(e) = buffer.attach_to(surface) {
            error!("Failed to attach buffer: {:?}", e);
            return;
        }
        surface.damage_buffer(0, 0, width, height);
        surface.commit();

        self.buffer = Some(buffer);
        self.needs_redraw = false;
    }
}

impl OverlaySurface for OverlayWindow {
    fn resize(&mut self, size: Size) {
        self.size = size;
        self.requested.record(size);
        self.layer_surface
            .set_size(size.width as u32, size.height as u32);
        self.layer_surface.commit();
        self.needs_redraw = true;
    }

    fn move_to(&mut self, position: Point) {
        // layer-shell places the surface through its top/left margins
        self.layer_surface.set_margin(position.y, 0, 0, position.x);
        self.layer_surface.commit();
    }

    fn apply_mask(&mut self, mask: &RoundedMask) {
        self.mask = mask.clone();
        match Region::new(&self.compositor_state) {
            Ok(region) => {
                for rect in mask.rects() {
                    region.add(rect.x, rect.y, rect.width, rect.height);
                }
                self.layer_surface
                    .wl_surface()
                    .set_input_region(Some(region.wl_region()));
            }
            Err(e) => warn!("Failed to create input region: {}", e),
        }
        self.needs_redraw = true;
    }

    fn apply_opacity(&mut self, opacity: OpacityLevel) {
        self.alpha = opacity.alpha();
        self.needs_redraw = true;
    }

    fn load_image(&mut self, path: &Path) -> Result<(), ImageError> {
        let image = AnimatedImage::load(path)?;
        self.cancel_frame_timer();
        self.playback = Some(Playback::new(image));
        self.needs_redraw = true;
        Ok(())
    }

    fn scale_image(&mut self, size: Size) {
        if let Some(playback) = self.playback.as_mut() {
            playback.scale_to(size.width.max(1) as u32, size.height.max(1) as u32);
            self.needs_redraw = true;
        }
    }

    fn start_image(&mut self) {
        let delay = self.playback.as_mut().and_then(Playback::start);
        self.schedule_frame(delay);
        self.needs_redraw = true;
    }
}

impl ControlPanel for OverlayWindow {
    fn set_move_mode(&mut self, enabled: bool) {
        self.panel.set_move_mode(enabled);
        self.panel_dirty = true;
    }

    fn set_autostart(&mut self, enabled: bool) {
        self.panel.set_autostart(enabled);
        self.panel_dirty = true;
    }

    fn set_opacity(&mut self, opacity: OpacityLevel) {
        ControlPanel::set_opacity(&mut self.panel, opacity);
        self.panel_dirty = true;
    }

    fn show_error(&mut self, message: &str) {
        self.panel.show_error(message);
        self.panel_dirty = true;
    }
}

/// The control panel's own layer surface, alive while shown or fading out
struct PanelSurface {
    layer: LayerSurface,
    pool: Option<SlotPool>,
    buffer: Option<Buffer>,
    configured: bool,
}

/// Main Wayland application state
struct WaylandApp {
    // Registry state
    registry_state: RegistryState,
    // Seat state for input handling
    seat_state: SeatState,
    // Output state for display info
    output_state: OutputState,
    // Layer shell for the panel surface
    layer_shell: LayerShell,
    qh: QueueHandle<WaylandApp>,

    session: SessionController,
    window: OverlayWindow,

    panel_surface: Option<PanelSurface>,
    panel_renderer: PanelRenderer,
    fade_timer: Option<RegistrationToken>,
    resize_timer: Option<RegistrationToken>,

    // Pointer state (surface-local position)
    pointer_pos: (f64, f64),
    primary_held: bool,

    should_exit: bool,
}

impl WaylandApp {
    fn pointer_global(&self) -> Point {
        let origin = self.session.geometry().position();
        origin + Point::new(self.pointer_pos.0 as i32, self.pointer_pos.1 as i32)
    }

    fn is_main_surface(&self, surface: &wl_surface::WlSurface) -> bool {
        self.window.layer_surface.wl_surface() == surface
    }

    fn is_panel_surface(&self, surface: &wl_surface::WlSurface) -> bool {
        self.panel_surface
            .as_ref()
            .is_some_and(|panel| panel.layer.wl_surface() == surface)
    }

    fn advance_frame(&mut self) -> TimeoutAction {
        let next = self.window.playback.as_mut().and_then(Playback::advance);
        match next {
            Some(delay) => {
                self.window.needs_redraw = true;
                TimeoutAction::ToDuration(delay)
            }
            None => {
                self.window.frame_timer = None;
                TimeoutAction::Drop
            }
        }
    }

    fn start_resize_ticks(&mut self) {
        if self.resize_timer.is_some() {
            return;
        }
        let timer = Timer::from_duration(RESIZE_TICK);
        let inserted = self.window.loop_handle.insert_source(timer, |_, _, app| {
            if app.session.tick_resize(&mut app.window) {
                TimeoutAction::ToDuration(RESIZE_TICK)
            } else {
                app.resize_timer = None;
                TimeoutAction::Drop
            }
        });
        match inserted {
            Ok(token) => self.resize_timer = Some(token),
            Err(err) => error!("Failed to start resize animation: {}", err.error),
        }
    }

    fn toggle_panel(&mut self) {
        self.window.panel.toggle(Instant::now());
        if self.window.panel.is_shown() && self.panel_surface.is_none() {
            self.create_panel_surface();
        }
        info!(
            "Control panel {}",
            if self.window.panel.is_shown() { "shown" } else { "hidden" }
        );
        self.start_panel_fade();
    }

    fn create_panel_surface(&mut self) {
        let surface = self.window.compositor_state.create_surface(&self.qh);
        let layer = self.layer_shell.create_layer_surface(
            &self.qh,
            surface,
            Layer::Overlay,
            Some("kiwi-widget-panel"),
            None,
        );
        // no anchor: the compositor centers the panel on the output
        layer.set_size(PANEL_WIDTH, PANEL_HEIGHT);
        layer.set_keyboard_interactivity(KeyboardInteractivity::OnDemand);
        layer.commit();
        self.panel_surface = Some(PanelSurface {
            layer,
            pool: None,
            buffer: None,
            configured: false,
        });
    }

    fn start_panel_fade(&mut self) {
        self.window.panel_dirty = true;
        if self.fade_timer.is_some() {
            return;
        }
        let timer = Timer::from_duration(PANEL_FRAME);
        match self
            .window
            .loop_handle
            .insert_source(timer, |_, _, app| app.fade_step())
        {
            Ok(token) => self.fade_timer = Some(token),
            Err(err) => error!("Failed to start panel fade: {}", err.error),
        }
    }

    fn fade_step(&mut self) -> TimeoutAction {
        let now = Instant::now();
        self.window.panel_dirty = true;
        if self.window.panel.is_gone(now) {
            self.panel_surface = None;
            self.fade_timer = None;
            return TimeoutAction::Drop;
        }
        if self.window.panel.is_fading(now) {
            TimeoutAction::ToDuration(PANEL_FRAME)
        } else {
            self.fade_timer = None;
            TimeoutAction::Drop
        }
    }

    fn handle_intent(&mut self, intent: PanelIntent) {
        debug!("Panel intent: {:?}", intent);
        match intent {
            PanelIntent::Close => {
                info!("Close requested");
                self.should_exit = true;
            }
            PanelIntent::ToggleMove => {
                self.session.toggle_move_mode(&mut self.window);
            }
            PanelIntent::ResizeRequest(text) => {
                if let Ok(true) = self.session.submit_resize(&mut self.window, &text) {
                    self.start_resize_ticks();
                }
            }
            PanelIntent::ChangeImageRequest(url) => {
                if let Err(err) = self.session.request_image_change(&mut self.window, &url) {
                    debug!("Image change from the panel failed: {}", err);
                }
            }
            PanelIntent::Restart => {
                if self.session.restart(&mut self.window).is_ok() {
                    self.should_exit = true;
                }
            }
            PanelIntent::ToggleAutostart(enabled) => {
                self.session.toggle_autostart(&mut self.window, enabled);
            }
            PanelIntent::OpacityChanged(value) => {
                self.session.set_opacity(&mut self.window, value);
            }
        }
        self.window.panel_dirty = true;
    }

    fn draw_panel(&mut self) {
        self.window.panel_dirty = false;
        let Some(panel_surface) = self.panel_surface.as_mut() else {
            return;
        };
        if !panel_surface.configured {
            return;
        }

        let stride = PANEL_WIDTH as i32 * 4;
        let buffer_size = (stride * PANEL_HEIGHT as i32) as usize;
        if panel_surface.pool.is_none() {
            match SlotPool::new(buffer_size, &self.window.shm) {
                Ok(pool) => panel_surface.pool = Some(pool),
                Err(e) => {
                    error!("Failed to create panel pool: {}", e);
                    return;
                }
            }
        }
        let Some(pool) = panel_surface.pool.as_mut() else {
            return;
        };
        let (buffer, canvas) = match pool.create_buffer(
            PANEL_WIDTH as i32,
            PANEL_HEIGHT as i32,
            stride,
            wl_shm::Format::Argb8888,
        ) {
            Ok(buf) => buf,
            Err(e) => {
                error!("Failed to create panel buffer: {}", e);
                return;
            }
        };

        let alpha = self.window.panel.alpha(Instant::now());
        self.panel_renderer.render(&self.window.panel, canvas, alpha);

        let surface = panel_surface.layer.wl_surface();
        if let Err(e) = buffer.attach_to(surface) {
            error!("Failed to attach panel buffer: {:?}", e);
            return;
        }
        surface.damage_buffer(0, 0, PANEL_WIDTH as i32, PANEL_HEIGHT as i32);
        surface.commit();
        panel_surface.buffer = Some(buffer);
    }

    /// Flush pending drawing after each batch of events
    fn redraw(&mut self) {
        self.window.draw();
        if self.window.panel_dirty {
            self.draw_panel();
        }
    }

    fn overlay_pointer(&mut self, event: &PointerEvent) {
        match event.kind {
            PointerEventKind::Enter { .. } => {
                self.pointer_pos = event.position;
            }
            PointerEventKind::Leave { .. } => {
                debug!("Pointer left overlay");
                self.primary_held = false;
                self.session.pointer_release();
            }
            PointerEventKind::Motion { .. } => {
                self.pointer_pos = event.position;
                let pointer = self.pointer_global();
                self.session
                    .pointer_motion(&mut self.window, pointer, self.primary_held);
            }
            PointerEventKind::Press { button, .. } => {
                self.pointer_pos = event.position;
                if button == BTN_LEFT {
                    self.primary_held = true;
                    let pointer = self.pointer_global();
                    self.session.pointer_press(pointer, true);
                } else if button == BTN_RIGHT {
                    self.toggle_panel();
                }
            }
            PointerEventKind::Release { button, .. } => {
                if button == BTN_LEFT {
                    self.primary_held = false;
                    if self.session.pointer_release() {
                        debug!("Drag finished at {:?}", self.session.geometry().position());
                    }
                }
            }
            PointerEventKind::Axis { vertical, .. } => {
                // Scroll wheel to adjust opacity
                if vertical.absolute != 0.0 {
                    let delta = if vertical.absolute > 0.0 {
                        -OPACITY_STEP
                    } else {
                        OPACITY_STEP
                    };
                    self.session.nudge_opacity(&mut self.window, delta);
                }
            }
        }
    }

    fn panel_pointer(&mut self, event: &PointerEvent) {
        let (x, y) = event.position;
        let intent = match event.kind {
            PointerEventKind::Leave { .. } => {
                self.window.panel.pointer_leave();
                self.window.panel_dirty = true;
                None
            }
            PointerEventKind::Enter { .. } | PointerEventKind::Motion { .. } => {
                let (intent, redraw) = self.window.panel.pointer_motion(x, y);
                self.window.panel_dirty |= redraw;
                intent
            }
            PointerEventKind::Press { button, .. } if button == BTN_LEFT => {
                let size = self.session.geometry().size();
                let intent = self.window.panel.pointer_press(x, y, size);
                self.window.panel_dirty = true;
                intent
            }
            PointerEventKind::Release { button, .. } if button == BTN_LEFT => {
                self.window.panel.pointer_release();
                None
            }
            _ => None,
        };
        if let Some(intent) = intent {
            self.handle_intent(intent);
        }
    }
}

// Implement required traits for smithay-client-toolkit

impl CompositorHandler for WaylandApp {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_factor: i32,
    ) {
        debug!("Scale factor changed");
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _new_transform: wl_output::Transform,
    ) {
        debug!("Transform changed");
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _time: u32,
    ) {
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &wl_surface::WlSurface,
        _output: &wl_output::WlOutput,
    ) {
    }
}

impl OutputHandler for WaylandApp {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("New output detected");
    }

    fn update_output(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("Output updated");
    }

    fn output_destroyed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _output: wl_output::WlOutput,
    ) {
        debug!("Output destroyed");
    }
}

impl LayerShellHandler for WaylandApp {
    fn closed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, layer: &LayerSurface) {
        if self.is_panel_surface(layer.wl_surface()) {
            info!("Panel surface closed by compositor");
            self.panel_surface = None;
            self.window.panel.hide(Instant::now());
            return;
        }
        info!("Layer surface closed");
        self.should_exit = true;
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        layer: &LayerSurface,
        configure: LayerSurfaceConfigure,
        _serial: u32,
    ) {
        debug!("Layer surface configured: {:?}", configure);

        if self.is_panel_surface(layer.wl_surface()) {
            if let Some(panel_surface) = self.panel_surface.as_mut() {
                panel_surface.configured = true;
            }
            self.window.panel_dirty = true;
            return;
        }
        if !self.is_main_surface(layer.wl_surface()) {
            return;
        }

        // Only accept the compositor's size when it overrides ours and no
        // animation is driving the size. Late echoes of our own requests
        // are not overrides.
        let (width, height) = configure.new_size;
        if width > 0 && height > 0 {
            let size = Size::new(width as i32, height as i32);
            let echoed = self.window.requested.acknowledge(size);
            if !echoed
                && !self.session.is_animating()
                && size != self.session.geometry().size()
            {
                info!("Compositor resized overlay to {}x{}", width, height);
                self.window.size = size;
                self.session.on_resize(&mut self.window, size);
            }
        }

        self.window.configured = true;
        self.window.needs_redraw = true;
    }
}

impl SeatHandler for WaylandApp {
    fn seat_state(&mut self) -> &mut SeatState {
        &mut self.seat_state
    }

    fn new_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _seat: wl_seat::WlSeat) {
        debug!("New seat");
    }

    fn new_capability(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: wl_seat::WlSeat,
        capability: Capability,
    ) {
        debug!("New capability: {:?}", capability);

        if capability == Capability::Keyboard {
            if let Err(e) = self.seat_state.get_keyboard(qh, &seat, None) {
                error!("Failed to get keyboard: {}", e);
            }
        }
        if capability == Capability::Pointer {
            if let Err(e) = self.seat_state.get_pointer(qh, &seat) {
                error!("Failed to get pointer: {}", e);
            }
        }
    }

    fn remove_capability(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _seat: wl_seat::WlSeat,
        _capability: Capability,
    ) {
        debug!("Capability removed");
    }

    fn remove_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _seat: wl_seat::WlSeat) {
        debug!("Seat removed");
    }
}

impl KeyboardHandler for WaylandApp {
    fn enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _surface: &wl_surface::WlSurface,
        _serial: u32,
        _raw: &[u32],
        _keysyms: &[Keysym],
    ) {
        debug!("Keyboard entered surface");
    }

    fn leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _surface: &wl_surface::WlSurface,
        _serial: u32,
    ) {
        debug!("Keyboard left surface");
    }

    fn press_key(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _serial: u32,
        event: KeyEvent,
    ) {
        if !self.window.panel.is_shown() {
            return;
        }
        let input = match event.keysym {
            Keysym::Return | Keysym::KP_Enter => KeyInput::Enter,
            Keysym::BackSpace => KeyInput::Backspace,
            Keysym::Escape => KeyInput::Escape,
            _ => match event.utf8 {
                Some(text) if !text.is_empty() => KeyInput::Text(text),
                _ => return,
            },
        };

        let intent = self.window.panel.key(input, Instant::now());
        self.window.panel_dirty = true;
        if let Some(intent) = intent {
            self.handle_intent(intent);
        }
        if !self.window.panel.is_shown() {
            self.start_panel_fade();
        }
    }

    fn release_key(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _serial: u32,
        _event: KeyEvent,
    ) {
    }

    fn update_modifiers(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _keyboard: &wl_keyboard::WlKeyboard,
        _serial: u32,
        _modifiers: Modifiers,
        _layout: u32,
    ) {
    }
}

impl PointerHandler for WaylandApp {
    fn pointer_frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _pointer: &wl_pointer::WlPointer,
        events: &[PointerEvent],
    ) {
        for event in events {
            if self.is_panel_surface(&event.surface) {
                self.panel_pointer(event);
            } else if self.is_main_surface(&event.surface) {
                self.overlay_pointer(event);
            }
        }
    }
}

impl ShmHandler for WaylandApp {
    fn shm_state(&mut self) -> &mut Shm {
        &mut self.window.shm
    }
}

impl ProvidesRegistryState for WaylandApp {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry_state
    }

    registry_handlers![OutputState, SeatState];
}

// Delegate macros
delegate_compositor!(WaylandApp);
delegate_output!(WaylandApp);
delegate_layer!(WaylandApp);
delegate_seat!(WaylandApp);
delegate_keyboard!(WaylandApp);
delegate_pointer!(WaylandApp);
delegate_shm!(WaylandApp);
delegate_registry!(WaylandApp);

/// Run the widget until it is closed or restarted
pub fn run(session: SessionController) -> Result<()> {
    info!("Connecting to Wayland display");

    let conn = Connection::connect_to_env().context("Failed to connect to Wayland display")?;
    let (globals, mut event_queue) =
        registry_queue_init(&conn).context("Failed to initialize registry")?;
    let qh = event_queue.handle();

    let mut event_loop: EventLoop<'static, WaylandApp> =
        EventLoop::try_new().context("Failed to create event loop")?;

    // Initialize required globals
    let compositor_state =
        CompositorState::bind(&globals, &qh).context("Failed to bind compositor")?;
    let layer_shell = LayerShell::bind(&globals, &qh).context("Failed to bind layer shell")?;
    let shm = Shm::bind(&globals, &qh).context("Failed to bind shm")?;

    // The overlay layer keeps the widget above normal windows
    let surface = compositor_state.create_surface(&qh);
    let layer_surface = layer_shell.create_layer_surface(
        &qh,
        surface,
        Layer::Overlay,
        Some("kiwi-widget"),
        None,
    );
    layer_surface.set_anchor(Anchor::TOP | Anchor::LEFT);
    layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);

    let window = OverlayWindow::new(compositor_state, shm, event_loop.handle(), layer_surface);
    let mut app = WaylandApp {
        registry_state: RegistryState::new(&globals),
        seat_state: SeatState::new(&globals, &qh),
        output_state: OutputState::new(&globals, &qh),
        layer_shell,
        qh: qh.clone(),
        session,
        window,
        panel_surface: None,
        panel_renderer: PanelRenderer::new(),
        fade_timer: None,
        resize_timer: None,
        pointer_pos: (0.0, 0.0),
        primary_held: false,
        should_exit: false,
    };

    // Dispatch once to get output info
    event_queue
        .roundtrip(&mut app)
        .context("Initial Wayland roundtrip failed")?;

    let display = get_display_dimensions(&app.output_state);
    info!("Display dimensions: {}x{}", display.width, display.height);

    let fallback = WindowGeometry::centered(FALLBACK_SIZE, display);
    app.session.initialize(&mut app.window, fallback);

    WaylandSource::new(conn, event_queue)
        .insert(event_loop.handle())
        .map_err(|err| anyhow!("Failed to watch the Wayland connection: {}", err.error))?;

    info!("Starting event loop");
    info!("Controls: Right-click for the panel, Scroll to adjust opacity");

    loop {
        event_loop
            .dispatch(None, &mut app)
            .context("Event loop dispatch failed")?;
        app.redraw();

        if app.should_exit {
            info!("Exiting application");
            break;
        }
    }

    Ok(())
}

/// Get display dimensions from the output state
fn get_display_dimensions(output_state: &OutputState) -> Size {
    for output in output_state.outputs() {
        if let Some(info) = output_state.info(&output) {
            if let Some(mode) = info.modes.iter().find(|m| m.current) {
                return Size::new(mode.dimensions.0, mode.dimensions.1);
            }
            if let Some(mode) = info.modes.first() {
                return Size::new(mode.dimensions.0, mode.dimensions.1);
            }
        }
    }
    Size::new(1920, 1080)
}

/// Nearest-neighbour blit of the current frame, clipped by the mask and
/// premultiplied for ARGB8888
fn render_overlay(
    canvas: &mut [u8],
    width: i32,
    height: i32,
    playback: Option<&Playback>,
    mask: &RoundedMask,
    alpha: f32,
) {
    canvas.fill(0);
    let opacity = (alpha.clamp(0.0, 1.0) * 255.0).round() as u32;

    let Some(playback) = playback else {
        for y in 0..height {
            let Some((start, end)) = mask.span(y) else {
                continue;
            };
            for x in start..end.min(width) {
                let idx = ((y * width + x) * 4) as usize;
                put_pixel(canvas, idx, PLACEHOLDER, opacity);
            }
        }
        return;
    };

    let frame = playback.frame();
    if frame.width == 0 || frame.height == 0 {
        return;
    }
    let (scaled_w, scaled_h) = playback.scaled_size();
    // center the (possibly overscanned) image on the window
    let offset_x = (width - scaled_w as i32) / 2;
    let offset_y = (height - scaled_h as i32) / 2;

    // Pre-compute scale factors as fixed-point for faster integer math
    let scale_x_fp = (u64::from(frame.width) << 16) / u64::from(scaled_w);
    let scale_y_fp = (u64::from(frame.height) << 16) / u64::from(scaled_h);
    let src_stride = frame.width as usize * 4;

    // Pre-compute X lookup table to avoid repeated calculations per row
    let x_lut: Vec<Option<usize>> = (0..width)
        .map(|x| {
            let sx = x - offset_x;
            if sx < 0 || sx >= scaled_w as i32 {
                return None;
            }
            let src_x = ((sx as u64 * scale_x_fp) >> 16) as u32;
            Some(src_x.min(frame.width - 1) as usize * 4)
        })
        .collect();

    for y in 0..height {
        let sy = y - offset_y;
        if sy < 0 || sy >= scaled_h as i32 {
            continue;
        }
        let Some((start, end)) = mask.span(y) else {
            continue;
        };
        let src_y = (((sy as u64) * scale_y_fp) >> 16) as u32;
        let src_row = src_y.min(frame.height - 1) as usize * src_stride;
        let dst_row = (y * width) as usize * 4;

        for x in start.max(0)..end.min(width) {
            let Some(src_x) = x_lut[x as usize] else {
                continue;
            };
            let src_idx = src_row + src_x;
            let Some(src) = frame.bgra.get(src_idx..src_idx + 4) else {
                continue;
            };
            put_pixel(
                canvas,
                dst_row + x as usize * 4,
                [src[0], src[1], src[2], src[3]],
                opacity,
            );
        }
    }
}

fn put_pixel(canvas: &mut [u8], idx: usize, bgra: [u8; 4], opacity: u32) {
    let Some(dst) = canvas.get_mut(idx..idx + 4) else {
        return;
    };
    let a = u32::from(bgra[3]) * opacity / 255;
    dst[0] = (u32::from(bgra[0]) * a / 255) as u8;
    dst[1] = (u32::from(bgra[1]) * a / 255) as u8;
    dst[2] = (u32::from(bgra[2]) * a / 255) as u8;
    dst[3] = a as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_loader::{AnimatedImage, Frame};

    fn solid_playback(width: u32, height: u32, bgra: [u8; 4]) -> Playback {
        let frame = Frame {
            width,
            height,
            bgra: bgra.repeat((width * height) as usize),
            delay: Duration::ZERO,
        };
        Playback::new(AnimatedImage {
            frames: vec![frame],
        })
    }

    fn pixel(canvas: &[u8], width: i32, x: i32, y: i32) -> [u8; 4] {
        let idx = ((y * width + x) * 4) as usize;
        [canvas[idx], canvas[idx + 1], canvas[idx + 2], canvas[idx + 3]]
    }

    #[test]
    fn corners_stay_transparent() {
        let (w, h) = (60, 40);
        let mut canvas = vec![0xAA; (w * h * 4) as usize];
        let mut playback = solid_playback(8, 8, [10, 20, 30, 255]);
        playback.scale_to(w as u32, h as u32);
        render_overlay(&mut canvas, w, h, Some(&playback), &RoundedMask::for_size(w, h), 1.0);

        assert_eq!(pixel(&canvas, w, 0, 0), [0, 0, 0, 0]);
        assert_eq!(pixel(&canvas, w, w - 1, h - 1), [0, 0, 0, 0]);
        assert_eq!(pixel(&canvas, w, w / 2, h / 2), [10, 20, 30, 255]);
    }

    #[test]
    fn opacity_premultiplies_pixels() {
        let (w, h) = (50, 50);
        let mut canvas = vec![0; (w * h * 4) as usize];
        let mut playback = solid_playback(2, 2, [200, 100, 50, 255]);
        playback.scale_to(w as u32 + 10, h as u32 + 10);
        render_overlay(&mut canvas, w, h, Some(&playback), &RoundedMask::for_size(w, h), 0.5);

        let [b, g, r, a] = pixel(&canvas, w, 25, 25);
        assert_eq!(a, 128);
        assert_eq!((b, g, r), (100, 50, 25));
    }

    #[test]
    fn placeholder_fills_masked_area_without_image() {
        let (w, h) = (40, 40);
        let mut canvas = vec![0; (w * h * 4) as usize];
        render_overlay(&mut canvas, w, h, None, &RoundedMask::for_size(w, h), 1.0);
        assert_eq!(pixel(&canvas, w, 0, 0)[3], 0);
        assert_eq!(pixel(&canvas, w, 20, 20)[3], PLACEHOLDER[3]);
    }

    #[test]
    fn late_echo_of_an_animation_step_is_not_an_override() {
        let mut requested = RequestedSizes::default();
        for step in 0..5 {
            requested.record(Size::new(100 + step, 100 - step));
        }

        assert!(requested.acknowledge(Size::new(101, 99)));
        assert!(requested.acknowledge(Size::new(103, 97)));
        // settled with the steps before it
        assert!(!requested.acknowledge(Size::new(102, 98)));
        assert!(requested.acknowledge(Size::new(104, 96)));
        assert!(!requested.acknowledge(Size::new(300, 300)));
    }

    #[test]
    fn requested_sizes_keep_only_the_newest() {
        let mut requested = RequestedSizes::default();
        for side in 1..=(MAX_PENDING_SIZES as i32 + 10) {
            requested.record(Size::new(side, side));
        }
        assert_eq!(requested.pending.len(), MAX_PENDING_SIZES);
        assert!(!requested.acknowledge(Size::new(5, 5)));
        assert!(requested.acknowledge(Size::new(20, 20)));
    }

    #[test]
    fn buffer_layout_refuses_sizes_no_window_can_have() {
        assert_eq!(buffer_layout(Size::new(200, 100)), Some((800, 80_000)));
        assert_eq!(
            buffer_layout(Size::new(4096, 4096)),
            Some((16_384, 67_108_864))
        );
        assert_eq!(buffer_layout(Size::new(50_000, 50_000)), None);
        assert_eq!(buffer_layout(Size::new(0, 10)), None);
    }
}
