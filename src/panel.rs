// Control panel
// Button layout, hit testing, text prompts and rendering of the popup panel

use crate::geometry::Size;
use crate::session::ControlPanel;
use crate::store::OpacityLevel;
use cosmic_text::{Attrs, Buffer, Color, FontSystem, Metrics, Shaping, SwashCache};
use log::debug;
use std::time::{Duration, Instant};

pub const PANEL_WIDTH: u32 = 200;
pub const PANEL_HEIGHT: u32 = 450;

/// Duration of the show/hide fade
pub const PANEL_FADE: Duration = Duration::from_millis(300);

const MARGIN: i32 = 12;
const BUTTON_HEIGHT: i32 = 38;
const BUTTON_SPACING: i32 = 8;
const SLIDER_LABEL_Y: i32 = 300;
const SLIDER_Y: i32 = 326;
const SLIDER_HEIGHT: i32 = 16;
const MESSAGE_Y: i32 = 356;

const FONT_SIZE: f32 = 14.0;
const LINE_HEIGHT: f32 = 18.0;

// BGRA
const BACKGROUND: [u8; 4] = [40, 40, 40, 235];
const BUTTON: [u8; 4] = [70, 70, 70, 255];
const BUTTON_HOVER: [u8; 4] = [110, 150, 90, 255];
const TRACK: [u8; 4] = [90, 90, 90, 255];
const TRACK_FILL: [u8; 4] = [80, 170, 110, 255];
const PROMPT_FIELD: [u8; 4] = [20, 20, 20, 255];

/// What the user asked for through the panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelIntent {
    Close,
    ToggleMove,
    ResizeRequest(String),
    ChangeImageRequest(String),
    Restart,
    ToggleAutostart(bool),
    OpacityChanged(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelItem {
    Close,
    Move,
    Resize,
    ChangeImage,
    Restart,
    Autostart,
}

impl PanelItem {
    pub const ALL: [PanelItem; 6] = [
        PanelItem::Close,
        PanelItem::Move,
        PanelItem::Resize,
        PanelItem::ChangeImage,
        PanelItem::Restart,
        PanelItem::Autostart,
    ];

    fn top(self) -> i32 {
        let index = Self::ALL.iter().position(|item| *item == self).unwrap_or(0) as i32;
        MARGIN + index * (BUTTON_HEIGHT + BUTTON_SPACING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Resize,
    ChangeImage,
}

impl PromptKind {
    fn title(self) -> &'static str {
        match self {
            PromptKind::Resize => "New size (W H):",
            PromptKind::ChangeImage => "GIF link:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub kind: PromptKind,
    pub text: String,
}

/// Keyboard input already translated from keysyms
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    Text(String),
    Enter,
    Backspace,
    Escape,
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    from: f32,
    to: f32,
    started: Instant,
}

impl Fade {
    fn alpha(&self, now: Instant) -> f32 {
        let t = (now.saturating_duration_since(self.started).as_secs_f32()
            / PANEL_FADE.as_secs_f32())
        .min(1.0);
        self.from + (self.to - self.from) * t
    }

    fn finished(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= PANEL_FADE
    }
}

/// Panel state independent of the surface it is drawn on
#[derive(Debug, Clone)]
pub struct PanelModel {
    shown: bool,
    fade: Option<Fade>,
    move_mode: bool,
    autostart: bool,
    opacity: i32,
    prompt: Option<Prompt>,
    error: Option<String>,
    hover: Option<PanelItem>,
    slider_grabbed: bool,
}

impl Default for PanelModel {
    fn default() -> Self {
        Self {
            shown: false,
            fade: None,
            move_mode: false,
            autostart: false,
            opacity: OpacityLevel::DEFAULT.percent(),
            prompt: None,
            error: None,
            hover: None,
            slider_grabbed: false,
        }
    }
}

impl PanelModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    pub fn show(&mut self, now: Instant) {
        if !self.shown {
            self.shown = true;
            self.start_fade(now, 1.0);
        }
    }

    pub fn hide(&mut self, now: Instant) {
        if self.shown {
            self.shown = false;
            self.prompt = None;
            self.slider_grabbed = false;
            self.hover = None;
            self.start_fade(now, 0.0);
        }
    }

    pub fn toggle(&mut self, now: Instant) {
        if self.shown {
            self.hide(now);
        } else {
            self.show(now);
        }
    }

    fn start_fade(&mut self, now: Instant, to: f32) {
        let from = self.alpha(now);
        self.fade = Some(Fade { from, to, started: now });
    }

    pub fn alpha(&self, now: Instant) -> f32 {
        match self.fade {
            Some(fade) => fade.alpha(now),
            None if self.shown => 1.0,
            None => 0.0,
        }
    }

    /// True while a fade still needs frames
    pub fn is_fading(&self, now: Instant) -> bool {
        self.fade.is_some_and(|fade| !fade.finished(now))
    }

    /// The panel surface can be destroyed once this holds
    pub fn is_gone(&self, now: Instant) -> bool {
        !self.shown && !self.is_fading(now)
    }

    pub fn prompt(&self) -> Option<&Prompt> {
        self.prompt.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn opacity(&self) -> i32 {
        self.opacity
    }

    pub fn label(&self, item: PanelItem) -> String {
        match item {
            PanelItem::Close => "Close".to_string(),
            PanelItem::Move => format!("Move: {}", if self.move_mode { "on" } else { "off" }),
            PanelItem::Resize => "Resize".to_string(),
            PanelItem::ChangeImage => "Change GIF".to_string(),
            PanelItem::Restart => "Restart".to_string(),
            PanelItem::Autostart => format!(
                "[{}] Start with system",
                if self.autostart { "x" } else { " " }
            ),
        }
    }

    pub fn item_at(&self, x: f64, y: f64) -> Option<PanelItem> {
        let (x, y) = (x as i32, y as i32);
        if x < MARGIN || x >= PANEL_WIDTH as i32 - MARGIN {
            return None;
        }
        PanelItem::ALL
            .into_iter()
            .find(|item| (item.top()..item.top() + BUTTON_HEIGHT).contains(&y))
    }

    fn on_slider(x: f64, y: f64) -> bool {
        let (x, y) = (x as i32, y as i32);
        (MARGIN..PANEL_WIDTH as i32 - MARGIN).contains(&x)
            && (SLIDER_Y - 4..SLIDER_Y + SLIDER_HEIGHT + 4).contains(&y)
    }

    fn slider_value(x: f64) -> i32 {
        let track = f64::from(PANEL_WIDTH as i32 - 2 * MARGIN);
        let t = ((x - f64::from(MARGIN)) / track).clamp(0.0, 1.0);
        let span = f64::from(OpacityLevel::MAX - OpacityLevel::MIN);
        OpacityLevel::MIN + (t * span).round() as i32
    }

    fn slide_to(&mut self, x: f64) -> Option<PanelIntent> {
        let value = Self::slider_value(x);
        if value == self.opacity {
            return None;
        }
        self.opacity = value;
        Some(PanelIntent::OpacityChanged(value))
    }

    /// Left button press in panel coordinates
    pub fn pointer_press(&mut self, x: f64, y: f64, window_size: Size) -> Option<PanelIntent> {
        if !self.shown {
            return None;
        }
        if Self::on_slider(x, y) {
            self.slider_grabbed = true;
            return self.slide_to(x);
        }
        let item = self.item_at(x, y)?;
        self.error = None;
        debug!("Panel item pressed: {:?}", item);
        match item {
            PanelItem::Close => Some(PanelIntent::Close),
            PanelItem::Move => Some(PanelIntent::ToggleMove),
            PanelItem::Resize => {
                self.prompt = Some(Prompt {
                    kind: PromptKind::Resize,
                    text: format!("{} {}", window_size.width, window_size.height),
                });
                None
            }
            PanelItem::ChangeImage => {
                self.prompt = Some(Prompt {
                    kind: PromptKind::ChangeImage,
                    text: String::new(),
                });
                None
            }
            PanelItem::Restart => Some(PanelIntent::Restart),
            PanelItem::Autostart => Some(PanelIntent::ToggleAutostart(!self.autostart)),
        }
    }

    /// Returns the intent (if any) and whether the panel needs a redraw
    pub fn pointer_motion(&mut self, x: f64, y: f64) -> (Option<PanelIntent>, bool) {
        if self.slider_grabbed {
            let intent = self.slide_to(x);
            let redraw = intent.is_some();
            return (intent, redraw);
        }
        let hover = self.item_at(x, y);
        let changed = hover != self.hover;
        self.hover = hover;
        (None, changed)
    }

    pub fn pointer_release(&mut self) {
        self.slider_grabbed = false;
    }

    pub fn pointer_leave(&mut self) {
        self.hover = None;
        self.slider_grabbed = false;
    }

    pub fn key(&mut self, input: KeyInput, now: Instant) -> Option<PanelIntent> {
        let Some(prompt) = self.prompt.as_mut() else {
            if input == KeyInput::Escape {
                self.hide(now);
            }
            return None;
        };
        match input {
            KeyInput::Text(text) => {
                prompt
                    .text
                    .extend(text.chars().filter(|c| !c.is_control()));
                None
            }
            KeyInput::Backspace => {
                prompt.text.pop();
                None
            }
            KeyInput::Escape => {
                self.prompt = None;
                None
            }
            KeyInput::Enter => {
                let prompt = self.prompt.take()?;
                self.error = None;
                let text = prompt.text.trim().to_string();
                Some(match prompt.kind {
                    PromptKind::Resize => PanelIntent::ResizeRequest(text),
                    PromptKind::ChangeImage => PanelIntent::ChangeImageRequest(text),
                })
            }
        }
    }
}

impl ControlPanel for PanelModel {
    fn set_move_mode(&mut self, enabled: bool) {
        self.move_mode = enabled;
    }

    fn set_autostart(&mut self, enabled: bool) {
        self.autostart = enabled;
    }

    fn set_opacity(&mut self, opacity: OpacityLevel) {
        self.opacity = opacity.percent();
    }

    fn show_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }
}

/// Draws a [`PanelModel`] into a BGRA buffer with cosmic-text labels
pub struct PanelRenderer {
    font_system: FontSystem,
    swash_cache: SwashCache,
}

impl PanelRenderer {
    pub fn new() -> Self {
        Self {
            font_system: FontSystem::new(),
            swash_cache: SwashCache::new(),
        }
    }

    /// Render into a premultiplied BGRA canvas of `PANEL_WIDTH x PANEL_HEIGHT`
    pub fn render(&mut self, model: &PanelModel, canvas: &mut [u8], alpha: f32) {
        let width = PANEL_WIDTH as i32;
        canvas.fill(0);
        fill_rect(canvas, 0, 0, width, PANEL_HEIGHT as i32, BACKGROUND);

        for item in PanelItem::ALL {
            let color = if model.hover == Some(item) {
                BUTTON_HOVER
            } else {
                BUTTON
            };
            let inner = width - 2 * MARGIN;
            fill_rect(canvas, MARGIN, item.top(), inner, BUTTON_HEIGHT, color);
            self.draw_text(
                canvas,
                &model.label(item),
                MARGIN + 10,
                item.top() + (BUTTON_HEIGHT - LINE_HEIGHT as i32) / 2,
                inner - 20,
                Color::rgb(255, 255, 255),
            );
        }

        self.draw_text(
            canvas,
            &format!("Opacity: {}%", model.opacity),
            MARGIN,
            SLIDER_LABEL_Y,
            width - 2 * MARGIN,
            Color::rgb(220, 220, 220),
        );
        let track = width - 2 * MARGIN;
        let span = OpacityLevel::MAX - OpacityLevel::MIN;
        let filled = track * (model.opacity - OpacityLevel::MIN) / span;
        fill_rect(canvas, MARGIN, SLIDER_Y, track, SLIDER_HEIGHT, TRACK);
        fill_rect(canvas, MARGIN, SLIDER_Y, filled, SLIDER_HEIGHT, TRACK_FILL);

        let mut message_y = MESSAGE_Y;
        if let Some(prompt) = &model.prompt {
            self.draw_text(
                canvas,
                prompt.kind.title(),
                MARGIN,
                message_y,
                track,
                Color::rgb(220, 220, 220),
            );
            message_y += LINE_HEIGHT as i32 + 2;
            fill_rect(canvas, MARGIN, message_y, track, LINE_HEIGHT as i32 + 6, PROMPT_FIELD);
            // show the tail of long links
            let visible: String = {
                let chars: Vec<char> = prompt.text.chars().collect();
                let start = chars.len().saturating_sub(22);
                chars[start..].iter().chain(['_'].iter()).collect()
            };
            self.draw_text(
                canvas,
                &visible,
                MARGIN + 4,
                message_y + 3,
                track - 8,
                Color::rgb(255, 255, 255),
            );
            message_y += LINE_HEIGHT as i32 + 10;
        }
        if let Some(error) = &model.error {
            let bottom = PANEL_HEIGHT as i32 - MARGIN - message_y;
            self.draw_wrapped(
                canvas,
                error,
                MARGIN,
                message_y,
                track,
                bottom,
                Color::rgb(255, 120, 120),
            );
        }

        premultiply(canvas, alpha);
    }

    fn draw_text(&mut self, canvas: &mut [u8], text: &str, x: i32, y: i32, width: i32, color: Color) {
        self.draw_wrapped(canvas, text, x, y, width, LINE_HEIGHT as i32, color);
    }

    fn draw_wrapped(
        &mut self,
        canvas: &mut [u8],
        text: &str,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        color: Color,
    ) {
        let mut buffer = Buffer::new(&mut self.font_system, Metrics::new(FONT_SIZE, LINE_HEIGHT));
        buffer.set_size(
            &mut self.font_system,
            Some(width as f32),
            Some(height.max(0) as f32),
        );
        buffer.set_text(&mut self.font_system, text, Attrs::new(), Shaping::Advanced);
        buffer.shape_until_scroll(&mut self.font_system, false);
        buffer.draw(
            &mut self.font_system,
            &mut self.swash_cache,
            color,
            |gx, gy, gw, gh, glyph| {
                if glyph.a() == 0 {
                    return;
                }
                let bgra = [glyph.b(), glyph.g(), glyph.r(), glyph.a()];
                for dy in 0..gh as i32 {
                    for dx in 0..gw as i32 {
                        blend_pixel(canvas, x + gx + dx, y + gy + dy, bgra);
                    }
                }
            },
        );
    }
}

impl Default for PanelRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn pixel_index(x: i32, y: i32) -> Option<usize> {
    if x < 0 || y < 0 || x >= PANEL_WIDTH as i32 || y >= PANEL_HEIGHT as i32 {
        return None;
    }
    Some(((y as u32 * PANEL_WIDTH + x as u32) * 4) as usize)
}

fn fill_rect(canvas: &mut [u8], x: i32, y: i32, width: i32, height: i32, color: [u8; 4]) {
    for py in y..y + height {
        for px in x..x + width {
            if let Some(idx) = pixel_index(px, py) {
                if let Some(dst) = canvas.get_mut(idx..idx + 4) {
                    dst.copy_from_slice(&color);
                }
            }
        }
    }
}

/// Straight-alpha "over" blend
fn blend_pixel(canvas: &mut [u8], x: i32, y: i32, color: [u8; 4]) {
    let Some(idx) = pixel_index(x, y) else {
        return;
    };
    let Some(dst) = canvas.get_mut(idx..idx + 4) else {
        return;
    };
    let a = u32::from(color[3]);
    for c in 0..3 {
        dst[c] = ((u32::from(color[c]) * a + u32::from(dst[c]) * (255 - a)) / 255) as u8;
    }
    dst[3] = (a + u32::from(dst[3]) * (255 - a) / 255) as u8;
}

/// Apply the fade alpha and premultiply for ARGB8888
fn premultiply(canvas: &mut [u8], alpha: f32) {
    let fade = (alpha.clamp(0.0, 1.0) * 255.0) as u32;
    for pixel in canvas.chunks_exact_mut(4) {
        let a = u32::from(pixel[3]) * fade / 255;
        pixel[0] = (u32::from(pixel[0]) * a / 255) as u8;
        pixel[1] = (u32::from(pixel[1]) * a / 255) as u8;
        pixel[2] = (u32::from(pixel[2]) * a / 255) as u8;
        pixel[3] = a as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Size = Size::new(200, 200);

    fn center(item: PanelItem) -> (f64, f64) {
        (
            f64::from(PANEL_WIDTH) / 2.0,
            f64::from(item.top() + BUTTON_HEIGHT / 2),
        )
    }

    fn shown() -> PanelModel {
        let mut panel = PanelModel::new();
        panel.show(Instant::now());
        panel
    }

    #[test]
    fn buttons_map_to_intents() {
        let mut panel = shown();
        let press = |panel: &mut PanelModel, item| {
            let (x, y) = center(item);
            panel.pointer_press(x, y, WINDOW)
        };
        assert_eq!(press(&mut panel, PanelItem::Close), Some(PanelIntent::Close));
        assert_eq!(press(&mut panel, PanelItem::Move), Some(PanelIntent::ToggleMove));
        assert_eq!(press(&mut panel, PanelItem::Restart), Some(PanelIntent::Restart));
        assert_eq!(
            press(&mut panel, PanelItem::Autostart),
            Some(PanelIntent::ToggleAutostart(true))
        );
        panel.set_autostart(true);
        assert_eq!(
            press(&mut panel, PanelItem::Autostart),
            Some(PanelIntent::ToggleAutostart(false))
        );
        assert_eq!(panel.pointer_press(2.0, 2.0, WINDOW), None);
    }

    #[test]
    fn hidden_panel_ignores_clicks() {
        let mut panel = PanelModel::new();
        let (x, y) = center(PanelItem::Close);
        assert_eq!(panel.pointer_press(x, y, WINDOW), None);
    }

    #[test]
    fn labels_follow_session_state() {
        let mut panel = PanelModel::new();
        assert_eq!(panel.label(PanelItem::Move), "Move: off");
        panel.set_move_mode(true);
        assert_eq!(panel.label(PanelItem::Move), "Move: on");
        panel.set_autostart(true);
        assert_eq!(panel.label(PanelItem::Autostart), "[x] Start with system");
    }

    #[test]
    fn resize_prompt_is_prefilled_and_editable() {
        let mut panel = shown();
        let now = Instant::now();
        let (x, y) = center(PanelItem::Resize);
        assert_eq!(panel.pointer_press(x, y, Size::new(320, 240)), None);
        assert_eq!(panel.prompt().map(|p| p.text.as_str()), Some("320 240"));

        for _ in 0..3 {
            panel.key(KeyInput::Backspace, now);
        }
        panel.key(KeyInput::Text("180".into()), now);
        assert_eq!(
            panel.key(KeyInput::Enter, now),
            Some(PanelIntent::ResizeRequest("320 180".into()))
        );
        assert!(panel.prompt().is_none());
    }

    #[test]
    fn image_prompt_submits_trimmed_url_and_escape_cancels() {
        let mut panel = shown();
        let now = Instant::now();
        let (x, y) = center(PanelItem::ChangeImage);
        panel.pointer_press(x, y, WINDOW);
        panel.key(KeyInput::Text(" https://example.com/a.gif ".into()), now);
        assert_eq!(
            panel.key(KeyInput::Enter, now),
            Some(PanelIntent::ChangeImageRequest("https://example.com/a.gif".into()))
        );

        panel.pointer_press(x, y, WINDOW);
        assert_eq!(panel.key(KeyInput::Escape, now), None);
        assert!(panel.prompt().is_none());
        assert!(panel.is_shown());

        panel.key(KeyInput::Escape, now);
        assert!(!panel.is_shown());
    }

    #[test]
    fn slider_covers_the_opacity_range() {
        let mut panel = shown();
        let y = f64::from(SLIDER_Y + SLIDER_HEIGHT / 2);
        assert_eq!(
            panel.pointer_press(f64::from(MARGIN), y, WINDOW),
            Some(PanelIntent::OpacityChanged(30))
        );
        let (intent, redraw) = panel.pointer_motion(f64::from(PANEL_WIDTH), y);
        assert_eq!(intent, Some(PanelIntent::OpacityChanged(100)));
        assert!(redraw);
        panel.pointer_release();
        assert_eq!(panel.pointer_motion(f64::from(MARGIN), y).0, None);
        assert_eq!(panel.opacity(), 100);
    }

    #[test]
    fn errors_clear_on_next_action() {
        let mut panel = shown();
        panel.show_error("The link is unavailable.");
        assert_eq!(panel.error(), Some("The link is unavailable."));
        let (x, y) = center(PanelItem::Move);
        panel.pointer_press(x, y, WINDOW);
        assert_eq!(panel.error(), None);
    }

    #[test]
    fn fade_runs_both_ways() {
        let mut panel = PanelModel::new();
        let start = Instant::now();
        assert_eq!(panel.alpha(start), 0.0);
        panel.show(start);
        let half = panel.alpha(start + PANEL_FADE / 2);
        assert!(half > 0.4 && half < 0.6, "alpha {half}");
        assert!(panel.is_fading(start));
        assert_eq!(panel.alpha(start + PANEL_FADE), 1.0);

        let later = start + PANEL_FADE * 2;
        panel.hide(later);
        assert!(!panel.is_gone(later));
        assert!(panel.is_gone(later + PANEL_FADE));
        assert_eq!(panel.alpha(later + PANEL_FADE), 0.0);
    }

    #[test]
    fn premultiply_scales_color_by_alpha() {
        let mut canvas = vec![200, 100, 50, 128];
        premultiply(&mut canvas, 1.0);
        assert_eq!(canvas, vec![100, 50, 25, 128]);
        premultiply(&mut canvas, 0.0);
        assert_eq!(canvas, vec![0, 0, 0, 0]);
    }
}
