// Session controller
// Owns the window state and turns window events and panel intents into
// surface updates and persisted records

use crate::animator::{ResizeAnimator, ResizeStep};
use crate::autostart::AutostartRegistrar;
use crate::drag::DragController;
use crate::fetch::{FetchError, ImageFetcher};
use crate::geometry::{Point, Size, WindowGeometry, MAX_WINDOW_SIDE};
use crate::image_loader::ImageError;
use crate::mask::RoundedMask;
use crate::paths::AppPaths;
use crate::relaunch::{RelaunchError, Relauncher};
use crate::store::{
    GeometryStore, ImageReference, LastImageStore, OpacityLevel, OpacityStore,
};
use log::{debug, error, info, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The image is drawn this much larger than the window while resizing so
/// it keeps covering the rounded corners
pub const IMAGE_OVERSCAN: i32 = 10;

const INVALID_URL_MESSAGE: &str = "Invalid link format. Please enter a link to a GIF.";

/// The window hosting the animated image
pub trait OverlaySurface {
    fn resize(&mut self, size: Size);
    fn move_to(&mut self, position: Point);
    fn apply_mask(&mut self, mask: &RoundedMask);
    fn apply_opacity(&mut self, opacity: OpacityLevel);
    /// Replace the displayed image; on error the previous one stays
    fn load_image(&mut self, path: &Path) -> Result<(), ImageError>;
    fn scale_image(&mut self, size: Size);
    fn start_image(&mut self);
}

/// The popup control panel
pub trait ControlPanel {
    fn set_move_mode(&mut self, enabled: bool);
    fn set_autostart(&mut self, enabled: bool);
    fn set_opacity(&mut self, opacity: OpacityLevel);
    fn show_error(&mut self, message: &str);
}

pub trait OverlayHost: OverlaySurface + ControlPanel {}

impl<T: OverlaySurface + ControlPanel> OverlayHost for T {}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("failed to save image to {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Relaunch(#[from] RelaunchError),
}

impl SessionError {
    /// Text shown in the control panel
    pub fn user_message(&self) -> String {
        match self {
            SessionError::InvalidInput(message) => message.clone(),
            SessionError::Network(_) => {
                "The link is unavailable. Please enter a working GIF link.".to_string()
            }
            SessionError::Image(_) => "The downloaded file is not a playable GIF.".to_string(),
            SessionError::Save { .. } => "The GIF could not be saved.".to_string(),
            SessionError::Relaunch(_) => "Restart failed, the widget keeps running.".to_string(),
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Parse `"W H"`, `"W,H"` or `"WxH"` into a valid window size
pub fn parse_size(text: &str) -> SessionResult<Size> {
    let invalid = || {
        SessionError::InvalidInput(format!(
            "Enter width and height as two numbers between 1 and {MAX_WINDOW_SIDE}."
        ))
    };
    let fields = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | 'x' | 'X'))
        .filter(|field| !field.is_empty())
        .map(str::parse::<i32>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    match fields[..] {
        [width, height] if Size::new(width, height).is_valid() => Ok(Size::new(width, height)),
        _ => Err(invalid()),
    }
}

/// Accept only http(s) URLs whose path ends in `.gif`
pub fn validate_gif_url(url: &str) -> SessionResult<url::Url> {
    let invalid = || SessionError::InvalidInput(INVALID_URL_MESSAGE.to_string());
    let parsed = url::Url::parse(url.trim()).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid());
    }
    if !parsed.path().to_ascii_lowercase().ends_with(".gif") {
        return Err(invalid());
    }
    Ok(parsed)
}

pub struct SessionController {
    paths: AppPaths,
    geometry_store: GeometryStore,
    opacity_store: OpacityStore,
    last_image_store: LastImageStore,
    registrar: AutostartRegistrar,
    fetcher: Box<dyn ImageFetcher>,
    relauncher: Box<dyn Relauncher>,

    geometry: WindowGeometry,
    opacity: OpacityLevel,
    move_mode: bool,
    animator: ResizeAnimator,
    drag: DragController,
    mask: RoundedMask,
    image: Option<ImageReference>,
}

impl SessionController {
    pub fn new(
        paths: &AppPaths,
        registrar: AutostartRegistrar,
        fetcher: Box<dyn ImageFetcher>,
        relauncher: Box<dyn Relauncher>,
    ) -> Self {
        Self {
            paths: paths.clone(),
            geometry_store: GeometryStore::new(paths),
            opacity_store: OpacityStore::new(paths),
            last_image_store: LastImageStore::new(paths),
            registrar,
            fetcher,
            relauncher,
            geometry: WindowGeometry::new(1, 1, 0, 0),
            opacity: OpacityLevel::DEFAULT,
            move_mode: false,
            animator: ResizeAnimator::new(),
            drag: DragController::new(),
            mask: RoundedMask::for_size(1, 1),
            image: None,
        }
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    pub fn opacity(&self) -> OpacityLevel {
        self.opacity
    }

    pub fn move_mode(&self) -> bool {
        self.move_mode
    }

    pub fn is_animating(&self) -> bool {
        self.animator.is_animating()
    }

    pub fn mask(&self) -> &RoundedMask {
        &self.mask
    }

    pub fn image(&self) -> Option<&ImageReference> {
        self.image.as_ref()
    }

    /// Restore persisted state onto a freshly created window
    pub fn initialize(&mut self, host: &mut impl OverlayHost, fallback: WindowGeometry) {
        self.geometry = self.geometry_store.load().unwrap_or_else(|| {
            info!("No saved geometry, using {:?}", fallback);
            fallback
        });
        host.resize(self.geometry.size());
        host.move_to(self.geometry.position());

        match self.opacity_store.load() {
            Some(opacity) => {
                self.opacity = opacity;
                host.apply_opacity(opacity);
            }
            None => debug!("No saved opacity, keeping the surface default"),
        }
        host.set_opacity(self.opacity);

        self.mask = RoundedMask::for_size(self.geometry.width, self.geometry.height);
        host.apply_mask(&self.mask);

        match self.last_image_store.load() {
            Some(image) if image.exists() => match host.load_image(&image.source_path) {
                Ok(()) => {
                    host.scale_image(self.geometry.size());
                    host.start_image();
                    self.image = Some(image);
                }
                Err(err) => warn!("Last image could not be restored: {}", err),
            },
            Some(image) => debug!(
                "Last image {} no longer exists",
                image.source_path.display()
            ),
            None => debug!("No last image recorded"),
        }

        host.set_autostart(self.registrar.is_enabled());
        host.set_move_mode(self.move_mode);
        info!(
            "Session initialized: {:?}, opacity {}%",
            self.geometry,
            self.opacity.percent()
        );
    }

    /// The window changed size (compositor or animation)
    pub fn on_resize(&mut self, host: &mut impl OverlayHost, size: Size) {
        self.geometry.set_size(size);
        self.mask = RoundedMask::for_size(size.width, size.height);
        host.apply_mask(&self.mask);
        host.scale_image(size.expanded(IMAGE_OVERSCAN));
        // an animation persists once it settles
        if !self.animator.is_animating() {
            self.persist_geometry();
        }
    }

    pub fn on_move(&mut self, position: Point) {
        self.geometry.set_position(position);
        self.persist_geometry();
    }

    /// Returns whether resize ticks have to run
    pub fn request_resize(&mut self, target: Size) -> SessionResult<bool> {
        if !target.is_valid() {
            return Err(SessionError::InvalidInput(format!(
                "Size {}x{} is outside 1..={MAX_WINDOW_SIDE}.",
                target.width, target.height
            )));
        }
        Ok(self.animator.request(self.geometry.size(), target))
    }

    /// Resize request typed into the panel
    pub fn submit_resize(&mut self, host: &mut impl OverlayHost, text: &str) -> SessionResult<bool> {
        let result = parse_size(text).and_then(|size| self.request_resize(size));
        if let Err(err) = &result {
            host.show_error(&err.user_message());
        }
        result
    }

    /// One animation step; returns whether more ticks are needed
    pub fn tick_resize(&mut self, host: &mut impl OverlayHost) -> bool {
        match self.animator.tick(self.geometry.size()) {
            ResizeStep::Idle => false,
            ResizeStep::Stepped(size) => {
                host.resize(size);
                self.on_resize(host, size);
                true
            }
            ResizeStep::Settled(size) => {
                debug!("Resize settled at {:?}", size);
                self.persist_geometry();
                host.scale_image(size);
                false
            }
        }
    }

    pub fn pointer_press(&mut self, pointer: Point, primary: bool) {
        if primary {
            self.drag
                .press(self.move_mode, pointer, self.geometry.position());
        }
    }

    /// Returns whether the window moved
    pub fn pointer_motion(
        &mut self,
        host: &mut impl OverlayHost,
        pointer: Point,
        primary_held: bool,
    ) -> bool {
        let Some(position) = self.drag.motion(self.move_mode, primary_held, pointer) else {
            return false;
        };
        if position == self.geometry.position() {
            return false;
        }
        host.move_to(position);
        self.on_move(position);
        true
    }

    pub fn pointer_release(&mut self) -> bool {
        self.drag.release()
    }

    /// Download a GIF and make it the displayed image
    pub fn request_image_change(
        &mut self,
        host: &mut impl OverlayHost,
        url: &str,
    ) -> SessionResult<()> {
        let result = self.change_image(host, url);
        if let Err(err) = &result {
            warn!("Image change to {:?} failed: {}", url, err);
            host.show_error(&err.user_message());
        }
        result
    }

    fn change_image(&mut self, host: &mut impl OverlayHost, url: &str) -> SessionResult<()> {
        let url = validate_gif_url(url)?;
        let bytes = self.fetcher.fetch(url.as_str())?;

        let gif_dir = self.paths.gif_dir();
        let path = fs::create_dir_all(&gif_dir)
            .and_then(|()| write_download(&gif_dir, chrono::Utc::now().timestamp(), &bytes))
            .map_err(|source| SessionError::Save {
                path: gif_dir.clone(),
                source,
            })?;

        if let Err(err) = host.load_image(&path) {
            let playing = self.image.as_ref().map(|image| image.source_path.as_path());
            if playing != Some(path.as_path()) {
                if let Err(remove_err) = fs::remove_file(&path) {
                    warn!("Failed to remove {}: {}", path.display(), remove_err);
                }
            }
            return Err(err.into());
        }
        host.scale_image(self.geometry.size());
        host.start_image();

        let image = ImageReference::new(path);
        if let Err(err) = self.last_image_store.save(&image) {
            warn!("Failed to record last image: {}", err);
        }
        info!("Now showing {}", image.source_path.display());
        self.image = Some(image);
        Ok(())
    }

    pub fn toggle_move_mode(&mut self, host: &mut impl OverlayHost) -> bool {
        self.move_mode = !self.move_mode;
        if !self.move_mode {
            self.drag.release();
        }
        info!("Move mode {}", if self.move_mode { "on" } else { "off" });
        host.set_move_mode(self.move_mode);
        self.move_mode
    }

    /// Opacity chosen by the user; clamped into the slider range
    pub fn set_opacity(&mut self, host: &mut impl OverlayHost, percent: i32) {
        let opacity = OpacityLevel::new(percent);
        host.set_opacity(opacity);
        if opacity == self.opacity {
            return;
        }
        self.opacity = opacity;
        host.apply_opacity(opacity);
        debug!("Opacity set to {}%", opacity.percent());
        if let Err(err) = self.opacity_store.save(opacity) {
            warn!("Failed to save opacity: {}", err);
        }
    }

    pub fn nudge_opacity(&mut self, host: &mut impl OverlayHost, delta: i32) {
        let percent = self.opacity.offset(delta).percent();
        self.set_opacity(host, percent);
    }

    /// Returns the registration state after the toggle
    pub fn toggle_autostart(&mut self, host: &mut impl OverlayHost, enabled: bool) -> bool {
        let report = self.registrar.set_enabled(enabled);
        if !report.is_clean() {
            warn!(
                "Autostart toggle finished with {} backend failure(s)",
                report.failures.len()
            );
        }
        let now_enabled = self.registrar.is_enabled();
        host.set_autostart(now_enabled);
        now_enabled
    }

    /// Schedule a new instance. On success the caller must exit.
    pub fn restart(&mut self, host: &mut impl OverlayHost) -> SessionResult<()> {
        self.persist_geometry();
        match self.relauncher.schedule() {
            Ok(()) => {
                info!("Restart scheduled, exiting");
                Ok(())
            }
            Err(err) => {
                error!("Restart failed, keeping this instance alive: {}", err);
                let err = SessionError::from(err);
                host.show_error(&err.user_message());
                Err(err)
            }
        }
    }

    fn persist_geometry(&self) {
        if let Err(err) = self.geometry_store.save(&self.geometry) {
            warn!("Failed to save window geometry: {}", err);
        }
    }
}

/// Write a download as `custom_gif_<stamp>.gif` in `dir`, adding a `_<n>`
/// suffix when that name is taken. Existing files are never overwritten.
fn write_download(dir: &Path, stamp: i64, bytes: &[u8]) -> io::Result<PathBuf> {
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("custom_gif_{}.gif", stamp),
            n => format!("custom_gif_{}_{}.gif", stamp, n),
        };
        let path = dir.join(name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => return file.write_all(bytes).map(|()| path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}
