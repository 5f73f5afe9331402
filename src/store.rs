// Persistence module
// Plain-text record files for geometry, opacity and the last image

use crate::geometry::{Size, WindowGeometry};
use crate::paths::AppPaths;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Overlay opacity in percent, always inside `MIN..=MAX`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpacityLevel(u8);

impl OpacityLevel {
    pub const MIN: i32 = 30;
    pub const MAX: i32 = 100;
    /// Opacity of a freshly created surface
    pub const DEFAULT: OpacityLevel = OpacityLevel(100);

    /// Clamp any integer into the accepted range
    pub fn new(percent: i32) -> Self {
        Self(percent.clamp(Self::MIN, Self::MAX) as u8)
    }

    pub fn percent(self) -> i32 {
        i32::from(self.0)
    }

    /// Alpha factor in `0.3..=1.0`
    pub fn alpha(self) -> f32 {
        f32::from(self.0) / 100.0
    }

    pub fn offset(self, delta: i32) -> Self {
        Self::new(self.percent() + delta)
    }
}

impl Default for OpacityLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Last successfully downloaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub source_path: PathBuf,
}

impl ImageReference {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
        }
    }

    pub fn exists(&self) -> bool {
        self.source_path.is_file()
    }
}

/// Read a record file, treating a missing or unreadable file as absent
fn read_record(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("No record at {}", path.display());
            None
        }
        Err(err) => {
            warn!("Failed to read {}: {}", path.display(), err);
            None
        }
    }
}

fn write_record(path: &Path, contents: &str) -> StoreResult<()> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    };
    write().map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// `"<width> <height> <x> <y>"` record
#[derive(Debug, Clone)]
pub struct GeometryStore {
    path: PathBuf,
}

impl GeometryStore {
    pub fn new(paths: &AppPaths) -> Self {
        Self {
            path: paths.geometry_file(),
        }
    }

    pub fn load(&self) -> Option<WindowGeometry> {
        let contents = read_record(&self.path)?;
        let geometry = parse_geometry(&contents);
        if geometry.is_none() {
            warn!("Ignoring malformed geometry record: {:?}", contents.trim());
        }
        geometry
    }

    pub fn save(&self, geometry: &WindowGeometry) -> StoreResult<()> {
        debug!("Saving geometry {:?}", geometry);
        write_record(
            &self.path,
            &format!(
                "{} {} {} {}",
                geometry.width, geometry.height, geometry.x, geometry.y
            ),
        )
    }
}

fn parse_geometry(contents: &str) -> Option<WindowGeometry> {
    let fields = contents
        .split_whitespace()
        .map(str::parse::<i32>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    match fields[..] {
        [width, height, x, y] if Size::new(width, height).is_valid() => {
            Some(WindowGeometry::new(width, height, x, y))
        }
        _ => None,
    }
}

/// Single integer opacity record
#[derive(Debug, Clone)]
pub struct OpacityStore {
    path: PathBuf,
}

impl OpacityStore {
    pub fn new(paths: &AppPaths) -> Self {
        Self {
            path: paths.opacity_file(),
        }
    }

    pub fn load(&self) -> Option<OpacityLevel> {
        let contents = read_record(&self.path)?;
        match contents.trim().parse::<i32>() {
            Ok(value) => Some(OpacityLevel::new(value)),
            Err(_) => {
                warn!("Ignoring non-numeric opacity record: {:?}", contents.trim());
                None
            }
        }
    }

    pub fn save(&self, opacity: OpacityLevel) -> StoreResult<()> {
        write_record(&self.path, &opacity.percent().to_string())
    }
}

/// Absolute path of the last downloaded image
#[derive(Debug, Clone)]
pub struct LastImageStore {
    path: PathBuf,
}

impl LastImageStore {
    pub fn new(paths: &AppPaths) -> Self {
        Self {
            path: paths.last_image_file(),
        }
    }

    pub fn load(&self) -> Option<ImageReference> {
        let contents = read_record(&self.path)?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(ImageReference::new(trimmed))
    }

    pub fn save(&self, image: &ImageReference) -> StoreResult<()> {
        write_record(&self.path, &image.source_path.to_string_lossy())
    }
}
