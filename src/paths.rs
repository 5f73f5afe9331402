// Application paths
// Resolves every file location once at startup

use std::path::{Path, PathBuf};

/// Display name used for the data folder and the autostart entries
pub const APP_NAME: &str = "Kiwi Widget";

const GIF_SUBDIR: &str = "gif_files";
const GEOMETRY_FILE: &str = "window_config.txt";
const OPACITY_FILE: &str = "opacity_value.txt";
const LAST_IMAGE_FILE: &str = "last_gif.txt";
const AUTOSTART_SUBDIR: &str = "autostart";
const AUTOSTART_ENTRY_FILE: &str = "kiwi_widget.desktop";

/// Immutable set of locations shared by the stores, the fetcher and the
/// autostart registrar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    data_dir: PathBuf,
    autostart_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>, autostart_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            autostart_dir: autostart_dir.into(),
        }
    }

    /// Resolve the per-user locations, honouring an explicit data directory
    pub fn resolve(data_dir_override: Option<&Path>) -> Self {
        let data_dir = data_dir_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_data_dir(dirs::document_dir(), dirs::data_dir()));
        // stored image records hold absolute paths
        let data_dir = std::path::absolute(&data_dir).unwrap_or(data_dir);
        let autostart_dir = default_autostart_dir(dirs::config_dir(), dirs::home_dir());
        Self::new(data_dir, autostart_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn gif_dir(&self) -> PathBuf {
        self.data_dir.join(GIF_SUBDIR)
    }

    pub fn geometry_file(&self) -> PathBuf {
        self.data_dir.join(GEOMETRY_FILE)
    }

    pub fn opacity_file(&self) -> PathBuf {
        self.data_dir.join(OPACITY_FILE)
    }

    pub fn last_image_file(&self) -> PathBuf {
        self.data_dir.join(LAST_IMAGE_FILE)
    }

    pub fn autostart_entry(&self) -> PathBuf {
        self.autostart_dir.join(AUTOSTART_ENTRY_FILE)
    }

    /// Create the data and image folders
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.gif_dir())
    }
}

fn default_data_dir(documents: Option<PathBuf>, data: Option<PathBuf>) -> PathBuf {
    documents
        .or(data)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

fn default_autostart_dir(config: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    config
        .or_else(|| home.map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(AUTOSTART_SUBDIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_prefers_documents_folder() {
        let dir = default_data_dir(
            Some(PathBuf::from("/home/kiwi/Documents")),
            Some(PathBuf::from("/home/kiwi/.local/share")),
        );
        assert_eq!(dir, PathBuf::from("/home/kiwi/Documents/Kiwi Widget"));
    }

    #[test]
    fn data_dir_falls_back_to_data_then_cwd() {
        let dir = default_data_dir(None, Some(PathBuf::from("/home/kiwi/.local/share")));
        assert_eq!(dir, PathBuf::from("/home/kiwi/.local/share/Kiwi Widget"));
        assert_eq!(default_data_dir(None, None), PathBuf::from("./Kiwi Widget"));
    }

    #[test]
    fn autostart_dir_falls_back_to_home_dot_config() {
        let dir = default_autostart_dir(None, Some(PathBuf::from("/home/kiwi")));
        assert_eq!(dir, PathBuf::from("/home/kiwi/.config/autostart"));
    }

    #[test]
    fn record_files_live_under_data_dir() {
        let paths = AppPaths::new("/data", "/cfg/autostart");
        assert_eq!(paths.geometry_file(), PathBuf::from("/data/window_config.txt"));
        assert_eq!(paths.opacity_file(), PathBuf::from("/data/opacity_value.txt"));
        assert_eq!(paths.last_image_file(), PathBuf::from("/data/last_gif.txt"));
        assert_eq!(paths.gif_dir(), PathBuf::from("/data/gif_files"));
        assert_eq!(
            paths.autostart_entry(),
            PathBuf::from("/cfg/autostart/kiwi_widget.desktop")
        );
    }
}
