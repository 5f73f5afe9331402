// Autostart registration
// "Run at login" through a desktop entry file and, on Windows, the registry run key

use crate::paths::{AppPaths, APP_NAME};
use log::{info, warn};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("{backend}: {source}")]
    Io {
        backend: &'static str,
        #[source]
        source: io::Error,
    },
}

/// One platform mechanism for launching the widget at login
pub trait AutostartBackend {
    fn name(&self) -> &'static str;
    /// Absent entries are reported as `false`, never as an error
    fn is_enabled(&self) -> bool;
    fn enable(&self) -> Result<(), RegistrationError>;
    fn disable(&self) -> Result<(), RegistrationError>;
}

/// Command line used to start this program at login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub executable: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }

    /// The running executable plus the echoed command line arguments
    pub fn current(args: Vec<String>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn quoted_executable(&self) -> String {
        format!("\"{}\"", self.executable.display())
    }

    /// Executable and arguments, each quoted when it contains whitespace
    pub fn to_command_line(&self) -> String {
        std::iter::once(self.quoted_executable())
            .chain(self.args.iter().map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("\"{arg}\"")
                } else {
                    arg.clone()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Backend A: XDG autostart `.desktop` file
#[derive(Debug, Clone)]
pub struct DesktopEntryBackend {
    entry_path: PathBuf,
    command: LaunchCommand,
}

impl DesktopEntryBackend {
    const NAME: &'static str = "desktop-entry";

    pub fn new(paths: &AppPaths, command: LaunchCommand) -> Self {
        Self {
            entry_path: paths.autostart_entry(),
            command,
        }
    }

    fn entry_contents(&self) -> String {
        format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Exec={}\n\
             Hidden=false\n\
             NoDisplay=false\n\
             X-GNOME-Autostart-enabled=true\n\
             Name={}\n",
            self.command.to_command_line(),
            APP_NAME
        )
    }

    fn io_error(source: io::Error) -> RegistrationError {
        RegistrationError::Io {
            backend: Self::NAME,
            source,
        }
    }
}

impl AutostartBackend for DesktopEntryBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self) -> bool {
        self.entry_path.is_file()
    }

    fn enable(&self) -> Result<(), RegistrationError> {
        if let Some(parent) = self.entry_path.parent() {
            fs::create_dir_all(parent).map_err(Self::io_error)?;
        }
        fs::write(&self.entry_path, self.entry_contents()).map_err(Self::io_error)?;
        info!("Autostart entry written to {}", self.entry_path.display());
        Ok(())
    }

    fn disable(&self) -> Result<(), RegistrationError> {
        match fs::remove_file(&self.entry_path) {
            Ok(()) => {
                info!("Autostart entry removed from {}", self.entry_path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(err)),
        }
    }
}

/// Backend B: `HKCU\...\CurrentVersion\Run` value
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct RunKeyBackend {
    value_name: String,
    command: LaunchCommand,
}

#[cfg(windows)]
impl RunKeyBackend {
    const NAME: &'static str = "run-key";
    const RUN_KEY: &'static str = "Software\\Microsoft\\Windows\\CurrentVersion\\Run";

    pub fn new(command: LaunchCommand) -> Self {
        Self {
            value_name: APP_NAME.to_string(),
            command,
        }
    }

    fn io_error(source: io::Error) -> RegistrationError {
        RegistrationError::Io {
            backend: Self::NAME,
            source,
        }
    }
}

#[cfg(windows)]
impl AutostartBackend for RunKeyBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_enabled(&self) -> bool {
        use winreg::enums::{HKEY_CURRENT_USER, KEY_READ};
        use winreg::RegKey;

        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        hkcu.open_subkey_with_flags(Self::RUN_KEY, KEY_READ)
            .and_then(|key| key.get_value::<String, _>(&self.value_name))
            .is_ok()
    }

    fn enable(&self) -> Result<(), RegistrationError> {
        use winreg::enums::HKEY_CURRENT_USER;
        use winreg::RegKey;

        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let (key, _) = hkcu.create_subkey(Self::RUN_KEY).map_err(Self::io_error)?;
        key.set_value(&self.value_name, &self.command.quoted_executable())
            .map_err(Self::io_error)?;
        info!("Autostart value {:?} added to the run key", self.value_name);
        Ok(())
    }

    fn disable(&self) -> Result<(), RegistrationError> {
        use winreg::enums::{HKEY_CURRENT_USER, KEY_SET_VALUE};
        use winreg::RegKey;

        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let key = match hkcu.open_subkey_with_flags(Self::RUN_KEY, KEY_SET_VALUE) {
            Ok(key) => key,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Self::io_error(err)),
        };
        match key.delete_value(&self.value_name) {
            Ok(()) => {
                info!("Autostart value {:?} removed from the run key", self.value_name);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(err)),
        }
    }
}

/// Outcome of a toggle across all backends
#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub failures: Vec<RegistrationError>,
}

impl RegistrationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Every backend available on this platform, driven together
pub struct AutostartRegistrar {
    backends: Vec<Box<dyn AutostartBackend>>,
}

impl AutostartRegistrar {
    pub fn new(backends: Vec<Box<dyn AutostartBackend>>) -> Self {
        Self { backends }
    }

    /// Backends for the platform we were built for
    pub fn for_platform(paths: &AppPaths, command: LaunchCommand) -> Self {
        let mut backends: Vec<Box<dyn AutostartBackend>> = Vec::new();
        #[cfg(windows)]
        backends.push(Box::new(RunKeyBackend::new(command.clone())));
        backends.push(Box::new(DesktopEntryBackend::new(paths, command)));
        Self::new(backends)
    }

    pub fn is_enabled(&self) -> bool {
        self.backends.iter().any(|backend| backend.is_enabled())
    }

    /// Apply the toggle to every backend; one failing backend never stops
    /// the others
    pub fn set_enabled(&self, enabled: bool) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for backend in &self.backends {
            let result = if enabled {
                backend.enable()
            } else {
                backend.disable()
            };
            if let Err(err) = result {
                warn!(
                    "Autostart {} failed on {}: {}",
                    if enabled { "enable" } else { "disable" },
                    backend.name(),
                    err
                );
                report.failures.push(err);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn backend_in(dir: &TempDir) -> (AppPaths, DesktopEntryBackend) {
        let paths = AppPaths::new(dir.path().join("data"), dir.path().join("autostart"));
        let command = LaunchCommand::new("/opt/kiwi widget/kiwi-widget", vec!["--data-dir".into(), "/tmp/my data".into()]);
        let backend = DesktopEntryBackend::new(&paths, command);
        (paths, backend)
    }

    #[test]
    fn desktop_entry_enable_writes_launch_command() {
        let dir = TempDir::new().unwrap();
        let (paths, backend) = backend_in(&dir);
        assert!(!backend.is_enabled());

        backend.enable().unwrap();
        assert!(backend.is_enabled());
        let entry = fs::read_to_string(paths.autostart_entry()).unwrap();
        assert!(entry.starts_with("[Desktop Entry]\n"));
        assert!(entry.contains("Exec=\"/opt/kiwi widget/kiwi-widget\" --data-dir \"/tmp/my data\"\n"));
        assert!(entry.contains("X-GNOME-Autostart-enabled=true\n"));
        assert!(entry.contains("Name=Kiwi Widget\n"));
    }

    #[test]
    fn desktop_entry_disable_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_, backend) = backend_in(&dir);
        backend.disable().unwrap();

        backend.enable().unwrap();
        backend.disable().unwrap();
        assert!(!backend.is_enabled());
        backend.disable().unwrap();
    }

    struct FlakyBackend {
        fail: bool,
        calls: Rc<RefCell<Vec<(&'static str, bool)>>>,
        enabled: RefCell<bool>,
        name: &'static str,
    }

    impl AutostartBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_enabled(&self) -> bool {
            *self.enabled.borrow()
        }

        fn enable(&self) -> Result<(), RegistrationError> {
            self.calls.borrow_mut().push((self.name, true));
            if self.fail {
                return Err(RegistrationError::Io {
                    backend: self.name,
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            *self.enabled.borrow_mut() = true;
            Ok(())
        }

        fn disable(&self) -> Result<(), RegistrationError> {
            self.calls.borrow_mut().push((self.name, false));
            *self.enabled.borrow_mut() = false;
            Ok(())
        }
    }

    #[test]
    fn registrar_keeps_going_when_one_backend_fails() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let registrar = AutostartRegistrar::new(vec![
            Box::new(FlakyBackend {
                fail: true,
                calls: calls.clone(),
                enabled: RefCell::new(false),
                name: "broken",
            }),
            Box::new(FlakyBackend {
                fail: false,
                calls: calls.clone(),
                enabled: RefCell::new(false),
                name: "working",
            }),
        ]);

        let report = registrar.set_enabled(true);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(*calls.borrow(), vec![("broken", true), ("working", true)]);
        assert!(registrar.is_enabled());

        let report = registrar.set_enabled(false);
        assert!(report.is_clean());
        assert!(!registrar.is_enabled());
    }

    #[test]
    fn launch_command_quotes_only_what_needs_it() {
        let command = LaunchCommand::new("/usr/bin/kiwi-widget", vec!["--data-dir".into(), "/srv/kiwi".into()]);
        assert_eq!(
            command.to_command_line(),
            "\"/usr/bin/kiwi-widget\" --data-dir /srv/kiwi"
        );
    }
}
