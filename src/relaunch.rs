// Process restart
// Schedules a fresh instance before the current one exits

use crate::autostart::LaunchCommand;
use log::{debug, info};
use std::io;
use std::process::{Command, ExitStatus};
use thiserror::Error;

/// Task scheduler entry used for deferred restarts on Windows
pub const RESTART_TASK_NAME: &str = "Kiwi_Widget_Restart";

/// Delay before the scheduled task fires
pub const RESTART_DELAY_SECS: i64 = 10;

#[derive(Debug, Error)]
pub enum RelaunchError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// Starts a new instance of the program; the caller exits on success
pub trait Relauncher {
    fn schedule(&self) -> Result<(), RelaunchError>;
}

/// Something that runs an external command to completion
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ExitStatus, io::Error>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ExitStatus, io::Error> {
        Command::new(program).args(args).status()
    }
}

/// `schtasks` based restart: the task is always deleted before being
/// recreated so repeated restarts never leave duplicates behind
pub struct TaskSchedulerRelauncher<R: CommandRunner = SystemRunner> {
    command: LaunchCommand,
    runner: R,
}

impl TaskSchedulerRelauncher<SystemRunner> {
    pub fn new(command: LaunchCommand) -> Self {
        Self::with_runner(command, SystemRunner)
    }
}

impl<R: CommandRunner> TaskSchedulerRelauncher<R> {
    pub fn with_runner(command: LaunchCommand, runner: R) -> Self {
        Self { command, runner }
    }

    /// The three `schtasks` invocations in execution order
    pub fn invocations(&self, start_time: &str) -> [Vec<String>; 3] {
        let owned = |args: &[&str]| args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
        let task_command = self.command.to_command_line();
        [
            owned(&["/delete", "/tn", RESTART_TASK_NAME, "/f"]),
            owned(&[
                "/create",
                "/tn",
                RESTART_TASK_NAME,
                "/tr",
                task_command.as_str(),
                "/sc",
                "once",
                "/st",
                start_time,
                "/f",
            ]),
            owned(&["/run", "/tn", RESTART_TASK_NAME]),
        ]
    }

    fn run_checked(&self, args: &[String]) -> Result<(), RelaunchError> {
        let status = self
            .runner
            .run("schtasks", args)
            .map_err(|source| RelaunchError::Spawn {
                program: "schtasks".to_string(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(RelaunchError::Failed {
                program: "schtasks".to_string(),
                status,
            })
        }
    }
}

impl<R: CommandRunner> Relauncher for TaskSchedulerRelauncher<R> {
    fn schedule(&self) -> Result<(), RelaunchError> {
        let start = chrono::Local::now() + chrono::Duration::seconds(RESTART_DELAY_SECS);
        let [delete, create, run] = self.invocations(&start.format("%H:%M").to_string());

        // a missing task makes /delete fail, which is expected on first use
        if let Err(err) = self.run_checked(&delete) {
            debug!("Previous restart task not removed: {}", err);
        }
        self.run_checked(&create)?;
        self.run_checked(&run)?;
        info!("Restart scheduled through task {}", RESTART_TASK_NAME);
        Ok(())
    }
}

/// Spawns the executable again right away
pub struct SpawnRelauncher {
    command: LaunchCommand,
}

impl SpawnRelauncher {
    pub fn new(command: LaunchCommand) -> Self {
        Self { command }
    }
}

impl Relauncher for SpawnRelauncher {
    fn schedule(&self) -> Result<(), RelaunchError> {
        let child = Command::new(&self.command.executable)
            .args(&self.command.args)
            .spawn()
            .map_err(|source| RelaunchError::Spawn {
                program: self.command.executable.display().to_string(),
                source,
            })?;
        info!("Relaunched as pid {}", child.id());
        Ok(())
    }
}

/// Restart strategy for the platform we were built for
pub fn for_platform(command: LaunchCommand) -> Box<dyn Relauncher> {
    if cfg!(windows) {
        Box::new(TaskSchedulerRelauncher::new(command))
    } else {
        Box::new(SpawnRelauncher::new(command))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;

    struct RecordingRunner {
        calls: RefCell<Vec<Vec<String>>>,
        fail_first: bool,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<ExitStatus, io::Error> {
            assert_eq!(program, "schtasks");
            let mut calls = self.calls.borrow_mut();
            let first = calls.is_empty();
            calls.push(args.to_vec());
            let code = if first && self.fail_first { 1 } else { 0 };
            Ok(ExitStatus::from_raw(code << 8))
        }
    }

    fn relauncher(fail_first: bool) -> TaskSchedulerRelauncher<RecordingRunner> {
        TaskSchedulerRelauncher::with_runner(
            LaunchCommand::new("C:/Kiwi/kiwi-widget.exe", Vec::new()),
            RecordingRunner {
                calls: RefCell::new(Vec::new()),
                fail_first,
            },
        )
    }

    #[test]
    fn repeated_restarts_delete_before_recreating() {
        let relauncher = relauncher(false);
        relauncher.schedule().unwrap();
        relauncher.schedule().unwrap();

        let calls = relauncher.runner.calls.borrow();
        let verbs: Vec<&str> = calls.iter().map(|args| args[0].as_str()).collect();
        assert_eq!(verbs, ["/delete", "/create", "/run", "/delete", "/create", "/run"]);
        assert!(calls[1].contains(&"\"C:/Kiwi/kiwi-widget.exe\"".to_string()));
        assert!(calls[1].contains(&RESTART_TASK_NAME.to_string()));
    }

    #[test]
    fn missing_previous_task_is_not_an_error() {
        let relauncher = relauncher(true);
        relauncher.schedule().unwrap();
        assert_eq!(relauncher.runner.calls.borrow().len(), 3);
    }

    #[test]
    fn spawn_failure_surfaces_as_relaunch_error() {
        let relauncher = SpawnRelauncher::new(LaunchCommand::new(
            "/nonexistent/kiwi-widget-binary",
            Vec::new(),
        ));
        assert!(matches!(
            relauncher.schedule(),
            Err(RelaunchError::Spawn { .. })
        ));
    }
}
