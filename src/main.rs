// kiwi-widget - An always-on-top animated GIF widget for Wayland
// Shows a looping GIF in a rounded, frameless overlay with a small control panel

mod animator;
mod autostart;
mod cli;
mod drag;
mod fetch;
mod geometry;
mod image_loader;
mod mask;
mod overlay;
mod panel;
mod paths;
mod relaunch;
mod session;
mod store;

use anyhow::{Context, Result};
use log::info;

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::parse_args();

    let paths = paths::AppPaths::resolve(args.data_dir.as_deref());
    paths.ensure_dirs().with_context(|| {
        format!(
            "Failed to create data folder {}",
            paths.data_dir().display()
        )
    })?;
    info!(
        "Starting kiwi-widget with data folder {}",
        paths.data_dir().display()
    );

    let command = autostart::LaunchCommand::current(args.echo(paths.data_dir()))
        .context("Failed to locate the running executable")?;
    let registrar = autostart::AutostartRegistrar::for_platform(&paths, command.clone());
    let relauncher = relaunch::for_platform(command);

    let session = session::SessionController::new(
        &paths,
        registrar,
        Box::new(fetch::HttpFetcher::new()),
        relauncher,
    );

    overlay::run(session)
}
