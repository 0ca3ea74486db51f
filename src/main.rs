mod args;
mod config;
mod distro;
mod engine;
mod error;
mod messenger;
mod mounts;
mod namespaces;
mod process;
mod retry;
mod scripts;
mod tool;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;

use crate::distro::Debian;
use crate::engine::BootstrapEngine;
use crate::messenger::{LogMessenger, Messenger};
use crate::namespaces::LinuxIsolator;
use crate::process::HostExecutor;

fn main() -> Result<()> {
    let app = args::App::parse();

    let mut builder = pretty_env_logger::formatted_timed_builder();
    let log_level = if app.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    builder.filter_level(log_level);
    builder.init();

    let release = app.release.clone();
    let mirror = app.mirror.clone();
    let config = app.into_config()?;

    let messenger = LogMessenger;
    let executor = HostExecutor::new(&messenger);
    let distro = Debian::new(release, mirror, &executor, &messenger);
    let isolator = LinuxIsolator;

    let mut engine = BootstrapEngine::new(config, &messenger, &executor, &distro, &isolator);
    engine.preflight()?;
    engine.run()?;

    messenger.info("Done.");
    Ok(())
}
