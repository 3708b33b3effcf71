mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // Show nomad info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("nomad", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Process {
            path,
            dependencies,
            client_dir,
            server_dir,
            config,
        } => commands::process::run(
            path,
            dependencies,
            &commands::process::OutputDirs {
                client: client_dir,
                server: server_dir,
            },
            config.as_deref(),
            &cli.global,
        ),
        Command::Disasm {
            path,
            r#type,
            method,
        } => commands::disasm::run(path, r#type.as_deref(), method.as_deref()),
        Command::Discover {
            path,
            dependencies,
            r#type,
        } => commands::discover::run(path, dependencies, r#type.as_deref(), &cli.global),
        Command::Hash { paths, algorithm } => commands::hash::run(paths, algorithm, &cli.global),
    }
}
