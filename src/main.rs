mod asm;
mod cli;
mod config;
mod device;
mod digest;
mod error;
mod harvest;
mod logging;
mod output;
mod patcher;
mod session;
mod signal;
mod validate;

use std::path::Path;
use std::process;

use clap::Parser;

use cli::{Cli, Command, SessionArgs};
use config::Config;

/// Build the Config by layering: defaults → TOML file → CLI overrides.
fn build_config(config_file: Option<&Path>, session: &SessionArgs) -> Config {
    let mut cfg = match config::load_config(config_file) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("{}", e);
            Config::default()
        }
    };
    session.apply(&mut cfg);
    cfg
}

fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Assemble(args)) => {
            logging::init(&args.log, false);
            let mut cfg = build_config(args.config_file.as_deref(), &args.session);
            cfg.validate();
            let stdout = std::io::stdout();
            if let Err(e) = session::print_patches(&cfg, &mut stdout.lock()) {
                log::error!("{}", e);
                process::exit(1);
            }
        }
        None => {
            logging::init(&cli.log, true);
            let mut cfg = build_config(cli.config_file.as_deref(), &cli.session);
            cli.simulator.apply(&mut cfg);
            if let Some(dir) = &cli.output_dir {
                cfg.output.directory = dir.clone();
            }
            if let Some(format) = cli.format {
                cfg.output.format = format;
            }
            cfg.validate();

            if let Err(e) = session::run(&cfg) {
                log::error!("{}", e);
                process::exit(1);
            }
        }
    }
}
