use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;

use corebot::{
    config::{ConfigStore, LoggingConfig},
    constants::*,
    emit_system_event,
    events,
    module_host::{DylibLoader, Kernel},
    modules::builtin_modules,
    scheduler::{install_stop_signals, unix_now, Scheduler},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "corebot module host")]
struct Args {
    /// Path to the config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Directory holding dynamically loadable modules
    #[arg(short, long, default_value = DEFAULT_MODULE_DIR)]
    module_dir: PathBuf,
}

fn main() {
    let args = Args::parse();
    let code = match run(args) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            EXIT_NO_MODULES
        }
    };
    events::flush();
    std::process::exit(code);
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = match ConfigStore::load(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("⚠️ {}, continuing without configuration.", err);
            ConfigStore::new()
        }
    };

    events::init_events_from_config(&LoggingConfig::from_store(&config));
    emit_system_event!(
        "config",
        LogLevel::Info,
        "loaded",
        Some(format!("path={} entries={}", args.config, config.len()))
    );

    let names = config
        .module_names()
        .filter(|names| !names.is_empty())
        .context("no modules in config, abort")?;

    let mut kernel = Kernel::new(config)
        .with_source(Box::new(builtin_modules()))
        .with_source(Box::new(DylibLoader::new(&args.module_dir)));
    for name in &names {
        kernel.add_module(name.as_str());
    }

    kernel.set_now(unix_now());
    let loaded = kernel.load_all();
    println!(
        "🟢 {} v{} running with {}/{} modules. Press Ctrl+C to shut down...",
        DEFAULT_APP_NAME,
        APP_VERSION,
        loaded,
        names.len()
    );

    install_stop_signals();
    Scheduler::new(kernel).run();
    println!("🛑 {} shut down gracefully.", DEFAULT_APP_NAME);
    Ok(())
}
