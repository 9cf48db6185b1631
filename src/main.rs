mod audit;
mod bridge;
mod config;
mod core;
mod error;
mod profile;
mod sessions;
mod settings;
mod supervisor;
mod syftbox;
mod vault;

use std::sync::Mutex;

use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::EnvConfig;

#[derive(Parser)]
#[command(name = "biovault", about = "BioVault collaboration core")]
enum Cli {
    /// Run the collaboration core (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Print the bridge command schema and exit
    Schema,
}

fn main() {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but keep --help and
    // --version working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let exit_code = match cli {
        Cli::Schema => {
            let registry = bridge::handlers::build_registry();
            let schema = registry.schema(&settings::Settings::default());
            println!("{}", serde_json::to_string_pretty(&schema).expect("schema serializes"));
            0
        }
        Cli::Serve => run_server(),
    };
    std::process::exit(exit_code);
}

fn run_server() -> i32 {
    let env = EnvConfig::from_env();
    let config_root = env
        .config_root
        .clone()
        .unwrap_or_else(profile::default_config_root);

    // Logging goes to the console and to {home}/logs/desktop.log.
    let home = crate::core::resolve_home(&env, &config_root);
    let _ = std::fs::create_dir_all(home.join("logs"));
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(home.join("logs").join("desktop.log"));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("biovault=info,tower_http=warn,hyper=warn"));
    let console = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(false);
    let registry = tracing_subscriber::registry().with(filter).with(console);
    match log_file {
        Ok(file) => {
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        Err(e) => {
            registry.init();
            tracing::warn!(error = %e, "desktop.log unavailable; logging to console only");
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("fatal: failed to start runtime: {e}");
            return 1;
        }
    };

    match runtime.block_on(supervisor::run(env, &config_root)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal initialization error");
            eprintln!("fatal: {e:#}");
            1
        }
    }
}
