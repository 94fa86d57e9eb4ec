use clap::{Parser, Subcommand};
use natkeeper::config;
use natkeeper::dataplane::{Nat, SystemClock};
use natkeeper::telemetry::{init_logging, NatMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How often the daemon logs table statistics
const STATS_INTERVAL_SECS: u64 = 60;

#[derive(Parser)]
#[command(name = "natkeeper")]
#[command(about = "NAPT mapping table and expiry daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the NAT table and reaper
    Run {
        /// Path to natkeeper.lock file
        #[arg(short, long, default_value = "natkeeper.lock")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate natkeeper.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for natkeeper.lock
        #[arg(short, long, default_value = "natkeeper.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config { action }) => {
            init_logging(None);
            match action {
                ConfigAction::Generate { config, output } => cmd_config_generate(&config, &output),
                ConfigAction::Validate { config } => cmd_config_validate(&config),
            }
        }
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(&PathBuf::from("natkeeper.lock")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_run(lock_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let settings = config::load_settings(lock_path)
        .map_err(|e| format!("Failed to load {}: {}", lock_path.display(), e))?;

    // RUST_LOG still takes priority over the lock file
    init_logging(Some(&settings.logging));
    info!("Loaded {}", lock_path.display());

    let validation = config::validate_settings(&settings);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err(format!("Invalid settings in {}", lock_path.display()));
    }

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let metrics = Arc::new(NatMetrics::new());
        let nat = Nat::start(
            settings.napt_config(),
            settings.reaper_tick(),
            Arc::new(SystemClock),
            metrics.clone(),
        )
        .map_err(|e| format!("Failed to start NAT table: {}", e))?;

        info!(
            internal_interface = %settings.internal_interface,
            ports = ?settings.ports,
            icmp_ids = ?settings.icmp_ids,
            "NAT table ready"
        );

        let mut stats_timer = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = stats_timer.tick() => {
                    let stats = nat.table().stats();
                    info!(
                        icmp_mappings = stats.icmp_mappings,
                        tcp_mappings = stats.tcp_mappings,
                        connections = stats.connections,
                        ports_in_use = stats.ports_in_use,
                        icmp_ids_in_use = stats.icmp_ids_in_use,
                        "table stats"
                    );
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for shutdown signal: {}", e);
                    }
                    info!("Shutting down...");
                    break;
                }
            }
        }

        nat.shutdown().await;

        for (name, value) in metrics.export() {
            info!("{} = {}", name, value);
        }

        Ok::<(), String>(())
    })
}

fn cmd_config_generate(config_path: &PathBuf, output_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Loading {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let settings = config::resolve(&cfg);

    let lock_toml = toml::to_string_pretty(&settings)
        .map_err(|e| format!("Failed to serialize lock: {}", e))?;

    // Add header comment
    let output = format!(
        "# Generated by natkeeper - DO NOT EDIT\n# Source: {}\n\n{}",
        config_path.display(),
        lock_toml
    );

    std::fs::write(output_path, output).map_err(|e| format!("Failed to write lock file: {}", e))?;

    println!("[INFO] Generated {}", output_path.display());
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}
