//! `simplepid` – PID controller host
//!
//! 1. Loads `~/.simplepid/config.toml`, writing a default one on first run.
//! 2. Registers each controller's parameter entities in an in-process store
//!    and starts a simulated plant per controller.
//! 3. Sets every controller up (retrying while its sensor is not ready).
//! 4. Reads operator commands from stdin until `/quit`, EOF, or Ctrl-C,
//!    then shuts every controller down.

mod config;
mod console;
mod sim;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use simplepid_params::ParameterStore;
use simplepid_runtime::{ControllerRegistry, OutputOverrideService, register_parameter_entities};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::console::{Console, Flow};

fn main() {
    let _telemetry = simplepid_runtime::init_tracing("simplepid");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping controllers …".yellow().bold());
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            Config::default()
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build Tokio runtime");
            std::process::exit(1);
        }
    };
    runtime.block_on(run(cfg, shutdown));
}

async fn run(cfg: Config, shutdown: Arc<AtomicBool>) {
    let store = ParameterStore::new();
    let registry = Arc::new(ControllerRegistry::new(
        Arc::new(store.clone()),
        cfg.runtime_settings(),
    ));

    let mut plants = Vec::new();
    for controller in &cfg.controllers {
        register_parameter_entities(&store, &controller.device, &controller.parameters);
        plants.push(sim::spawn_plant(
            controller.device.name.clone(),
            controller.device.sensor_entity_id.clone(),
            store.clone(),
            Arc::clone(&registry),
            cfg.simulation.clone(),
        ));
    }

    for controller in &cfg.controllers {
        let name = &controller.device.name;
        match registry.load(controller.device.clone()).await {
            Ok(instance) => println!(
                "  {} {} → {}",
                "✓".green(),
                name.bold(),
                instance.output_entity()
            ),
            Err(e) => {
                error!(instance = %name, error = %e, "controller setup failed");
                println!("  {} {}: {}", "✗".red(), name.bold(), e);
            }
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let console = Console::new(store.clone(), OutputOverrideService::new(Arc::clone(&registry)));
    let mut lines = spawn_stdin_reader();
    let mut shutdown_poll = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if console.execute(&line).await == Flow::Quit {
                        println!("{}", "Goodbye.".green());
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_poll.tick() => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    registry.unload_all();
    for plant in plants {
        plant.abort();
    }
    info!("simplepid stopped");
}

/// Forward stdin lines from a blocking thread; the channel closes on EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        use std::io::{BufRead, Write};
        let stdin = std::io::stdin();
        loop {
            print!("{} ", "simplepid>".bold().cyan());
            std::io::stdout().flush().ok();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Read error".red(), e);
                    break;
                }
            }
        }
    });
    rx
}

fn print_banner() {
    println!();
    println!("{}", r#"     _                 _                 _     _ "#.bold().cyan());
    println!("{}", r#" ___(_)_ __ ___  _ __ | | ___ _ __ (_) __| |"#.bold().cyan());
    println!("{}", r#"/ __| | '_ ` _ \| '_ \| |/ _ \ '_ \| |/ _` |"#.bold().cyan());
    println!("{}", r#"\__ \ | | | | | | |_) | |  __/ |_) | | (_| |"#.bold().cyan());
    println!("{}", r#"|___/_|_| |_| |_| .__/|_|\___| .__/|_|\__,_|"#.bold().cyan());
    println!("{}", r#"                |_|          |_|             "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "simplepid".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Closed-loop PID controller host");
    println!();
}
