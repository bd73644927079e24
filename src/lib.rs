// src/lib.rs
//
// RoboGo serial bridge: links a host to a RoboGo controller over USB serial,
// prints what the controller reports and forwards commands typed on stdin.

#[macro_use]
mod logging;

pub mod error;
pub mod io;
pub mod settings;

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use io::serial::{
    list_controller_ports, list_serial_ports, Frame, FrameSink, LinkState, NegotiatorConfig,
    SerialLink, SerialportTransport,
};
use settings::BridgeSettings;

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "robogo-bridge", version, about = "Serial bridge for RoboGo controllers")]
struct Cli {
    /// Also write logs to a timestamped file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List serial ports that look like controllers
    Ports {
        /// Show every serial port, not only likely controllers
        #[arg(long)]
        all: bool,
    },
    /// Open a link, print device frames and send stdin lines as commands
    Connect {
        /// Device path (defaults to the saved port)
        #[arg(long)]
        port: Option<String>,
        /// Preferred baud rate (defaults to the saved rate)
        #[arg(long)]
        baud: Option<u32>,
        /// Connect at exactly this baud rate instead of negotiating
        #[arg(long)]
        fixed: bool,
        /// Print frame text only, without the JSON envelope
        #[arg(long)]
        raw: bool,
        /// Save the port and committed baud rate once connected
        #[arg(long)]
        save: bool,
    },
    /// Show or change saved link settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
    SetPort { port: String },
    SetBaud { baud: u32 },
    Reset,
}

// ============================================================================
// Entry Point
// ============================================================================

pub fn run() {
    let cli = Cli::parse();

    if let Some(dir) = &cli.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            eprintln!("[setup] Failed to start file logging: {}", e);
        }
    }

    let result = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(dispatch(cli.command)),
        Err(e) => Err(format!("Failed to start runtime: {}", e)),
    };

    logging::stop_file_logging();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Command) -> Result<(), String> {
    match command {
        Command::Ports { all } => print_ports(all),
        Command::Connect {
            port,
            baud,
            fixed,
            raw,
            save,
        } => run_bridge(port, baud, fixed, raw, save).await,
        Command::Config { action } => run_config(action),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn print_ports(all: bool) -> Result<(), String> {
    let ports = if all {
        list_serial_ports()
    } else {
        list_controller_ports()
    }
    .map_err(|e| e.to_string())?;

    let json = serde_json::to_string_pretty(&ports)
        .map_err(|e| format!("Failed to serialize port list: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn run_config(action: ConfigAction) -> Result<(), String> {
    match action {
        ConfigAction::Show => {
            let settings = settings::load_settings()?;
            print_settings(&settings)
        }
        ConfigAction::SetPort { port } => {
            let mut settings = settings::load_settings()?;
            settings.serial_port = Some(port);
            settings::save_settings(&settings)?;
            print_settings(&settings)
        }
        ConfigAction::SetBaud { baud } => {
            if baud == 0 {
                return Err("Baud rate must be greater than zero".to_string());
            }
            let mut settings = settings::load_settings()?;
            settings.baud_rate = baud;
            settings::save_settings(&settings)?;
            print_settings(&settings)
        }
        ConfigAction::Reset => {
            if settings::reset_settings()? {
                println!("Settings reset to defaults");
            } else {
                println!("No saved settings");
            }
            Ok(())
        }
    }
}

fn print_settings(settings: &BridgeSettings) -> Result<(), String> {
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    println!("{}", json);
    Ok(())
}

// ============================================================================
// Bridge
// ============================================================================

async fn run_bridge(
    port: Option<String>,
    baud: Option<u32>,
    fixed: bool,
    raw: bool,
    save: bool,
) -> Result<(), String> {
    let mut saved = settings::load_settings()?;

    let path = port
        .or_else(|| saved.serial_port.clone())
        .ok_or_else(|| "No serial port given; pass --port or run `config set-port`".to_string())?;
    let baud_rate = baud.unwrap_or(saved.baud_rate);

    let sink: FrameSink = Arc::new(move |frame: Frame| print_frame(&frame, raw));
    let mut link = SerialLink::new(
        Arc::new(SerialportTransport::default()),
        NegotiatorConfig::default(),
        sink,
    );

    let connected = if fixed {
        link.connect_fixed(&path, baud_rate).await
    } else {
        link.negotiate(&path, baud_rate).await
    };
    let info = connected.map_err(|e| e.to_string())?;

    tlog!(
        "[bridge] Linked to {} at {} baud after {} attempt(s)",
        info.path,
        info.baud_rate,
        info.attempts.len()
    );

    if save {
        saved.serial_port = Some(info.path.clone());
        saved.baud_rate = info.baud_rate;
        if let Err(e) = settings::save_settings(&saved) {
            tlog!("[bridge] {}", e);
        }
    }

    let result = forward_commands(&link).await;
    link.close().await;
    result
}

/// Send stdin lines until stdin closes, Ctrl-C, or the link drops
async fn forward_commands(link: &SerialLink) -> Result<(), String> {
    let mut state_rx = link.subscribe_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }
                    if let Err(e) = link.send(command).await {
                        tlog!("[bridge] Failed to send {:?}: {}", command, e);
                    }
                }
                Ok(None) => {
                    tlog!("[bridge] stdin closed, disconnecting");
                    return Ok(());
                }
                Err(e) => return Err(format!("Failed to read stdin: {}", e)),
            },
            changed = state_rx.changed() => {
                if changed.is_err() || link.state() == LinkState::Disconnected {
                    return Err("Serial link lost".to_string());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tlog!("[bridge] Interrupted, disconnecting");
                return Ok(());
            }
        }
    }
}

fn print_frame(frame: &Frame, raw: bool) {
    let mut out = std::io::stdout().lock();
    if let Err(e) = write_frame(&mut out, frame, raw) {
        tlog!("[bridge] Failed to write frame to stdout: {}", e);
    }
}

/// One frame per line: the frame text when `raw`, otherwise a `{kind,text}` JSON object
fn write_frame<W: Write>(out: &mut W, frame: &Frame, raw: bool) -> std::io::Result<()> {
    if raw {
        writeln!(out, "{}", frame.as_str())?;
    } else {
        serde_json::to_writer(&mut *out, frame)?;
        writeln!(out)?;
    }
    out.flush()
}
