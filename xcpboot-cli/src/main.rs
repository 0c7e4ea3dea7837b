//! xcpboot CLI - firmware updater for XCP bootloaders.
//!
//! ## Features
//!
//! - BootCommander compatible `-x=value` flags
//! - RS232 and TCP/IP transports
//! - Seed/key unlock through an external key program
//! - Optional AES-256 decryption of the firmware file
//! - Configuration file and environment variable support

use anyhow::Result;
use clap::{Parser, ValueEnum};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// xcpboot - firmware updater for XCP bootloaders.
///
/// Flags accept both BootCommander style (`-t=xcp_net`) and long style
/// (`--transport=xcp_net`).
///
/// Environment variables:
///   XCPBOOT_DEVICE   - Default serial device
///   XCPBOOT_BAUD     - Default baudrate
#[derive(Parser, Debug)]
#[command(name = "xcpboot")]
#[command(author, version, about, long_about = None)]
#[command(
    after_help = "Example: xcpboot -s=xcp -t=xcp_rs232 -d=/dev/ttyUSB0 -b=57600 firmware.srec"
)]
pub(crate) struct Cli {
    /// Session protocol (-s=).
    #[arg(long, value_enum, default_value = "xcp")]
    pub(crate) session: SessionKind,

    /// Transport layer (-t=).
    #[arg(long, value_enum)]
    pub(crate) transport: Option<TransportKind>,

    /// Generic command timeout in ms (-t1=).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) t1: Option<u64>,

    /// PROGRAM_START timeout in ms (-t3=).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) t3: Option<u64>,

    /// Erase timeout in ms (-t4=).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) t4: Option<u64>,

    /// Program timeout in ms (-t5=).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) t5: Option<u64>,

    /// Connect timeout in ms (-t6=).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) t6: Option<u64>,

    /// Busy wait timeout in ms (-t7=).
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) t7: Option<u64>,

    /// Serial device or CAN interface (-d=).
    #[arg(long, env = "XCPBOOT_DEVICE")]
    pub(crate) device: Option<String>,

    /// Serial or CAN baudrate (-b=).
    #[arg(long, env = "XCPBOOT_BAUD")]
    pub(crate) baudrate: Option<u32>,

    /// CAN channel index (-c=).
    #[arg(long)]
    pub(crate) channel: Option<u32>,

    /// CAN transmit identifier, hex (-tid=).
    #[arg(long, value_parser = parse_hex_u32)]
    pub(crate) tid: Option<u32>,

    /// CAN receive identifier, hex (-rid=).
    #[arg(long, value_parser = parse_hex_u32)]
    pub(crate) rid: Option<u32>,

    /// Use 29-bit CAN identifiers, 0 or 1 (-xid=).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub(crate) xid: Option<u8>,

    /// Target host name or IP address (-a=).
    #[arg(long)]
    pub(crate) address: Option<String>,

    /// Target TCP port (-p=).
    #[arg(long)]
    pub(crate) port: Option<u16>,

    /// External seed/key program (-sk=).
    #[arg(long, value_name = "PATH")]
    pub(crate) seed_key: Option<PathBuf>,

    /// CONNECT mode byte (-cm=).
    #[arg(long)]
    pub(crate) connect_mode: Option<u8>,

    /// AES-256 key (64 hex digits) for encrypted firmware (-ky=).
    #[arg(long, value_name = "HEX")]
    pub(crate) key: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    /// Firmware file (S-record).
    pub(crate) firmware: PathBuf,
}

/// Supported session protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum SessionKind {
    /// XCP version 1.0.
    Xcp,
}

/// Supported transport layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum TransportKind {
    /// XCP on RS232 (default).
    #[value(name = "xcp_rs232")]
    Rs232,
    /// XCP on CAN.
    #[value(name = "xcp_can")]
    Can,
    /// XCP on USB.
    #[value(name = "xcp_usb")]
    Usb,
    /// XCP on TCP/IP.
    #[value(name = "xcp_net")]
    Net,
}

/// CLI level error carrying the process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid or incomplete command line.
    #[error("{0}")]
    CommandLine(String),
    /// The firmware file could not be loaded or decrypted.
    #[error("could not load firmware file")]
    FirmwareLoad(#[source] xcpboot::Error),
    /// Erasing target memory failed.
    #[error("could not erase memory")]
    Erase(#[source] xcpboot::Error),
    /// Programming target memory failed.
    #[error("could not program memory")]
    Program(#[source] xcpboot::Error),
    /// The user cancelled the run.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    /// Process exit code for this error.
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Self::CommandLine(_) => 1,
            Self::FirmwareLoad(_) => 2,
            Self::Erase(_) => 3,
            Self::Program(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// BootCommander flag names and their long equivalents.
const BOOTCOMMANDER_FLAGS: &[(&str, &str)] = &[
    ("s", "session"),
    ("t", "transport"),
    ("t1", "t1"),
    ("t3", "t3"),
    ("t4", "t4"),
    ("t5", "t5"),
    ("t6", "t6"),
    ("t7", "t7"),
    ("d", "device"),
    ("b", "baudrate"),
    ("c", "channel"),
    ("tid", "tid"),
    ("rid", "rid"),
    ("xid", "xid"),
    ("a", "address"),
    ("p", "port"),
    ("sk", "seed-key"),
    ("cm", "connect-mode"),
    ("ky", "key"),
];

/// Rewrite `-x=value` arguments into `--long=value` so clap can parse them.
///
/// Anything that is not a known single-dash assignment is passed through.
fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            let Some(rest) = arg.strip_prefix('-') else {
                return arg;
            };
            if rest.starts_with('-') {
                return arg;
            }
            let Some((key, value)) = rest.split_once('=') else {
                return arg;
            };
            match BOOTCOMMANDER_FLAGS.iter().find(|(short, _)| *short == key) {
                Some((_, long)) => format!("--{long}={value}"),
                None => arg,
            }
        })
        .collect()
}

/// Parse hexadecimal value (supports 0x prefix and underscores).
pub(crate) fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn main() {
    let cli = match Cli::try_parse_from(normalize_args(env::args())) {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout and are not failures.
            let code = i32::from(err.use_stderr());
            let _ = err.print();
            std::process::exit(code);
        },
    };

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "xcpboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {err}");
    }
    xcpboot::set_interrupt_checker(was_interrupted);

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let code = match commands::update::cmd_update(&cli, &config) {
        Ok(()) => 0,
        Err(err) => report_error(&err),
    };
    std::process::exit(code);
}

/// Print `err` with its cause chain and return the exit code.
fn report_error(err: &anyhow::Error) -> i32 {
    eprintln!("{} {err:#}", style("Error:").red().bold());
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}
