//! Firmware update: load, connect, erase, program, finish.

use anyhow::{Context, Result};
use clap::ValueEnum;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::io::Write as _;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xcpboot::transport::can::CanSettings;
use xcpboot::transport::net::{NetSettings, XcpNetTransport};
use xcpboot::transport::serial::{SerialSettings, XcpSerialTransport};
#[cfg(target_os = "linux")]
use xcpboot::transport::socketcan::XcpSocketCanTransport;
use xcpboot::transport::usb::{UsbSettings, XcpUsbTransport};
use xcpboot::{
    ExternalKeyProgram, FirmwareData, FirmwareDecryptor, Session, XcpLoader, XcpLoaderSettings,
    XcpTransport,
};

use crate::config::Config;
use crate::{Cli, CliError, TransportKind, use_fancy_output, was_interrupted};

/// Baudrate used when neither the command line nor a config file names one.
pub(crate) const DEFAULT_BAUDRATE: u32 = 57600;

/// Pause between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Print `label`, run `f` and report OK or ERROR on the same line.
fn run_phase<T, E>(quiet: bool, label: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
    if !quiet {
        eprint!("{label}... ");
        let _ = std::io::stderr().flush();
    }
    let result = f();
    if !quiet {
        match &result {
            Ok(_) => eprintln!("{}", style("OK").green().bold()),
            Err(_) => eprintln!("{}", style("ERROR").red().bold()),
        }
    }
    result
}

/// Transport selected on the command line, falling back to the config file.
pub(crate) fn resolve_transport(cli: &Cli, config: &Config) -> Result<TransportKind> {
    if let Some(kind) = cli.transport {
        return Ok(kind);
    }
    match config.connection.transport.as_deref() {
        Some(name) => TransportKind::from_str(name, true).map_err(|_| {
            CliError::CommandLine(format!("unknown transport '{name}' in configuration")).into()
        }),
        None => Ok(TransportKind::Rs232),
    }
}

/// Loader settings from defaults, config file and command line (in that order).
pub(crate) fn loader_settings(cli: &Cli, config: &Config) -> XcpLoaderSettings {
    fn timeout(cli: Option<u64>, config: Option<u64>, default: Duration) -> Duration {
        cli.or(config).map_or(default, Duration::from_millis)
    }

    let mut settings = XcpLoaderSettings::default();
    let t = &config.timeouts;
    settings.t1 = timeout(cli.t1, t.t1, settings.t1);
    settings.t3 = timeout(cli.t3, t.t3, settings.t3);
    settings.t4 = timeout(cli.t4, t.t4, settings.t4);
    settings.t5 = timeout(cli.t5, t.t5, settings.t5);
    settings.t6 = timeout(cli.t6, t.t6, settings.t6);
    settings.t7 = timeout(cli.t7, t.t7, settings.t7);

    if let Some(mode) = cli.connect_mode.or(config.session.connect_mode) {
        settings = settings.with_connect_mode(mode);
    }
    let seed_key = cli
        .seed_key
        .clone()
        .or_else(|| config.session.seed_key.clone());
    if let Some(program) = seed_key {
        debug!("Using seed/key program {}", program.display());
        settings = settings.with_seed_key(Arc::new(ExternalKeyProgram::new(program)));
    }
    settings
}

/// Build the transport named on the command line.
pub(crate) fn build_transport(cli: &Cli, config: &Config) -> Result<Box<dyn XcpTransport>> {
    let conn = &config.connection;
    let device = cli.device.clone().or_else(|| conn.device.clone());

    match resolve_transport(cli, config)? {
        TransportKind::Rs232 => {
            let device = device.ok_or_else(|| {
                CliError::CommandLine("xcp_rs232 requires a serial device (-d=)".to_string())
            })?;
            let baudrate = cli.baudrate.or(conn.baudrate).unwrap_or(DEFAULT_BAUDRATE);
            debug!("Serial transport on {device} at {baudrate} bit/s");
            Ok(Box::new(XcpSerialTransport::new(SerialSettings::new(
                device, baudrate,
            ))))
        },
        TransportKind::Net => {
            let address = cli
                .address
                .clone()
                .or_else(|| conn.address.clone())
                .ok_or_else(|| {
                    CliError::CommandLine("xcp_net requires a target address (-a=)".to_string())
                })?;
            let mut settings = NetSettings::new(address, NetSettings::default().port);
            if let Some(port) = cli.port.or(conn.port) {
                settings.port = port;
            }
            debug!("TCP transport to {}:{}", settings.address, settings.port);
            Ok(Box::new(XcpNetTransport::new(settings)))
        },
        TransportKind::Can => {
            let defaults = CanSettings::default();
            let settings = CanSettings {
                device: device.ok_or_else(|| {
                    CliError::CommandLine("xcp_can requires a CAN interface (-d=)".to_string())
                })?,
                channel: cli.channel.or(conn.channel).unwrap_or(defaults.channel),
                baudrate: cli.baudrate.or(conn.baudrate).unwrap_or(defaults.baudrate),
                transmit_id: cli.tid.unwrap_or(defaults.transmit_id),
                receive_id: cli.rid.unwrap_or(defaults.receive_id),
                extended_ids: cli.xid.map_or(defaults.extended_ids, |x| x == 1),
            };
            settings
                .validate()
                .map_err(|e| CliError::CommandLine(e.to_string()))?;
            can_transport(settings)
        },
        TransportKind::Usb => {
            let settings = UsbSettings::default();
            debug!(
                "USB transport to {:04x}:{:04x}",
                settings.vendor_id, settings.product_id
            );
            Ok(Box::new(XcpUsbTransport::new(settings)))
        },
    }
}

#[cfg(target_os = "linux")]
fn can_transport(settings: CanSettings) -> Result<Box<dyn XcpTransport>> {
    debug!(
        "SocketCAN transport on {} (tx {:#x}, rx {:#x})",
        settings.device, settings.transmit_id, settings.receive_id
    );
    Ok(Box::new(XcpSocketCanTransport::socketcan(settings)))
}

#[cfg(not(target_os = "linux"))]
fn can_transport(settings: CanSettings) -> Result<Box<dyn XcpTransport>> {
    Err(CliError::CommandLine(format!(
        "xcp_can: no CAN driver is available for device '{}' on this platform",
        settings.device
    ))
    .into())
}

/// Load the firmware file and decrypt it when a key was given.
fn load_firmware(cli: &Cli) -> Result<FirmwareData, CliError> {
    let decryptor = cli
        .key
        .as_deref()
        .map(|hex| -> Result<FirmwareDecryptor, CliError> {
            let key = xcpboot::hex::parse_hex(hex)
                .map_err(|e| CliError::CommandLine(format!("invalid key: {e}")))?;
            FirmwareDecryptor::new(&key).map_err(|e| CliError::CommandLine(e.to_string()))
        })
        .transpose()?;

    let mut firmware = FirmwareData::new();
    run_phase(
        cli.quiet,
        &format!("Loading firmware file {}", cli.firmware.display()),
        || -> xcpboot::Result<()> {
            firmware.load_from_file(&cli.firmware, 0)?;
            if let Some(decryptor) = &decryptor {
                decryptor.decrypt_firmware(&mut firmware)?;
            }
            Ok(())
        },
    )
    .map_err(CliError::FirmwareLoad)?;

    info!(
        "Firmware: {} segment(s), {} bytes, CRC32 {:#010x}",
        firmware.segment_count(),
        firmware.total_len(),
        firmware.firmware_crc32()
    );
    Ok(firmware)
}

/// Status shown after the first failed connection attempt.
fn attempt_failure_label(err: &xcpboot::Error) -> &'static str {
    if err.is_timeout() {
        "Timeout"
    } else {
        "no response"
    }
}

/// Call `start` until the target answers; only Ctrl-C ends the loop early.
fn connect(cli: &Cli, session: &mut Session) -> Result<()> {
    if !cli.quiet {
        eprint!("Connecting to target bootloader... ");
        let _ = std::io::stderr().flush();
    }
    let mut prompted = false;
    loop {
        match session.start() {
            Ok(()) => break,
            Err(err) => {
                if was_interrupted() {
                    if !cli.quiet {
                        eprintln!("{}", style("ERROR").red().bold());
                    }
                    return ensure_not_interrupted();
                }
                let cause = std::error::Error::source(&err)
                    .map_or_else(|| err.to_string(), ToString::to_string);
                debug!("Connect attempt failed: {cause}");
                if !prompted {
                    prompted = true;
                    if !err.is_timeout() {
                        warn!("{cause}");
                    }
                    if !cli.quiet {
                        eprintln!("{}", style(attempt_failure_label(&err)).yellow());
                        eprint!("Please reset your target... ");
                        let _ = std::io::stderr().flush();
                    }
                }
                thread::sleep(CONNECT_RETRY_DELAY);
            },
        }
    }
    if !cli.quiet {
        eprintln!("{}", style("OK").green().bold());
    }
    Ok(())
}

fn progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Erase every segment's range.
fn erase(cli: &Cli, session: &mut Session, firmware: &FirmwareData) -> Result<()> {
    for seg in firmware.segments() {
        ensure_not_interrupted()?;
        run_phase(
            cli.quiet,
            &format!(
                "Erasing {} bytes starting at {:#010x}",
                seg.len(),
                seg.base()
            ),
            || session.clear_memory(seg.base(), seg.len_u32()),
        )
        .map_err(CliError::Erase)?;
    }
    Ok(())
}

/// Program every segment, reporting progress over the whole firmware.
fn program(cli: &Cli, session: &mut Session, firmware: &FirmwareData) -> Result<()> {
    let pb = progress_bar(cli, firmware.total_len());
    let mut written = 0usize;
    for seg in firmware.segments() {
        ensure_not_interrupted()?;
        let label = format!(
            "Programming {} bytes starting at {:#010x}",
            seg.len(),
            seg.base()
        );
        pb.set_message(format!("{:#010x}", seg.base()));
        let offset = written;
        let result = session.write_data_with_progress(seg.base(), seg.data(), |done| {
            pb.set_position((offset + done) as u64);
        });
        if !cli.quiet {
            pb.suspend(|| {
                let status = if result.is_ok() {
                    style("OK").green().bold()
                } else {
                    style("ERROR").red().bold()
                };
                eprintln!("{label}... {status}");
            });
        }
        result.map_err(CliError::Program)?;
        written += seg.len();
    }
    pb.finish_and_clear();
    Ok(())
}

fn run_session(cli: &Cli, session: &mut Session, firmware: &FirmwareData) -> Result<()> {
    connect(cli, session)?;
    erase(cli, session, firmware)?;
    program(cli, session, firmware)?;
    run_phase(cli.quiet, "Finishing programming session", || session.stop())
        .map_err(CliError::Program)
        .context("target did not accept the end of programming")?;
    Ok(())
}

/// Run one complete firmware update.
pub(crate) fn cmd_update(cli: &Cli, config: &Config) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} {}",
            style("xcpboot").cyan().bold(),
            style(env!("CARGO_PKG_VERSION")).dim()
        );
    }

    let transport = build_transport(cli, config)?;
    let settings = loader_settings(cli, config);
    debug!("Loader settings: {settings:?}");

    let firmware = load_firmware(cli)?;

    let mut session = Session::new();
    session.init(Box::new(XcpLoader::new(transport, settings)));

    let result = run_session(cli, &mut session, &firmware);
    session.terminate();
    result?;

    if !cli.quiet {
        eprintln!("{}", style("Firmware update complete").green().bold());
    }
    Ok(())
}
