//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{
        fs,
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        path::{Path, PathBuf},
        thread,
    },
    tempfile::{TempDir, tempdir},
    xcpboot::{
        FirmwareData,
        protocol::xcp::{cmd, err, resource},
    },
};

fn cli_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("xcpboot");
    cmd.current_dir(dir)
        .env_remove("XCPBOOT_DEVICE")
        .env_remove("XCPBOOT_BAUD")
        .env_remove("RUST_LOG");
    cmd
}

/// Write an S-record firmware file with two segments.
fn write_firmware(dir: &TempDir) -> PathBuf {
    let mut firmware = FirmwareData::new();
    firmware
        .add_data(0x0800_0000, &(0..=255).collect::<Vec<u8>>())
        .unwrap();
    firmware.add_data(0x0800_4000, &[0xA5; 100]).unwrap();
    let path = dir.path().join("firmware.srec");
    firmware.save_to_file(&path).unwrap();
    path
}

/// XCP on TCP bootloader serving one connection; optionally rejects one command.
fn spawn_target(reject: Option<u8>) -> (u16, thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut commands = Vec::new();
        while let Some(request) = read_frame(&mut sock) {
            commands.push(request[0]);
            let response = if Some(request[0]) == reject {
                vec![0xFE, err::OUT_OF_RANGE]
            } else {
                respond(&request)
            };
            let mut frame = u16::try_from(response.len()).unwrap().to_le_bytes().to_vec();
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&response);
            if sock.write_all(&frame).is_err() {
                break;
            }
        }
        commands
    });
    (port, handle)
}

fn read_frame(sock: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 4];
    sock.read_exact(&mut header).ok()?;
    let len = usize::from(u16::from_le_bytes([header[0], header[1]]));
    let mut request = vec![0u8; len];
    sock.read_exact(&mut request).ok()?;
    Some(request)
}

fn respond(request: &[u8]) -> Vec<u8> {
    match request[0] {
        cmd::CONNECT => vec![0xFF, resource::PGM, 0x00, 8, 8, 0, 1, 1],
        cmd::GET_STATUS => vec![0xFF, 0x00, 0x00, 0, 0, 0],
        cmd::PROGRAM_START => vec![0xFF, 0x00, 0x00, 8, 0, 0, 0],
        cmd::SET_MTA | cmd::PROGRAM_CLEAR | cmd::PROGRAM | cmd::PROGRAM_MAX
        | cmd::PROGRAM_RESET => vec![0xFF],
        _ => vec![0xFE, err::CMD_UNKNOWN],
    }
}

fn net_args(port: u16, firmware: &Path) -> Vec<String> {
    vec![
        "-s=xcp".to_string(),
        "-t=xcp_net".to_string(),
        "-a=127.0.0.1".to_string(),
        format!("-p={port}"),
        firmware.display().to_string(),
    ]
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("xcpboot"))
        .stdout(predicate::str::contains("--transport"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("xcpboot"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn exit_code_one_for_missing_firmware_argument() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .arg("-t=xcp_rs232")
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_one_for_unknown_flag_or_value() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["--invalid-flag-xyz", "fw.srec"])
        .assert()
        .code(1);
    cli_cmd(dir.path())
        .args(["-t=xcp_ftp", "fw.srec"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("xcp_ftp"));
    cli_cmd(dir.path())
        .args(["-xid=7", "fw.srec"])
        .assert()
        .code(1);
}

#[test]
fn exit_code_one_for_missing_device() {
    let dir = tempdir().unwrap();
    let firmware = write_firmware(&dir);
    cli_cmd(dir.path())
        .arg("-t=xcp_rs232")
        .arg(&firmware)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("-d="));
}

#[test]
fn exit_code_one_for_incomplete_can_settings() {
    let dir = tempdir().unwrap();
    let firmware = write_firmware(&dir);
    cli_cmd(dir.path())
        .args(["-t=xcp_can", "-tid=667", "-rid=7E1"])
        .arg(&firmware)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("CAN interface"));
    cli_cmd(dir.path())
        .args(["-t=xcp_can", "-d=can0", "-tid=800"])
        .arg(&firmware)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("0x800"));
}

#[test]
fn usb_transport_is_accepted() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["-t=xcp_usb", "does_not_exist.srec"])
        .assert()
        .code(2);
}

#[cfg(target_os = "linux")]
#[test]
fn can_transport_is_accepted() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["-t=xcp_can", "-d=vcan0", "-tid=667", "-rid=7E1", "does_not_exist.srec"])
        .assert()
        .code(2);
}

#[test]
fn exit_code_one_for_bad_decryption_key() {
    let dir = tempdir().unwrap();
    let firmware = write_firmware(&dir);
    cli_cmd(dir.path())
        .args(["-t=xcp_net", "-a=127.0.0.1", "-ky=00112233"])
        .arg(&firmware)
        .assert()
        .code(1);
}

#[test]
fn exit_code_two_for_missing_firmware_file() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["-t=xcp_rs232", "-d=/dev/ttyUSB0", "does_not_exist.srec"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("ERROR"));
}

#[test]
fn exit_code_two_for_corrupt_firmware_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.srec");
    fs::write(&path, "S1130000FFFF\n").unwrap();
    cli_cmd(dir.path())
        .args(["-t=xcp_net", "-a=127.0.0.1"])
        .arg(&path)
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_empty_firmware_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.srec");
    fs::write(&path, "S00F000068656C6C6F202020202000003C\nS9030000FC\n").unwrap();
    cli_cmd(dir.path())
        .args(["-t=xcp_net", "-a=127.0.0.1"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no program data"));
}

#[test]
fn local_config_file_provides_transport() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("xcpboot.toml"),
        "[connection]\ntransport = \"xcp_net\"\n",
    )
    .unwrap();
    cli_cmd(dir.path())
        .arg("fw.srec")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("-a="));
}

#[test]
fn update_over_tcp_succeeds() {
    let dir = tempdir().unwrap();
    let firmware = write_firmware(&dir);
    let (port, target) = spawn_target(None);

    cli_cmd(dir.path())
        .args(net_args(port, &firmware))
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Firmware update complete"));

    let commands = target.join().unwrap();
    assert_eq!(
        commands.iter().filter(|&&c| c == cmd::PROGRAM_CLEAR).count(),
        2
    );
    // 256 and 100 bytes in chunks of 7, plus the final zero length PROGRAM.
    let programs = commands
        .iter()
        .filter(|&&c| c == cmd::PROGRAM || c == cmd::PROGRAM_MAX)
        .count();
    assert_eq!(programs, 256usize.div_ceil(7) + 100usize.div_ceil(7) + 1);
    assert_eq!(commands.last(), Some(&cmd::PROGRAM_RESET));
}

#[test]
fn exit_code_three_for_erase_failure() {
    let dir = tempdir().unwrap();
    let firmware = write_firmware(&dir);
    let (port, target) = spawn_target(Some(cmd::PROGRAM_CLEAR));

    cli_cmd(dir.path())
        .args(net_args(port, &firmware))
        .assert()
        .code(3)
        .stderr(predicate::str::contains("erase"))
        .stderr(predicate::function(|out: &str| {
            out.matches("ERR_OUT_OF_RANGE").count() == 1
        }));

    let commands = target.join().unwrap();
    assert!(!commands.contains(&cmd::PROGRAM));
}

#[test]
fn exit_code_four_for_program_failure() {
    let dir = tempdir().unwrap();
    let firmware = write_firmware(&dir);
    let (port, target) = spawn_target(Some(cmd::PROGRAM_MAX));

    cli_cmd(dir.path())
        .args(net_args(port, &firmware))
        .assert()
        .code(4)
        .stderr(predicate::str::contains("program"));

    let commands = target.join().unwrap();
    assert!(!commands.contains(&cmd::PROGRAM_RESET));
}
