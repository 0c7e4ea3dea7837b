//! XCP flash loader.
//!
//! [`XcpLoader`] drives a bootloader through the XCP programming command
//! group on top of any [`XcpTransport`].
//!
//! ## Session Flow
//!
//! ```text
//!   start()                      clear_memory()          write_data()
//!   -------                      --------------          ------------
//!   CONNECT          (T6)        SET_MTA       (T1)      SET_MTA       (T1)
//!   GET_STATUS       (T1)        PROGRAM_CLEAR (T4)      PROGRAM       (T5)  partial chunk
//!   [GET_SEED/UNLOCK (T1)]       ... per max_erase_size  PROGRAM_MAX   (T5)  full chunks
//!   PROGRAM_START    (T3)
//!
//!   stop()
//!   ------
//!   PROGRAM len=0    (T5)  target writes the checksum
//!   PROGRAM_RESET          no response required
//! ```
//!
//! Every exchange that is answered with `ERR_CMD_BUSY` is repeated after a
//! short pause until the target accepts it or T7 elapses.

pub mod seed_key;
pub mod settings;

pub use seed_key::{ExternalKeyProgram, SeedKeyResolver};
pub use settings::XcpLoaderSettings;

use crate::error::{Error, Result};
use crate::protocol::xcp::{
    ConnectInfo, ProgramStartInfo, StatusInfo, XcpByteOrder, XcpCommand, XcpPacket, check_response,
    cmd, err, resource,
};
use crate::session::{InfoTableCheck, SessionProtocol};
use crate::transport::{Deadline, XcpTransport};
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

/// Pause between repetitions of a command the target reported busy.
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Loader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    /// Not connected yet.
    Idle,
    /// Connect handshake in progress.
    Connecting,
    /// Connected and in programming mode.
    Connected,
    /// Erase in progress.
    Erasing,
    /// Programming in progress.
    Programming,
    /// Upload in progress.
    Uploading,
    /// Programming session finished.
    Disconnected,
}

/// Parameters negotiated during `start`.
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    byte_order: XcpByteOrder,
    max_cto: u8,
    max_cto_pgm: u8,
}

/// XCP loader bound to one transport.
pub struct XcpLoader<T: XcpTransport> {
    transport: T,
    settings: XcpLoaderSettings,
    state: LoaderState,
    negotiated: Option<Negotiated>,
    rx: XcpPacket,
}

impl<T: XcpTransport> XcpLoader<T> {
    /// Create a loader; nothing is sent until [`XcpLoader::start`].
    pub fn new(transport: T, settings: XcpLoaderSettings) -> Self {
        Self {
            transport,
            settings,
            state: LoaderState::Idle,
            negotiated: None,
            rx: XcpPacket::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Settings the loader was created with.
    pub fn settings(&self) -> &XcpLoaderSettings {
        &self.settings
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Bytes carried by one PROGRAM_MAX, once connected.
    pub fn program_chunk_size(&self) -> Option<usize> {
        self.negotiated
            .map(|n| usize::from(n.max_cto_pgm).saturating_sub(1))
    }

    /// Connect to the target and enter programming mode.
    pub fn start(&mut self) -> Result<()> {
        if self.state == LoaderState::Connected {
            return Ok(());
        }
        self.state = LoaderState::Connecting;
        match self.try_start() {
            Ok(negotiated) => {
                self.negotiated = Some(negotiated);
                self.state = LoaderState::Connected;
                Ok(())
            },
            Err(e) => {
                self.transport.disconnect();
                self.negotiated = None;
                self.state = LoaderState::Idle;
                Err(e)
            },
        }
    }

    fn try_start(&mut self) -> Result<Negotiated> {
        self.transport.connect()?;

        let payload = self.exchange(
            &XcpCommand::connect(self.settings.connect_mode),
            self.settings.t6,
        )?;
        let connect = ConnectInfo::parse(&payload)?;
        debug!(
            "CONNECT: resource={:#04x} order={:?} max_cto={} max_dto={}",
            connect.resource, connect.byte_order, connect.max_cto, connect.max_dto
        );
        if !connect.has_pgm() {
            return Err(Error::Unsupported(
                "target does not offer the programming resource".into(),
            ));
        }

        let payload = self.exchange(&XcpCommand::get_status(), self.settings.t1)?;
        let status = StatusInfo::parse(&payload)?;
        if status.is_protected(resource::PGM) {
            self.unlock(connect.max_cto)?;
        }

        let payload = self.exchange(&XcpCommand::program_start(), self.settings.t3)?;
        let program = ProgramStartInfo::parse(&payload)?;
        info!(
            "Programming session started (max_cto_pgm={})",
            program.max_cto_pgm
        );

        Ok(Negotiated {
            byte_order: connect.byte_order,
            max_cto: connect.max_cto,
            max_cto_pgm: program.max_cto_pgm,
        })
    }

    /// Seed/key unlock of the PGM resource.
    fn unlock(&mut self, max_cto: u8) -> Result<()> {
        let Some(resolver) = self.settings.seed_key.clone() else {
            return Err(Error::SecurityLocked(
                "programming resource is protected and no seed/key resolver is configured".into(),
            ));
        };

        // First GET_SEED returns the total length; follow-ups fetch the rest.
        let per_packet = usize::from(max_cto).saturating_sub(2);
        let mut seed = Vec::new();
        let mut mode = 0u8;
        loop {
            let payload = self.exchange(&XcpCommand::get_seed(mode, resource::PGM), self.settings.t1)?;
            let (&remaining, bytes) = payload.split_first().ok_or_else(|| {
                Error::MalformedResponse("GET_SEED response without length".into())
            })?;
            if remaining == 0 && seed.is_empty() {
                debug!("GET_SEED reports the resource unprotected");
                return Ok(());
            }
            let take = usize::from(remaining).min(per_packet).min(bytes.len());
            if take == 0 {
                return Err(Error::MalformedResponse(
                    "GET_SEED response carries no seed bytes".into(),
                ));
            }
            seed.extend_from_slice(&bytes[..take]);
            if usize::from(remaining) <= take {
                break;
            }
            mode = 1;
        }
        trace!("seed {seed:02X?}");

        let key = resolver.compute_key(&seed)?;
        if key.is_empty() {
            return Err(Error::SecurityLocked("seed/key resolver returned no key".into()));
        }
        let key_len = u8::try_from(key.len())
            .map_err(|_| Error::SecurityLocked(format!("key of {} bytes is too long", key.len())))?;

        let mut protection = 0;
        let mut sent = 0usize;
        for part in key.chunks(per_packet.max(1)) {
            // `sent` never exceeds `key_len`, which fits in u8.
            #[allow(clippy::cast_possible_truncation)]
            let remaining = key_len - sent as u8;
            let payload = self
                .exchange(&XcpCommand::unlock(remaining, part)?, self.settings.t1)
                .map_err(|e| Error::SecurityLocked(format!("UNLOCK rejected: {e}")))?;
            protection = payload.first().copied().unwrap_or(0);
            sent += part.len();
        }
        if protection & resource::PGM != 0 {
            return Err(Error::SecurityLocked(
                "target still protects the programming resource".into(),
            ));
        }
        info!("Programming resource unlocked");
        Ok(())
    }

    /// Finalize programming, reset the target and disconnect.
    pub fn stop(&mut self) -> Result<()> {
        let result = if self.state == LoaderState::Connected {
            self.finalize()
        } else {
            Ok(())
        };
        self.transport.disconnect();
        self.negotiated = None;
        self.state = LoaderState::Disconnected;
        result
    }

    fn finalize(&mut self) -> Result<()> {
        self.state = LoaderState::Programming;
        self.exchange(&XcpCommand::program(&[])?, self.settings.t5)?;
        debug!("Programming sequence finalized");

        // The target may reset before it answers.
        let tx = XcpCommand::program_reset();
        match self.transport.send_packet(&tx, &mut self.rx, self.settings.t1) {
            Ok(()) => trace!("PROGRAM_RESET answered {:?}", self.rx),
            Err(e) => debug!("PROGRAM_RESET without response: {e}"),
        }
        Ok(())
    }

    fn negotiated(&self) -> Result<Negotiated> {
        match (self.state, self.negotiated) {
            (LoaderState::Connected, Some(n)) => Ok(n),
            _ => Err(Error::NotConnected),
        }
    }

    fn set_mta(&mut self, address: u32, order: XcpByteOrder) -> Result<()> {
        self.exchange(&XcpCommand::set_mta(address, order), self.settings.t1)?;
        Ok(())
    }

    /// Erase `len` bytes starting at `address`.
    pub fn clear_memory(&mut self, address: u32, len: u32) -> Result<()> {
        let n = self.negotiated()?;
        check_range(address, len)?;
        self.state = LoaderState::Erasing;
        let result = self.clear_ranges(address, len, n.byte_order);
        self.state = LoaderState::Connected;
        result
    }

    fn clear_ranges(&mut self, address: u32, len: u32, order: XcpByteOrder) -> Result<()> {
        let mut addr = address;
        let mut left = len;
        while left > 0 {
            let range = left.min(self.settings.max_erase_size);
            debug!("Erasing {range} bytes at {addr:#010x}");
            self.set_mta(addr, order)?;
            self.exchange(&XcpCommand::program_clear(range, order), self.settings.t4)?;
            left -= range;
            addr = addr.wrapping_add(range);
        }
        Ok(())
    }

    /// Program `data` at `address`.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_data_with_progress(address, data, &mut |_| {})
    }

    /// Program `data` at `address`, reporting the number of bytes written
    /// after each packet.
    pub fn write_data_with_progress(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let n = self.negotiated()?;
        check_range(address, data_len(data)?)?;
        self.state = LoaderState::Programming;
        let result = self.program_chunks(address, data, n, progress);
        self.state = LoaderState::Connected;
        result
    }

    fn program_chunks(
        &mut self,
        address: u32,
        data: &[u8],
        n: Negotiated,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let chunk = usize::from(n.max_cto_pgm) - 1;
        debug!(
            "Programming {} bytes at {address:#010x} in chunks of {chunk}",
            data.len()
        );
        self.set_mta(address, n.byte_order)?;

        let (head, full) = data.split_at(data.len() % chunk);
        if !head.is_empty() {
            self.exchange(&XcpCommand::program(head)?, self.settings.t5)?;
            progress(head.len());
        }
        let mut written = head.len();
        for part in full.chunks(chunk) {
            self.exchange(&XcpCommand::program_max(part)?, self.settings.t5)?;
            written += part.len();
            progress(written);
        }
        Ok(())
    }

    /// Read `len` bytes starting at `address`.
    pub fn read_data(&mut self, address: u32, len: u32) -> Result<Vec<u8>> {
        let n = self.negotiated()?;
        check_range(address, len)?;
        self.state = LoaderState::Uploading;
        let result = self.upload(address, len, n);
        self.state = LoaderState::Connected;
        result
    }

    fn upload(&mut self, address: u32, len: u32, n: Negotiated) -> Result<Vec<u8>> {
        let total = len as usize;
        let per_packet = usize::from(n.max_cto) - 1;
        self.set_mta(address, n.byte_order)?;

        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            let count = per_packet.min(total - data.len());
            // count <= max_cto - 1 <= 254
            #[allow(clippy::cast_possible_truncation)]
            let payload = self.exchange(&XcpCommand::upload(count as u8), self.settings.t1)?;
            if payload.len() < count {
                return Err(Error::MalformedResponse(format!(
                    "UPLOAD returned {} of {count} bytes",
                    payload.len()
                )));
            }
            data.extend_from_slice(&payload[..count]);
        }
        Ok(data)
    }

    /// Compare `expected` with the info table stored at `address`.
    pub fn check_info_table(&mut self, address: u32, expected: &[u8]) -> Result<InfoTableCheck> {
        let n = self.negotiated()?;
        check_range(address, data_len(expected)?)?;
        self.set_mta(address, n.byte_order)?;

        // USER_CMD, sub-command and count precede the data.
        let per_packet = usize::from(n.max_cto).saturating_sub(3).max(1);
        let mut result = InfoTableCheck::Match;
        for part in expected.chunks(per_packet) {
            let payload = match self.exchange(&XcpCommand::check_info_table(part)?, self.settings.t1) {
                Ok(payload) => payload,
                Err(Error::Protocol { code, .. })
                    if code == err::CMD_UNKNOWN || code == err::SUBCMD_UNKNOWN =>
                {
                    debug!("Target has no info table check");
                    return Ok(InfoTableCheck::Unsupported);
                },
                Err(e) => return Err(e),
            };
            if payload.first().copied().unwrap_or(0) != 0 {
                result = InfoTableCheck::Mismatch;
            }
        }
        Ok(result)
    }

    /// One request/response exchange; returns the payload of the positive
    /// response. Busy answers are retried until T7 elapses.
    fn exchange(&mut self, tx: &XcpPacket, timeout: Duration) -> Result<Vec<u8>> {
        let command = tx.pid().unwrap_or(0);
        let mut busy_deadline: Option<Deadline> = None;
        loop {
            trace!("tx {tx:?}");
            self.transport.send_packet(tx, &mut self.rx, timeout)?;
            trace!("rx {:?}", self.rx);
            match check_response(command, &self.rx) {
                Ok(payload) => return Ok(payload.to_vec()),
                Err(Error::Protocol { code, .. }) if code == err::CMD_BUSY => {
                    let deadline =
                        *busy_deadline.get_or_insert_with(|| Deadline::after(self.settings.t7));
                    if deadline.expired() {
                        return Err(Error::Timeout(format!(
                            "target busy for more than {:?} on command {command:#04x}",
                            self.settings.t7
                        )));
                    }
                    if crate::is_interrupted_requested() {
                        return Err(Error::Interrupted);
                    }
                    warn!("Target busy, repeating command {command:#04x}");
                    thread::sleep(BUSY_POLL_INTERVAL);
                },
                Err(e) => return Err(e),
            }
        }
    }
}

fn data_len(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len())
        .map_err(|_| Error::InvalidArgument(format!("{} bytes exceed the address space", data.len())))
}

fn check_range(address: u32, len: u32) -> Result<()> {
    if len == 0 {
        return Err(Error::InvalidArgument("zero length range".into()));
    }
    if u64::from(address) + u64::from(len) > 1 << 32 {
        return Err(Error::InvalidArgument(format!(
            "range {address:#010x} + {len} exceeds the address space"
        )));
    }
    Ok(())
}

impl<T: XcpTransport> SessionProtocol for XcpLoader<T> {
    fn start(&mut self) -> Result<()> {
        XcpLoader::start(self)
    }

    fn stop(&mut self) -> Result<()> {
        XcpLoader::stop(self)
    }

    fn clear_memory(&mut self, address: u32, len: u32) -> Result<()> {
        XcpLoader::clear_memory(self, address, len)
    }

    fn write_data(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        self.write_data_with_progress(address, data, progress)
    }

    fn read_data(&mut self, address: u32, len: u32) -> Result<Vec<u8>> {
        XcpLoader::read_data(self, address, len)
    }

    fn check_info_table(&mut self, address: u32, expected: &[u8]) -> Result<InfoTableCheck> {
        XcpLoader::check_info_table(self, address, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal bootloader: Intel byte order, max_cto 8, PGM available.
    fn target(req: &[u8]) -> Option<Vec<u8>> {
        match req[0] {
            cmd::CONNECT => Some(vec![0xFF, resource::PGM, 0x00, 8, 8, 0, 1, 1]),
            cmd::GET_STATUS => Some(vec![0xFF, 0x00, 0x00, 0, 0, 0]),
            cmd::PROGRAM_START => Some(vec![0xFF, 0x00, 0x00, 8, 0, 0, 0]),
            cmd::UPLOAD => {
                let mut rsp = vec![0xFF];
                rsp.extend((0..req[1]).map(|i| 0xA0 + i));
                Some(rsp)
            },
            _ => Some(vec![0xFF]),
        }
    }

    fn connected(
        transport: MockTransport,
        settings: XcpLoaderSettings,
    ) -> XcpLoader<MockTransport> {
        let mut loader = XcpLoader::new(transport, settings);
        loader.start().unwrap();
        loader
    }

    #[test]
    fn test_start_negotiates_chunk_size() {
        let loader = connected(MockTransport::new(target), XcpLoaderSettings::default());
        assert_eq!(loader.state(), LoaderState::Connected);
        assert_eq!(loader.program_chunk_size(), Some(7));
    }

    #[test]
    fn test_write_splits_partial_head() {
        let transport = MockTransport::new(target);
        let log = transport.log();
        let mut loader = connected(transport, XcpLoaderSettings::default());

        let data: Vec<u8> = (0..17).collect();
        loader.write_data(0x1000, &data).unwrap();

        let sent = log.sent();
        let program: Vec<_> = sent.iter().filter(|p| p[0] == cmd::PROGRAM).collect();
        let program_max: Vec<_> = sent.iter().filter(|p| p[0] == cmd::PROGRAM_MAX).collect();
        assert_eq!(program.len(), 1);
        assert_eq!(program[0].as_slice(), &[cmd::PROGRAM, 3, 0, 1, 2]);
        assert_eq!(program_max.len(), 2);
        assert_eq!(&program_max[1][1..], &data[10..]);
    }

    #[test]
    fn test_clear_memory_respects_max_erase_size() {
        let transport = MockTransport::new(target);
        let log = transport.log();
        let settings = XcpLoaderSettings::default().with_max_erase_size(0x800);
        let mut loader = connected(transport, settings);

        loader.clear_memory(0x0800_0000, 0x1100).unwrap();
        assert_eq!(log.count(cmd::PROGRAM_CLEAR), 3);
        let last_mta = log
            .sent()
            .into_iter()
            .rev()
            .find(|p| p[0] == cmd::SET_MTA)
            .unwrap();
        assert_eq!(&last_mta[4..8], &0x0800_1000u32.to_le_bytes());
    }

    #[test]
    fn test_read_data_in_upload_chunks() {
        let transport = MockTransport::new(target);
        let log = transport.log();
        let mut loader = connected(transport, XcpLoaderSettings::default());

        let data = loader.read_data(0x2000, 10).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[..3], &[0xA0, 0xA1, 0xA2]);
        assert_eq!(log.count(cmd::UPLOAD), 2);
    }

    #[test]
    fn test_busy_is_polled() {
        let busy = Arc::new(AtomicUsize::new(2));
        let remaining = Arc::clone(&busy);
        let transport = MockTransport::new(move |req| {
            if req[0] == cmd::PROGRAM_CLEAR && remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                return Some(vec![0xFE, err::CMD_BUSY]);
            }
            target(req)
        });
        let log = transport.log();
        let mut loader = connected(transport, XcpLoaderSettings::default());

        loader.clear_memory(0x0800_0000, 0x400).unwrap();
        assert_eq!(log.count(cmd::PROGRAM_CLEAR), 3);
        assert_eq!(busy.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_busy_gives_up_after_t7() {
        let transport = MockTransport::new(|req| {
            if req[0] == cmd::PROGRAM_CLEAR {
                return Some(vec![0xFE, err::CMD_BUSY]);
            }
            target(req)
        });
        let settings = XcpLoaderSettings {
            t7: Duration::from_millis(40),
            ..Default::default()
        };
        let mut loader = connected(transport, settings);
        let result = loader.clear_memory(0x0800_0000, 0x400);
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(loader.state(), LoaderState::Connected);
    }

    #[test]
    fn test_protected_target_without_resolver() {
        let transport = MockTransport::new(|req| match req[0] {
            cmd::GET_STATUS => Some(vec![0xFF, 0x00, resource::PGM, 0, 0, 0]),
            _ => target(req),
        });
        let log = transport.log();
        let mut loader = XcpLoader::new(transport, XcpLoaderSettings::default());
        assert!(matches!(loader.start(), Err(Error::SecurityLocked(_))));
        assert_eq!(loader.state(), LoaderState::Idle);
        assert_eq!(log.count(cmd::PROGRAM_START), 0);
        assert_eq!(log.disconnects(), 1);
    }

    #[test]
    fn test_empty_key_is_rejected_before_unlock() {
        let transport = MockTransport::new(|req| match req[0] {
            cmd::GET_STATUS => Some(vec![0xFF, 0x00, resource::PGM, 0, 0, 0]),
            cmd::GET_SEED => Some(vec![0xFF, 2, 0x12, 0x34]),
            _ => target(req),
        });
        let log = transport.log();
        let resolver = |_seed: &[u8]| -> Result<Vec<u8>> { Ok(Vec::new()) };
        let settings = XcpLoaderSettings::default().with_seed_key(Arc::new(resolver));
        let mut loader = XcpLoader::new(transport, settings);

        assert!(matches!(loader.start(), Err(Error::SecurityLocked(_))));
        assert_eq!(log.count(cmd::GET_SEED), 1);
        assert_eq!(log.count(cmd::UNLOCK), 0);
        assert_eq!(log.count(cmd::PROGRAM_START), 0);
    }

    #[test]
    fn test_stop_finalizes_then_resets() {
        let transport = MockTransport::new(|req| match req[0] {
            cmd::PROGRAM_RESET => None,
            _ => target(req),
        });
        let log = transport.log();
        let settings = XcpLoaderSettings {
            t1: Duration::from_millis(5),
            ..Default::default()
        };
        let mut loader = connected(transport, settings);
        loader.stop().unwrap();

        let sent = log.sent();
        let n = sent.len();
        assert_eq!(sent[n - 2], vec![cmd::PROGRAM, 0]);
        assert_eq!(sent[n - 1], vec![cmd::PROGRAM_RESET]);
        assert_eq!(loader.state(), LoaderState::Disconnected);
        assert_eq!(log.disconnects(), 1);
    }

    #[test]
    fn test_info_table_unsupported() {
        let transport = MockTransport::new(|req| match req[0] {
            cmd::USER_CMD => Some(vec![0xFE, err::CMD_UNKNOWN]),
            _ => target(req),
        });
        let mut loader = connected(transport, XcpLoaderSettings::default());
        assert_eq!(
            loader.check_info_table(0x0800_0200, &[1, 2, 3]).unwrap(),
            InfoTableCheck::Unsupported
        );
    }

    #[test]
    fn test_info_table_mismatch() {
        let transport = MockTransport::new(|req| match req[0] {
            cmd::USER_CMD => Some(vec![0xFF, u8::from(req[3] != 0x11)]),
            _ => target(req),
        });
        let mut loader = connected(transport, XcpLoaderSettings::default());
        assert_eq!(
            loader.check_info_table(0x0800_0200, &[0x11; 5]).unwrap(),
            InfoTableCheck::Match
        );
        assert_eq!(
            loader
                .check_info_table(0x0800_0200, &[0x11, 0x11, 0x11, 0x11, 0x11, 0x22])
                .unwrap(),
            InfoTableCheck::Mismatch
        );
    }

    #[test]
    fn test_operations_require_start() {
        let mut loader = XcpLoader::new(MockTransport::new(target), XcpLoaderSettings::default());
        assert!(matches!(
            loader.write_data(0, &[1]),
            Err(Error::NotConnected)
        ));
    }
}
