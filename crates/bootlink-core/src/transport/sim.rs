//! In-memory device speaking the wire protocol.
//!
//! The simulator plays boot ROM, first-stage loader and agent in turn.
//! Every host write is treated as exactly one frame; writes that do not
//! decode in the device's current variant are dropped unanswered, which is
//! what a real boot ROM does with a protocol it does not speak.
//!
//! Clones share state, so a test keeps one handle for inspection while the
//! session owns another.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

use super::traits::{Transport, TransportError};
use crate::chip::ExecutionStage;
use crate::codec::{FrameCodec, ProtocolVariant};
use crate::partition::{GptEntry, build_gpt};
use crate::protocol::constants::*;
use crate::protocol::{
    AckCode, IdentityHeader, PatchRequest, SectorRequest, StorageInfo, UploadHeader, with_status,
};

/// Signature the simulator accepts for `blob` under `key`.
pub fn sign(blob: &[u8], key: &[u8]) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(blob);
    hasher.update(key);
    hasher.finalize().to_le_bytes().to_vec()
}

/// One partition laid out on a simulated LUN.
#[derive(Debug, Clone)]
pub struct SimPartition {
    pub lun: u32,
    pub name: String,
    pub first_lba: u64,
    pub sectors: u64,
}

impl SimPartition {
    pub fn new(lun: u32, name: impl Into<String>, first_lba: u64, sectors: u64) -> Self {
        Self {
            lun,
            name: name.into(),
            first_lba,
            sectors,
        }
    }

    fn contains(&self, lun: u32, sector: u64, count: u64) -> bool {
        self.lun == lun && sector < self.first_lba + self.sectors && sector + count > self.first_lba
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Variant spoken by the boot ROM and first stage.
    pub variant: ProtocolVariant,
    /// Variant spoken once the agent runs.
    pub agent_variant: ProtocolVariant,
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub serial: [u8; 16],
    pub stage: ExecutionStage,
    /// Identity flags reported before the agent runs.
    pub boot_flags: u32,
    /// Identity flags reported by the agent.
    pub agent_flags: u32,
    pub anti_rollback: u32,
    pub sector_size: u32,
    /// Total sectors per LUN; the vector length is the LUN count.
    pub lun_sectors: Vec<u64>,
    pub partitions: Vec<SimPartition>,
    pub boot_lun: u32,
    /// Answer to CMD_EXPLOIT; `None` rejects the payload.
    pub exploit_ack: Option<u32>,
    /// Key used to verify signatures and tokens (see [`sign`]).
    pub auth_key: Vec<u8>,
    /// Partitions the agent refuses to touch without vendor auth.
    pub device_protected: Vec<String>,
    /// A first-stage jump lands in `FirstStage` and needs a second image.
    pub requires_second_stage: bool,
    /// Stop answering after JUMP.
    pub hang_after_jump: bool,
    /// Number of checksummed responses to corrupt.
    pub corrupt_responses: u32,
    /// Number of responses to drop after executing the command.
    pub drop_responses: u32,
    pub usb_ids: Option<(u16, u16)>,
    /// Whether the device UART actually follows a BAUD_SWITCH.
    pub follows_baud: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::BinaryFramed,
            agent_variant: ProtocolVariant::BinaryFramed,
            hw_code: 0x0766,
            hw_sub_code: 0x8A00,
            serial: *b"SIM-0123456789AB",
            stage: ExecutionStage::BootRom,
            boot_flags: 0,
            agent_flags: FLAG_CHECKSUM_SUPPORTED,
            anti_rollback: 0,
            sector_size: 4096,
            lun_sectors: vec![4096],
            partitions: vec![
                SimPartition::new(0, "boot", 256, 256),
                SimPartition::new(0, "system", 512, 2048),
                SimPartition::new(0, "nvram", 2560, 64),
                SimPartition::new(0, "userdata", 2624, 1024),
            ],
            boot_lun: 0,
            exploit_ack: None,
            auth_key: b"sim-key".to_vec(),
            device_protected: Vec::new(),
            requires_second_stage: false,
            hang_after_jump: false,
            corrupt_responses: 0,
            drop_responses: 0,
            usb_ids: None,
            follows_baud: true,
        }
    }
}

/// Image received through UPLOAD_BEGIN..UPLOAD_END.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub address: u64,
    pub stage: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorWrite {
    pub lun: u32,
    pub start_sector: u64,
    pub sector_count: u32,
}

#[derive(Debug)]
struct PendingUpload {
    header: UploadHeader,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    stage: ExecutionStage,
    codec: FrameCodec,
    connected: bool,
    hung: bool,
    outbox: VecDeque<u8>,
    host_baud: Option<u32>,
    device_baud: Option<u32>,
    luns: Vec<BTreeMap<u64, Vec<u8>>>,
    bypassed: bool,
    boot_authorized: bool,
    vendor_authorized: bool,
    digest: Option<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    nonce_counter: u64,
    upload: Option<PendingUpload>,
    /// A first-stage image runs and may still chain-load a second one.
    chain_loadable: bool,
    uploaded: Vec<UploadedImage>,
    commands: Vec<u32>,
    sector_writes: Vec<SectorWrite>,
    boot_lun_set: Option<u32>,
    bytes_written: u64,
    max_frame: usize,
}

/// Simulated device implementing [`Transport`].
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    usb_ids: Option<(u16, u16)>,
}

impl SimulatedDevice {
    pub fn new(config: SimConfig) -> Self {
        let codec = FrameCodec::for_variant(match config.stage {
            ExecutionStage::Agent => config.agent_variant,
            _ => config.variant,
        });
        let luns = vec![BTreeMap::new(); config.lun_sectors.len()];
        let usb_ids = config.usb_ids;
        Self {
            state: Arc::new(Mutex::new(SimState {
                stage: config.stage,
                codec,
                connected: true,
                hung: false,
                outbox: VecDeque::new(),
                host_baud: None,
                device_baud: None,
                luns,
                bypassed: false,
                boot_authorized: false,
                vendor_authorized: false,
                digest: None,
                nonce: None,
                nonce_counter: 0,
                upload: None,
                chain_loadable: false,
                uploaded: Vec::new(),
                commands: Vec::new(),
                sector_writes: Vec::new(),
                boot_lun_set: None,
                bytes_written: 0,
                max_frame: 0,
                config,
            })),
            usb_ids,
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stage(&self) -> ExecutionStage {
        self.state().stage
    }

    /// Command ids received, in order.
    pub fn commands(&self) -> Vec<u32> {
        self.state().commands.clone()
    }

    pub fn count(&self, command: u32) -> usize {
        self.state().commands.iter().filter(|&&c| c == command).count()
    }

    pub fn sector_writes(&self) -> Vec<SectorWrite> {
        self.state().sector_writes.clone()
    }

    pub fn uploaded(&self) -> Vec<UploadedImage> {
        self.state().uploaded.clone()
    }

    pub fn boot_lun_set(&self) -> Option<u32> {
        self.state().boot_lun_set
    }

    /// Sector payload bytes received through WRITE.
    pub fn bytes_written(&self) -> u64 {
        self.state().bytes_written
    }

    /// Largest single host write seen.
    pub fn max_frame(&self) -> usize {
        self.state().max_frame
    }

    pub fn is_bypassed(&self) -> bool {
        self.state().bypassed
    }

    /// Raw storage contents.
    pub fn read_bytes(&self, lun: u32, sector: u64, len: usize) -> Vec<u8> {
        let state = self.state();
        let mut out = Vec::with_capacity(len);
        let mut s = sector;
        while out.len() < len {
            out.extend_from_slice(&state.sector(lun, s));
            s += 1;
        }
        out.truncate(len);
        out
    }

    /// Preload storage contents.
    pub fn fill(&self, lun: u32, sector: u64, data: &[u8]) {
        let mut state = self.state();
        let ss = state.config.sector_size as usize;
        for (i, chunk) in data.chunks(ss).enumerate() {
            let mut buf = chunk.to_vec();
            buf.resize(ss, 0);
            state.store_sector(lun, sector + i as u64, buf);
        }
    }

    /// Number of non-zero sectors stored on a LUN.
    pub fn stored_sectors(&self, lun: u32) -> usize {
        self.state()
            .luns
            .get(lun as usize)
            .map_or(0, BTreeMap::len)
    }

    /// Swallow the responses to the next `count` commands.
    pub fn drop_next_responses(&self, count: u32) {
        self.state().config.drop_responses = count;
    }

    /// Simulate a cable pull.
    pub fn unplug(&self) {
        self.state().connected = false;
    }
}

impl SimState {
    fn sector(&self, lun: u32, sector: u64) -> Vec<u8> {
        self.luns
            .get(lun as usize)
            .and_then(|l| l.get(&sector).cloned())
            .unwrap_or_else(|| vec![0u8; self.config.sector_size as usize])
    }

    fn store_sector(&mut self, lun: u32, sector: u64, data: Vec<u8>) {
        if let Some(l) = self.luns.get_mut(lun as usize) {
            if data.iter().all(|&b| b == 0) {
                l.remove(&sector);
            } else {
                l.insert(sector, data);
            }
        }
    }

    fn range_ok(&self, lun: u32, sector: u64, count: u64) -> bool {
        self.config
            .lun_sectors
            .get(lun as usize)
            .is_some_and(|&total| sector.checked_add(count).is_some_and(|end| end <= total))
    }

    fn protected_hit(&self, lun: u32, sector: u64, count: u64) -> bool {
        !self.vendor_authorized
            && self.config.partitions.iter().any(|p| {
                self.config.device_protected.contains(&p.name) && p.contains(lun, sector, count)
            })
    }

    fn identity(&self) -> IdentityHeader {
        let flags = match self.stage {
            ExecutionStage::Agent => self.config.agent_flags,
            _ => self.config.boot_flags,
        };
        IdentityHeader {
            hw_code: self.config.hw_code,
            hw_sub_code: self.config.hw_sub_code,
            hw_version: 0xCA00,
            sw_version: 0x0001,
            flags,
            anti_rollback: self.config.anti_rollback,
            stage: self.stage.as_u8(),
            serial: self.config.serial,
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> Option<crate::codec::Frame> {
        if let Ok(frame) = self.codec.decode(bytes) {
            return Some(frame);
        }
        // A host starting over sends IDENTIFY without the checksum trailer.
        let plain = FrameCodec::for_variant(self.codec.variant());
        match plain.decode(bytes) {
            Ok(frame) if frame.command == CMD_IDENTIFY => {
                self.codec.set_checksum(false);
                Some(frame)
            }
            _ => None,
        }
    }

    fn respond(&mut self, command: u32, status: u32, data: &[u8]) {
        let mut frame = match self
            .codec
            .encode(command | RESPONSE_FLAG, &with_status(status, data))
        {
            Ok(frame) => frame,
            Err(_) => match self.codec.encode(
                command | RESPONSE_FLAG,
                &with_status(STATUS_OUT_OF_RANGE, &[]),
            ) {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };
        if self.config.drop_responses > 0 {
            self.config.drop_responses -= 1;
            trace!(command, "Simulator dropping response");
            return;
        }
        let checksummed = matches!(&self.codec, FrameCodec::Binary(c) if c.checksum);
        if checksummed && self.config.corrupt_responses > 0 && frame.len() > BINARY_HEADER_SIZE {
            self.config.corrupt_responses -= 1;
            frame[BINARY_HEADER_SIZE] ^= 0x55;
        }
        self.outbox.extend(frame);
    }

    fn handle(&mut self, bytes: &[u8]) {
        self.max_frame = self.max_frame.max(bytes.len());
        if self.hung || self.host_baud != self.device_baud {
            return;
        }
        let Some(frame) = self.decode(bytes) else {
            trace!(len = bytes.len(), "Simulator ignoring undecodable write");
            return;
        };
        let command = frame.command;
        let payload = frame.payload;
        self.commands.push(command);

        let boot_side = self.stage != ExecutionStage::Agent;
        let loader_side = boot_side || self.chain_loadable;
        match command {
            CMD_IDENTIFY => {
                let header = self.identity();
                self.respond(command, STATUS_OK, &header.to_bytes());
                if header.flags & FLAG_CHECKSUM_SUPPORTED != 0 {
                    self.codec.set_checksum(true);
                }
            }
            CMD_PING => self.respond(command, STATUS_OK, &[]),
            CMD_AUTH_CHALLENGE => {
                self.nonce_counter += 1;
                let counter = self.nonce_counter.to_le_bytes();
                let nonce = [sign(&counter, &self.config.serial), sign(&counter, b"nonce")].concat();
                self.nonce = Some(nonce.clone());
                self.respond(command, STATUS_OK, &nonce);
            }
            CMD_SEND_AUTH => {
                let status = self.handle_auth(&payload);
                self.respond(command, status, &[]);
            }
            CMD_EXPLOIT if boot_side => match self.config.exploit_ack {
                Some(ack) => {
                    if ack == ACK_BYPASSED {
                        self.bypassed = true;
                    }
                    self.respond(command, STATUS_OK, &AckCode::from_u32(ack).to_bytes());
                }
                None => self.respond(command, STATUS_REJECTED, &[]),
            },
            CMD_UPLOAD_BEGIN if loader_side => {
                let status = match UploadHeader::from_bytes(&payload) {
                    Err(_) => STATUS_INVALID_ARGUMENT,
                    Ok(_)
                        if self.stage == ExecutionStage::BootRom
                            && self.config.boot_flags & FLAG_REJECTS_UNSIGNED_AGENT != 0
                            && !self.bypassed
                            && !self.boot_authorized =>
                    {
                        STATUS_NOT_AUTHORIZED
                    }
                    Ok(header) => {
                        self.upload = Some(PendingUpload {
                            header,
                            data: Vec::with_capacity(header.length as usize),
                        });
                        STATUS_OK
                    }
                };
                self.respond(command, status, &[]);
            }
            CMD_UPLOAD_DATA if loader_side => {
                let status = match (self.upload.as_mut(), payload.get(..4)) {
                    (Some(up), Some(b)) => {
                        let offset = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
                        let chunk = &payload[4..];
                        let end = offset + chunk.len();
                        if end > up.header.length as usize || offset > up.data.len() {
                            STATUS_OUT_OF_RANGE
                        } else if end <= up.data.len() {
                            // Resent chunk whose response was lost.
                            if up.data[offset..end] == *chunk {
                                STATUS_OK
                            } else {
                                STATUS_INVALID_ARGUMENT
                            }
                        } else {
                            up.data.truncate(offset);
                            up.data.extend_from_slice(chunk);
                            STATUS_OK
                        }
                    }
                    _ => STATUS_INVALID_ARGUMENT,
                };
                self.respond(command, status, &[]);
            }
            CMD_UPLOAD_END if loader_side => {
                let expected = payload
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                match self.upload.take() {
                    Some(up)
                        if up.data.len() == up.header.length as usize
                            && expected == Some(crc32fast::hash(&up.data)) =>
                    {
                        let ack = if up.header.stage >= 2 {
                            ACK_READY_SECOND
                        } else {
                            ACK_READY_FIRST
                        };
                        self.uploaded.push(UploadedImage {
                            address: up.header.address,
                            stage: up.header.stage,
                            data: up.data,
                        });
                        self.respond(command, STATUS_OK, &AckCode::from_u32(ack).to_bytes());
                    }
                    _ => self.respond(command, STATUS_REJECTED, &AckCode::from_u32(ACK_ERROR_01).to_bytes()),
                }
            }
            CMD_JUMP if loader_side => {
                let address = payload
                    .get(..8)
                    .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]));
                let target = self
                    .uploaded
                    .iter()
                    .rev()
                    .find(|img| Some(img.address) == address)
                    .map(|img| img.stage);
                let Some(target_stage) = target else {
                    self.respond(command, STATUS_INVALID_ARGUMENT, &[]);
                    return;
                };
                self.respond(command, STATUS_OK, &[]);
                if self.config.hang_after_jump {
                    self.hung = true;
                    return;
                }
                self.chain_loadable = target_stage <= 1;
                self.stage = if target_stage <= 1 && self.config.requires_second_stage {
                    ExecutionStage::FirstStage
                } else {
                    ExecutionStage::Agent
                };
                let variant = match self.stage {
                    ExecutionStage::Agent => self.config.agent_variant,
                    _ => self.config.variant,
                };
                self.codec = FrameCodec::for_variant(variant);
            }
            CMD_BAUD_SWITCH => {
                let rate = payload
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                match rate {
                    Some(rate) => {
                        self.respond(command, STATUS_OK, &[]);
                        if self.config.follows_baud {
                            self.device_baud = Some(rate);
                        }
                    }
                    None => self.respond(command, STATUS_INVALID_ARGUMENT, &[]),
                }
            }
            CMD_RESET => {
                self.respond(command, STATUS_OK, &[]);
                self.hung = true;
            }
            CMD_STORAGE_INFO
            | CMD_GET_TABLE
            | CMD_READ
            | CMD_WRITE
            | CMD_ERASE
            | CMD_PATCH
            | CMD_SET_BOOT_LUN
                if !boot_side =>
            {
                let (status, data) = self.handle_storage(command, &payload);
                self.respond(command, status, &data);
            }
            _ => self.respond(command, STATUS_UNSUPPORTED, &[]),
        }
    }

    fn handle_auth(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 5 {
            return STATUS_INVALID_ARGUMENT;
        }
        let kind = payload[0];
        let len = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]) as usize;
        let Some(blob) = payload.get(5..5 + len) else {
            return STATUS_INVALID_ARGUMENT;
        };
        let accepted = match kind {
            AUTH_KIND_DIGEST => {
                self.digest = Some(blob.to_vec());
                return STATUS_OK;
            }
            AUTH_KIND_SIGNATURE => self
                .digest
                .as_ref()
                .is_some_and(|d| sign(d, &self.config.auth_key) == blob),
            AUTH_KIND_TOKEN => self.nonce.as_ref().is_some_and(|nonce| {
                let mut request = Vec::new();
                request.extend_from_slice(&self.config.hw_code.to_le_bytes());
                request.extend_from_slice(&self.config.hw_sub_code.to_le_bytes());
                request.extend_from_slice(&self.config.serial);
                request.extend_from_slice(nonce);
                sign(&request, &self.config.auth_key) == blob
            }),
            _ => return STATUS_INVALID_ARGUMENT,
        };
        if !accepted {
            return STATUS_REJECTED;
        }
        if self.stage == ExecutionStage::Agent {
            self.vendor_authorized = true;
        } else {
            self.boot_authorized = true;
        }
        STATUS_OK
    }

    fn handle_storage(&mut self, command: u32, payload: &[u8]) -> (u32, Vec<u8>) {
        let ss = self.config.sector_size as usize;
        match command {
            CMD_STORAGE_INFO => {
                let info = StorageInfo {
                    lun_count: self.config.lun_sectors.len() as u32,
                    sector_size: self.config.sector_size,
                    boot_lun: self.config.boot_lun,
                };
                (STATUS_OK, info.to_bytes())
            }
            CMD_GET_TABLE => {
                let Some(lun) = payload
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                else {
                    return (STATUS_INVALID_ARGUMENT, Vec::new());
                };
                let Some(&total) = self.config.lun_sectors.get(lun as usize) else {
                    return (STATUS_OUT_OF_RANGE, Vec::new());
                };
                let entries: Vec<GptEntry> = self
                    .config
                    .partitions
                    .iter()
                    .filter(|p| p.lun == lun)
                    .map(|p| GptEntry {
                        name: p.name.clone(),
                        first_lba: p.first_lba,
                        last_lba: p.first_lba + p.sectors - 1,
                    })
                    .collect();
                (STATUS_OK, build_gpt(&entries, self.config.sector_size, total))
            }
            CMD_READ | CMD_WRITE | CMD_ERASE => {
                let Ok(req) = SectorRequest::from_bytes(payload) else {
                    return (STATUS_INVALID_ARGUMENT, Vec::new());
                };
                let count = req.sector_count as u64;
                if !self.range_ok(req.lun, req.start_sector, count) {
                    return (STATUS_OUT_OF_RANGE, Vec::new());
                }
                if self.protected_hit(req.lun, req.start_sector, count) {
                    return (STATUS_NOT_AUTHORIZED, Vec::new());
                }
                match command {
                    CMD_READ => {
                        let mut out = Vec::with_capacity(count as usize * ss);
                        for s in req.start_sector..req.start_sector + count {
                            out.extend_from_slice(&self.sector(req.lun, s));
                        }
                        (STATUS_OK, out)
                    }
                    CMD_WRITE => {
                        let data = &payload[SectorRequest::SIZE..];
                        if data.len() != count as usize * ss {
                            return (STATUS_INVALID_ARGUMENT, Vec::new());
                        }
                        for (i, chunk) in data.chunks(ss).enumerate() {
                            self.store_sector(req.lun, req.start_sector + i as u64, chunk.to_vec());
                        }
                        self.bytes_written += data.len() as u64;
                        self.sector_writes.push(SectorWrite {
                            lun: req.lun,
                            start_sector: req.start_sector,
                            sector_count: req.sector_count,
                        });
                        (STATUS_OK, Vec::new())
                    }
                    _ if !self.codec.variant().supports_erase() => (STATUS_UNSUPPORTED, Vec::new()),
                    _ => {
                        if let Some(l) = self.luns.get_mut(req.lun as usize) {
                            let keys: Vec<u64> = l
                                .range(req.start_sector..req.start_sector + count)
                                .map(|(&k, _)| k)
                                .collect();
                            for k in keys {
                                l.remove(&k);
                            }
                        }
                        (STATUS_OK, Vec::new())
                    }
                }
            }
            CMD_PATCH => {
                let Ok(req) = PatchRequest::from_bytes(payload) else {
                    return (STATUS_INVALID_ARGUMENT, Vec::new());
                };
                let end = req.byte_offset as usize + req.value.len();
                let sectors = end.div_ceil(ss).max(1) as u64;
                if !self.range_ok(req.lun, req.sector, sectors) {
                    return (STATUS_OUT_OF_RANGE, Vec::new());
                }
                if self.protected_hit(req.lun, req.sector, sectors) {
                    return (STATUS_NOT_AUTHORIZED, Vec::new());
                }
                let mut buf = Vec::with_capacity(sectors as usize * ss);
                for s in req.sector..req.sector + sectors {
                    buf.extend_from_slice(&self.sector(req.lun, s));
                }
                buf[req.byte_offset as usize..end].copy_from_slice(&req.value);
                for (i, chunk) in buf.chunks(ss).enumerate() {
                    self.store_sector(req.lun, req.sector + i as u64, chunk.to_vec());
                }
                (STATUS_OK, Vec::new())
            }
            CMD_SET_BOOT_LUN => match payload.get(..4) {
                Some(b) => {
                    let lun = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    if (lun as usize) < self.config.lun_sectors.len() {
                        self.boot_lun_set = Some(lun);
                        (STATUS_OK, Vec::new())
                    } else {
                        (STATUS_OUT_OF_RANGE, Vec::new())
                    }
                }
                None => (STATUS_INVALID_ARGUMENT, Vec::new()),
            },
            _ => (STATUS_UNSUPPORTED, Vec::new()),
        }
    }
}

impl Transport for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            if !state.outbox.is_empty() {
                let n = buf.len().min(state.outbox.len());
                for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        // Nothing pending; keep timeout loops from spinning hot.
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.handle(data);
        Ok(data.len())
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), TransportError> {
        let mut state = self.state();
        state.outbox.clear();
        state.host_baud = Some(rate);
        Ok(())
    }

    fn close(&mut self) {
        self.state().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        self.usb_ids
    }
}
