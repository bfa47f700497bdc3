//! Session - one device connection from handshake to close.
//!
//! A [`Session`] exclusively owns its transport. It is created by a
//! successful open + handshake and is unusable after [`Session::close`], a
//! fatal error or a detected disconnect: the transport is released and the
//! partition catalog dropped.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentBundle, AgentLoader, ExploitTable, LoaderConfig};
use crate::auth::{AuthContext, AuthLevel, AuthMaterial, AuthStrategy, MaterialRequest};
use crate::chip::{ChipIdentity, ExecutionStage};
use crate::codec::ProtocolVariant;
use crate::error::{FlashError, Result};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, TracingObserver};
use crate::executor::{
    BatchReport, CancelToken, Executor, ExecutorConfig, Operation, Patch, ReadOutcome,
    WriteSource, default_protected_partitions,
};
use crate::firmware::{ImageEntry, catalog_from_entries};
use crate::handshake::{HandshakeConfig, HandshakeOutcome, HandshakeState, Negotiator};
use crate::link::{DeviceLink, RetryPolicy};
use crate::partition::{PartitionCatalog, parse_gpt};
use crate::protocol::StorageInfo;
use crate::protocol::constants::{
    CMD_BAUD_SWITCH, CMD_GET_TABLE, CMD_PING, CMD_RESET, CMD_STORAGE_INFO,
};
use crate::repository::LoaderRepository;
use crate::transport::{NusbTransport, SerialTransport, Transport, TransportError};

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device path. Without one the session opens the first
    /// supported USB device.
    pub port: Option<String>,
    /// Initial serial line rate.
    pub baud_rate: u32,
    /// Seconds to poll for a USB device before giving up.
    pub device_wait_secs: u64,
    pub handshake_timeout_ms: u64,
    pub max_handshake_cycles: u32,
    /// BinaryFramed attempts per cycle before XmlCommand is tried.
    pub binary_attempts: u32,
    pub variant_hint: Option<ProtocolVariant>,
    pub io_timeout_ms: u64,
    /// Extra I/O timeout per KiB of block data.
    pub io_timeout_per_kib_ms: u64,
    pub erase_timeout_ms: u64,
    pub checksum_retries: u32,
    pub timeout_retries: u32,
    pub transfer_retries: u32,
    pub handoff_timeout_ms: u64,
    pub handoff_probe_ms: u64,
    /// Window for the device to answer at a new baud rate.
    pub baud_grace_ms: u64,
    /// Re-run the handshake when a baud switch desynchronizes the link.
    pub rehandshake_on_desync: bool,
    pub block_size: usize,
    pub protected_partitions: Vec<String>,
    /// Overrides the device-reported boot LUN after multi-LUN batches.
    pub boot_lun: Option<u32>,
    /// Overrides the variant's default baud sequence.
    pub baud_sequence: Option<Vec<u32>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            device_wait_secs: 60,
            handshake_timeout_ms: 500,
            max_handshake_cycles: 3,
            binary_attempts: 2,
            variant_hint: None,
            io_timeout_ms: 2_000,
            io_timeout_per_kib_ms: 2,
            erase_timeout_ms: 60_000,
            checksum_retries: 3,
            timeout_retries: 2,
            transfer_retries: 3,
            handoff_timeout_ms: 5_000,
            handoff_probe_ms: 200,
            baud_grace_ms: 1_000,
            rehandshake_on_desync: false,
            block_size: 1024 * 1024,
            protected_partitions: default_protected_partitions(),
            boot_lun: None,
            baud_sequence: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: SessionConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            max_cycles: self.max_handshake_cycles,
            timeout: Duration::from_millis(self.handshake_timeout_ms),
            binary_attempts: self.binary_attempts,
            variant_hint: self.variant_hint,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            checksum_retries: self.checksum_retries,
            timeout_retries: self.timeout_retries,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            block_size: self.block_size,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            io_timeout_per_kib: Duration::from_millis(self.io_timeout_per_kib_ms),
            erase_timeout: Duration::from_millis(self.erase_timeout_ms),
            protected_partitions: self.protected_partitions.clone(),
            boot_lun: self.boot_lun,
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            transfer_retries: self.transfer_retries,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            handoff_timeout: Duration::from_millis(self.handoff_timeout_ms),
            probe_timeout: Duration::from_millis(self.handoff_probe_ms),
        }
    }
}

pub struct Session {
    config: SessionConfig,
    observer: Arc<dyn FlashObserver>,
    link: Option<DeviceLink>,
    negotiator: Negotiator,
    identity: ChipIdentity,
    variant: ProtocolVariant,
    state: HandshakeState,
    phase: FlashPhase,
    auth_level: AuthLevel,
    boot_authorized: bool,
    strategy: Option<Box<dyn AuthStrategy>>,
    storage: Option<StorageInfo>,
    catalog: Option<Arc<PartitionCatalog>>,
    exploits: Arc<ExploitTable>,
    cancel: CancelToken,
}

impl Session {
    /// Handshake over an already opened transport.
    #[instrument(skip_all, fields(port = %transport.describe()))]
    pub fn open(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        observer: Arc<dyn FlashObserver>,
    ) -> Result<Self> {
        observer.on_event(&FlashEvent::DeviceConnected {
            port: transport.describe(),
            usb_ids: transport.usb_ids(),
        });
        let mut link = DeviceLink::new(
            transport,
            config.variant_hint.unwrap_or(ProtocolVariant::BinaryFramed),
            observer.clone(),
            config.retry_policy(),
        );
        let mut negotiator = Negotiator::new(config.handshake_config(), observer.clone());
        observer.on_event(&FlashEvent::PhaseChanged {
            from: FlashPhase::Idle,
            to: FlashPhase::Handshake,
        });
        let outcome = match negotiator.run(&mut link) {
            Ok(outcome) => outcome,
            Err(e) => {
                link.close();
                return Err(e);
            }
        };

        Ok(Self {
            config,
            observer,
            link: Some(link),
            negotiator,
            identity: outcome.identity,
            variant: outcome.variant,
            state: outcome.state,
            phase: FlashPhase::Handshake,
            auth_level: AuthLevel::Basic,
            boot_authorized: false,
            strategy: None,
            storage: None,
            catalog: None,
            exploits: Arc::new(ExploitTable::default()),
            cancel: CancelToken::new(),
        })
    }

    /// Open the configured serial port.
    pub fn open_serial(config: SessionConfig, observer: Arc<dyn FlashObserver>) -> Result<Self> {
        let port = config
            .port
            .clone()
            .ok_or_else(|| FlashError::Config("no serial port configured".into()))?;
        let transport = SerialTransport::open(
            &port,
            config.baud_rate,
            Duration::from_millis(config.handshake_timeout_ms),
        )
        .map_err(|e| port_error(&port, e))?;
        Self::open(Box::new(transport), config, observer)
    }

    /// Poll for a supported USB device, then open it.
    pub fn open_usb(config: SessionConfig, observer: Arc<dyn FlashObserver>) -> Result<Self> {
        info!("Waiting for device...");
        let timeout = Duration::from_secs(config.device_wait_secs);
        let start = Instant::now();
        let mut poll_count = 0u64;

        let transport = loop {
            poll_count += 1;
            match NusbTransport::open() {
                Ok(t) => {
                    info!("Device found after {} polls", poll_count);
                    break t;
                }
                Err(TransportError::DeviceNotFound { .. }) if start.elapsed() < timeout => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(port_error("usb", e)),
            }
        };
        Self::open(Box::new(transport), config, observer)
    }

    /// Serial when a port is configured, USB otherwise.
    pub fn open_configured(config: SessionConfig) -> Result<Self> {
        let observer: Arc<dyn FlashObserver> = Arc::new(TracingObserver);
        if config.port.is_some() {
            Self::open_serial(config, observer)
        } else {
            Self::open_usb(config, observer)
        }
    }

    pub fn with_exploits(mut self, exploits: Arc<ExploitTable>) -> Self {
        self.exploits = exploits;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity(&self) -> &ChipIdentity {
        &self.identity
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn auth_level(&self) -> AuthLevel {
        self.auth_level
    }

    pub fn storage_info(&self) -> Option<StorageInfo> {
        self.storage
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Option<Arc<PartitionCatalog>> {
        self.catalog.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn link(&mut self) -> Result<&mut DeviceLink> {
        self.link.as_mut().ok_or(FlashError::SessionClosed)
    }

    fn set_phase(&mut self, to: FlashPhase) {
        if self.phase != to {
            self.observer.on_event(&FlashEvent::PhaseChanged {
                from: self.phase,
                to,
            });
            self.phase = to;
        }
    }

    fn require_ready(&self) -> Result<()> {
        if self.link.is_none() {
            return Err(FlashError::SessionClosed);
        }
        if self.state != HandshakeState::Ready {
            return Err(FlashError::NotReady {
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Drop the transport and catalog after a fatal error.
    fn invalidate(&mut self, reason: &FlashError) {
        warn!(error = %reason, "Session invalidated");
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.catalog = None;
        self.storage = None;
        self.strategy = None;
        self.state = HandshakeState::Idle;
        self.set_phase(FlashPhase::Error);
    }

    /// Invalidate on fatal errors or a disconnected link; pass the result on.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let disconnected = self.link.as_ref().is_some_and(DeviceLink::is_disconnected);
            if e.is_fatal() || disconnected {
                self.invalidate(e);
            }
        }
        result
    }

    fn adopt(&mut self, outcome: HandshakeOutcome) {
        self.identity = outcome.identity;
        self.variant = outcome.variant;
        self.state = outcome.state;
    }

    /// Upload and start the agent. A session already at `Ready` is left
    /// as is.
    pub fn load_agent(&mut self, bundle: AgentBundle) -> Result<()> {
        match self.state {
            HandshakeState::Ready => {
                info!("Agent already running");
                return Ok(());
            }
            HandshakeState::AgentRequired => {}
            other => {
                return Err(FlashError::NotReady {
                    state: other.to_string(),
                });
            }
        }
        self.set_phase(FlashPhase::AgentUpload);

        let loader_config = self.config.loader_config();
        let exploit = self.exploits.clone();
        let identity = self.identity.clone();
        let authorized = self.boot_authorized;
        let observer = self.observer.clone();
        let result = match self.link.as_mut() {
            Some(link) => AgentLoader::new(link, &mut self.negotiator, observer.as_ref(), &loader_config)
                .load(&identity, bundle, exploit.get(identity.hw_code), authorized),
            None => Err(FlashError::SessionClosed),
        };
        let outcome = self.check(result)?;

        // New execution context: previous auth and table are void.
        self.adopt(outcome);
        self.auth_level = AuthLevel::Basic;
        self.strategy = None;
        self.catalog = None;
        self.storage = None;
        Ok(())
    }

    /// Fetch images for the identified chip and load them.
    pub fn load_agent_from(&mut self, repository: &dyn LoaderRepository) -> Result<()> {
        if self.state == HandshakeState::Ready {
            return Ok(());
        }
        let bundle = repository.fetch(&self.identity)?;
        self.load_agent(bundle)
    }

    /// Re-run the handshake on the open link, e.g. after desynchronization.
    pub fn rehandshake(&mut self) -> Result<()> {
        let link = self.link.as_mut().ok_or(FlashError::SessionClosed)?;
        let result = self.negotiator.run(link);
        let outcome = self.check(result)?;
        self.adopt(outcome);
        Ok(())
    }

    /// Ask the device to change line rate and follow it.
    ///
    /// The device must answer a PING at the new rate within the grace
    /// window, otherwise the link is desynchronized and the handshake must
    /// be restarted.
    #[instrument(skip(self))]
    pub fn switch_baud(&mut self, rate: u32) -> Result<()> {
        let io_timeout = Duration::from_millis(self.config.io_timeout_ms);
        let probe = Duration::from_millis(self.config.handshake_timeout_ms);
        let grace = Duration::from_millis(self.config.baud_grace_ms);

        let link = self.link()?;
        let result = link
            .transact(CMD_BAUD_SWITCH, &rate.to_le_bytes(), io_timeout)
            .and_then(|_| link.set_baud_rate(rate));
        self.check(result)?;

        let link = self.link()?;
        let deadline = Instant::now() + grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match link.probe(CMD_PING, &[], probe.min(remaining)) {
                Ok(r) if r.is_ok() => {
                    info!(rate, "Baud rate switched");
                    return Ok(());
                }
                Ok(r) => debug!(status = r.status, "PING rejected after baud switch"),
                Err(e) if e.is_fatal() => return self.check(Err(e)),
                Err(e) => debug!(error = %e, "No answer at new baud rate yet"),
            }
        }

        let err = FlashError::Desynchronized {
            baud: rate,
            context: link.context(),
        };
        warn!(rate, "Link desynchronized after baud switch");
        self.negotiator.reset();
        self.state = HandshakeState::Idle;
        if self.config.rehandshake_on_desync {
            info!("Restarting handshake after desynchronization");
            self.rehandshake()?;
        }
        Err(err)
    }

    /// Step through the baud sequence after the first (boot) rate.
    pub fn apply_baud_sequence(&mut self) -> Result<()> {
        let sequence = self
            .config
            .baud_sequence
            .clone()
            .unwrap_or_else(|| self.variant.baud_sequence().to_vec());
        for rate in sequence.into_iter().skip(1) {
            self.switch_baud(rate)?;
        }
        Ok(())
    }

    /// Start authentication with `strategy`; returns what it needs.
    pub fn authenticate(&mut self, mut strategy: Box<dyn AuthStrategy>) -> Result<MaterialRequest> {
        self.set_phase(FlashPhase::Authenticating);
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        let link = self.link.as_mut().ok_or(FlashError::SessionClosed)?;
        let mut ctx = AuthContext {
            link,
            chip: &self.identity,
            timeout,
        };
        let result = strategy.challenge(&mut ctx);
        let request = self.check(result)?;
        info!(strategy = strategy.name(), "Authentication started");
        self.strategy = Some(strategy);
        Ok(request)
    }

    /// Present material to the active strategy. A rejection leaves the
    /// session open at its previous level.
    pub fn supply_auth(&mut self, material: AuthMaterial) -> Result<AuthLevel> {
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        let link = self.link.as_mut().ok_or(FlashError::SessionClosed)?;
        let strategy = self.strategy.as_mut().ok_or_else(|| FlashError::NotReady {
            state: "no authentication in progress".into(),
        })?;
        let mut ctx = AuthContext {
            link,
            chip: &self.identity,
            timeout,
        };
        let result = strategy.supply(&mut ctx, material);
        let level = self.check(result)?;
        if self.identity.stage == ExecutionStage::Agent {
            self.auth_level = self.auth_level.max(level);
        } else {
            self.boot_authorized = true;
        }
        info!(level = ?level, stage = %self.identity.stage, "Authentication accepted");
        Ok(level)
    }

    /// Query the device table and swap it in.
    #[instrument(skip(self))]
    pub fn refresh_catalog(&mut self) -> Result<Arc<PartitionCatalog>> {
        self.require_ready()?;
        self.set_phase(FlashPhase::Catalog);
        let result = self.query_catalog();
        let (info, catalog) = self.check(result)?;
        let catalog = Arc::new(catalog);
        info!(
            luns = info.lun_count,
            partitions = catalog.len(),
            sector_size = info.sector_size,
            "Partition catalog loaded"
        );
        self.storage = Some(info);
        self.catalog = Some(catalog.clone());
        Ok(catalog)
    }

    fn query_catalog(&mut self) -> Result<(StorageInfo, PartitionCatalog)> {
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        let link = self.link()?;
        let data = link.transact(CMD_STORAGE_INFO, &[], timeout)?;
        let info = StorageInfo::from_bytes(&data).map_err(|e| FlashError::FrameCorruption {
            detail: format!("storage info: {e}"),
            context: link.context(),
        })?;

        let mut partitions = Vec::new();
        for lun in 0..info.lun_count {
            let table = link.transact(CMD_GET_TABLE, &lun.to_le_bytes(), timeout)?;
            let found = parse_gpt(&table, info.sector_size, lun)?;
            debug!(lun, partitions = found.len(), "Table read");
            partitions.extend(found);
        }
        let catalog = PartitionCatalog::from_partitions(partitions, info.sector_size, info.boot_lun)?;
        Ok((info, catalog))
    }

    /// Use the layout embedded in firmware instead of the device table.
    pub fn import_catalog(&mut self, entries: &[ImageEntry], sector_size: u32, boot_lun: u32) -> Result<Arc<PartitionCatalog>> {
        let catalog = Arc::new(catalog_from_entries(entries, sector_size, boot_lun)?);
        info!(partitions = catalog.len(), "Partition catalog imported from firmware");
        self.catalog = Some(catalog.clone());
        Ok(catalog)
    }

    fn run_io<T>(
        &mut self,
        phase: FlashPhase,
        op: impl FnOnce(&mut Executor<'_>) -> Result<T>,
    ) -> Result<T> {
        self.require_ready()?;
        if self.catalog.is_none() {
            self.refresh_catalog()?;
        }
        let catalog = self.catalog.clone().ok_or(FlashError::SessionClosed)?;
        self.set_phase(phase);

        let config = self.config.executor_config();
        let observer = self.observer.clone();
        let cancel = self.cancel.clone();
        let level = self.auth_level;
        let result = match self.link.as_mut() {
            Some(link) => {
                let mut executor =
                    Executor::new(link, &catalog, &config, observer.as_ref(), &cancel, level);
                op(&mut executor)
            }
            None => Err(FlashError::SessionClosed),
        };
        // A cancel is consumed by the operation it was pending for.
        self.cancel.reset();
        let result = self.check(result);
        if result.is_ok() {
            self.set_phase(FlashPhase::Complete);
        }
        result
    }

    fn resolve(&self, name: &str, lun: Option<u32>) -> Result<crate::partition::Partition> {
        self.catalog
            .as_ref()
            .and_then(|c| c.find(name, lun).cloned())
            .ok_or_else(|| FlashError::UnknownPartition {
                name: name.to_string(),
            })
    }

    fn ensure_catalog(&mut self) -> Result<()> {
        self.require_ready()?;
        if self.catalog.is_none() {
            self.refresh_catalog()?;
        }
        Ok(())
    }

    pub fn read(
        &mut self,
        name: &str,
        lun: Option<u32>,
        dest: &mut dyn std::io::Write,
        limit: Option<u64>,
    ) -> Result<ReadOutcome> {
        self.ensure_catalog()?;
        let partition = self.resolve(name, lun)?;
        self.run_io(FlashPhase::Reading, |ex| ex.read(&partition, dest, limit))
    }

    pub fn write(&mut self, name: &str, lun: Option<u32>, source: WriteSource) -> Result<u64> {
        self.ensure_catalog()?;
        let partition = self.resolve(name, lun)?;
        self.run_io(FlashPhase::Writing, |ex| ex.write(&partition, source))
    }

    pub fn erase(&mut self, name: &str, lun: Option<u32>) -> Result<u64> {
        self.ensure_catalog()?;
        let partition = self.resolve(name, lun)?;
        self.run_io(FlashPhase::Erasing, |ex| ex.erase(&partition))
    }

    /// Run a batch; see [`Executor::run_batch`].
    pub fn batch(&mut self, operations: Vec<Operation>, patches: Vec<Patch>) -> Result<BatchReport> {
        let observer = self.observer.clone();
        let mut phase = FlashPhase::Writing;
        let report = self.run_io(FlashPhase::Writing, move |ex| {
            ex.run_batch(operations, patches, |to| {
                if to != phase {
                    observer.on_event(&FlashEvent::PhaseChanged { from: phase, to });
                    phase = to;
                }
            })
        })?;
        if let Some(error) = report.fatal_error() {
            self.invalidate(error);
        }
        Ok(report)
    }

    /// Reboot the device and close the session.
    pub fn reset(&mut self) -> Result<()> {
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        let result = self.link()?.transact(CMD_RESET, &[], timeout).map(|_| ());
        self.close();
        result
    }

    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            info!(port = %link.describe(), "Closing session");
            link.close();
            self.observer.on_event(&FlashEvent::Complete);
        }
        self.catalog = None;
        self.storage = None;
        self.strategy = None;
        self.state = HandshakeState::Idle;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn port_error(port: &str, err: TransportError) -> FlashError {
    match err {
        TransportError::PortUnavailable { port, message } => {
            FlashError::PortUnavailable { port, message }
        }
        other => FlashError::PortUnavailable {
            port: port.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        let config = SessionConfig {
            port: Some("/dev/ttyUSB0".into()),
            variant_hint: Some(ProtocolVariant::HdlcFramed),
            baud_sequence: Some(vec![115_200, 921_600]),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig =
            toml::from_str("block_size = 65536\nvariant_hint = \"xml_command\"\n").unwrap();
        assert_eq!(config.block_size, 65536);
        assert_eq!(config.variant_hint, Some(ProtocolVariant::XmlCommand));
        assert_eq!(config.max_handshake_cycles, 3);
        assert!(config.protected_partitions.iter().any(|p| p == "nvdata"));
    }
}
