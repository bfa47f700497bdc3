//! Agent loader: exploit, boot-ROM auth, upload and handoff.
//!
//! ```text
//! [exploit] -> [auth] -> UPLOAD_BEGIN -> UPLOAD_DATA* -> UPLOAD_END (RDYn)
//!           -> JUMP -> probe IDENTIFY until handoff_timeout
//!           -> [second image: upload + JUMP + probe] -> renegotiate
//! ```

pub mod exploit;

use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use crate::auth::{AuthContext, AuthMaterial, AuthStrategy, DigestSignaturePair};
use crate::chip::{ChipFamily, ChipIdentity, ExecutionStage};
use crate::codec::{FrameCodec, ProtocolVariant};
use crate::error::{FlashError, Result};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, LogLevel};
use crate::handshake::{HandshakeOutcome, HandshakeState, Negotiator, identify};
use crate::link::DeviceLink;
use crate::protocol::constants::{
    ACK_READY_FIRST, ACK_READY_SECOND, CMD_EXPLOIT, CMD_JUMP, CMD_UPLOAD_BEGIN, CMD_UPLOAD_DATA,
    CMD_UPLOAD_END,
};
use crate::protocol::{AckCode, UploadHeader};

pub use exploit::{ExploitDescriptor, ExploitKind, ExploitTable};

/// Offset prefix of every UPLOAD_DATA chunk.
const UPLOAD_OFFSET_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStage {
    First,
    Second,
}

impl AgentStage {
    pub fn as_u8(self) -> u8 {
        match self {
            AgentStage::First => 1,
            AgentStage::Second => 2,
        }
    }

    fn ready_ack(self) -> AckCode {
        match self {
            AgentStage::First => AckCode::from_u32(ACK_READY_FIRST),
            AgentStage::Second => AckCode::from_u32(ACK_READY_SECOND),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AgentImage {
    pub data: Vec<u8>,
    pub address: u64,
    pub stage: AgentStage,
}

impl std::fmt::Debug for AgentImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentImage")
            .field("len", &self.data.len())
            .field("address", &format_args!("0x{:X}", self.address))
            .field("stage", &self.stage)
            .finish()
    }
}

/// Images and optional credential for one chip.
#[derive(Debug, Clone)]
pub struct AgentBundle {
    pub first: AgentImage,
    pub second: Option<AgentImage>,
    pub auth: Option<AuthMaterial>,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub transfer_retries: u32,
    pub io_timeout: Duration,
    pub handoff_timeout: Duration,
    /// Timeout of each IDENTIFY probe while waiting for handoff.
    pub probe_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            transfer_retries: 3,
            io_timeout: Duration::from_secs(2),
            handoff_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(200),
        }
    }
}

pub struct AgentLoader<'a> {
    link: &'a mut DeviceLink,
    negotiator: &'a mut Negotiator,
    observer: &'a dyn FlashObserver,
    config: &'a LoaderConfig,
}

impl<'a> AgentLoader<'a> {
    pub fn new(
        link: &'a mut DeviceLink,
        negotiator: &'a mut Negotiator,
        observer: &'a dyn FlashObserver,
        config: &'a LoaderConfig,
    ) -> Self {
        Self {
            link,
            negotiator,
            observer,
            config,
        }
    }

    fn enter(&self, phase: &mut FlashPhase, to: FlashPhase) {
        self.observer.on_event(&FlashEvent::PhaseChanged { from: *phase, to });
        *phase = to;
    }

    /// Bring the device from boot ROM or first stage up to a ready agent.
    ///
    /// `authorized` is true when the session already authenticated against
    /// the boot ROM.
    #[instrument(skip_all, fields(chip = %identity))]
    pub fn load(
        &mut self,
        identity: &ChipIdentity,
        bundle: AgentBundle,
        exploit: Option<&ExploitDescriptor>,
        authorized: bool,
    ) -> Result<HandshakeOutcome> {
        let exploit = exploit.filter(|d| d.applies_to(identity.hw_code, identity.stage));
        if identity.needs_signed_agent() && exploit.is_none() && bundle.auth.is_none() && !authorized
        {
            return Err(FlashError::SignatureRequired {
                context: self.link.context(),
            });
        }

        let mut phase = FlashPhase::Handshake;
        let mut bypassed = false;
        if let Some(descriptor) = exploit {
            self.enter(&mut phase, FlashPhase::Exploit);
            self.run_exploit(descriptor)?;
            bypassed = descriptor.kind == ExploitKind::Bypass;
            if !bypassed && identity.needs_signed_agent() && bundle.auth.is_none() && !authorized {
                return Err(FlashError::SignatureRequired {
                    context: self.link.context(),
                });
            }
        }

        let wants_auth = identity.stage == ExecutionStage::BootRom
            && (identity.protection.auth_required
                || (identity.needs_signed_agent() && !bypassed));
        if wants_auth
            && !authorized
            && let Some(material) = bundle.auth
        {
            self.enter(&mut phase, FlashPhase::Authenticating);
            self.present_material(identity, material)?;
        }

        self.enter(&mut phase, FlashPhase::AgentUpload);
        self.upload(&bundle.first)?;
        self.jump(bundle.first.address)?;
        let mut current = self.wait_for_handoff(identity.family)?;

        if let Some(second) = bundle.second.as_ref() {
            info!(
                stage = %current.stage,
                address = format_args!("0x{:X}", second.address),
                "First stage ready, uploading second stage"
            );
            self.upload(second)?;
            self.jump(second.address)?;
            current = self.wait_for_handoff(identity.family)?;
        } else if current.stage != ExecutionStage::Agent {
            return Err(FlashError::InvalidImage(format!(
                "device is at {} after handoff and no second-stage agent is configured",
                current.stage
            )));
        }

        let outcome = self.negotiator.renegotiate(self.link)?;
        if outcome.state != HandshakeState::Ready {
            return Err(FlashError::NotReady {
                state: format!("{} at {}", outcome.state, current.stage),
            });
        }
        info!(variant = %outcome.variant, chip = %outcome.identity, "Agent ready");
        Ok(outcome)
    }

    /// Send the exploit payload; only the exact expected ack counts.
    fn run_exploit(&mut self, descriptor: &ExploitDescriptor) -> Result<()> {
        info!(name = %descriptor.name, kind = ?descriptor.kind, "Sending exploit payload");
        let response = self
            .link
            .request(CMD_EXPLOIT, &descriptor.payload, self.config.io_timeout)?;
        let ack = AckCode::from_bytes(&response.data);
        self.observer.on_event(&FlashEvent::AckReceived {
            ack: ack.as_ascii(),
        });
        let expected = descriptor.kind.expected_ack();
        if !response.is_ok() || ack != expected {
            self.observer.on_log(
                LogLevel::Warn,
                &format!(
                    "exploit '{}' not acknowledged: status {}, ack '{}', expected '{}'",
                    descriptor.name,
                    response.status,
                    ack.as_ascii(),
                    expected.as_ascii()
                ),
            );
            return Err(FlashError::ExploitFailed {
                name: descriptor.name.clone(),
                ack: if ack.is_empty() {
                    format!("status {}", response.status)
                } else {
                    ack.as_ascii()
                },
                context: self.link.context(),
            });
        }
        info!(name = %descriptor.name, ack = %ack.as_ascii(), "Exploit acknowledged");
        Ok(())
    }

    fn present_material(&mut self, identity: &ChipIdentity, material: AuthMaterial) -> Result<()> {
        let mut ctx = AuthContext {
            link: self.link,
            chip: identity,
            timeout: self.config.io_timeout,
        };
        match material {
            material @ AuthMaterial::DigestSignature { .. } => {
                let mut strategy = DigestSignaturePair::new();
                strategy.challenge(&mut ctx)?;
                strategy.supply(&mut ctx, material)?;
                Ok(())
            }
            AuthMaterial::Token(_) => Err(FlashError::AuthRejected {
                reason: "tokens need a device challenge; authenticate the session first".into(),
                context: ctx.link.context(),
            }),
        }
    }

    fn upload(&mut self, image: &AgentImage) -> Result<()> {
        if image.data.is_empty() || image.data.len() > u32::MAX as usize {
            return Err(FlashError::InvalidImage(format!(
                "agent image of {} bytes",
                image.data.len()
            )));
        }
        let header = UploadHeader {
            address: image.address,
            length: image.data.len() as u32,
            stage: image.stage.as_u8(),
        };
        info!(
            stage = ?image.stage,
            address = format_args!("0x{:X}", image.address),
            len = image.data.len(),
            "Uploading agent"
        );
        self.link
            .transact(CMD_UPLOAD_BEGIN, &header.to_bytes(), self.config.io_timeout)?;

        let chunk_size = self.link.variant().max_payload() - UPLOAD_OFFSET_SIZE;
        let total = image.data.len() as u64;
        let mut offset = 0usize;
        for chunk in image.data.chunks(chunk_size) {
            let mut payload = Vec::with_capacity(UPLOAD_OFFSET_SIZE + chunk.len());
            payload.extend_from_slice(&(offset as u32).to_le_bytes());
            payload.extend_from_slice(chunk);
            self.send_chunk(&payload)?;
            offset += chunk.len();
            self.observer.on_progress("agent upload", offset as u64, total);
        }

        let data = self.link.transact(
            CMD_UPLOAD_END,
            &crc32fast::hash(&image.data).to_le_bytes(),
            self.config.io_timeout,
        )?;
        let ack = AckCode::from_bytes(&data);
        self.observer.on_event(&FlashEvent::AckReceived {
            ack: ack.as_ascii(),
        });
        if ack != image.stage.ready_ack() {
            return Err(FlashError::FrameCorruption {
                detail: format!(
                    "upload acknowledged with '{}', expected '{}'",
                    ack.as_ascii(),
                    image.stage.ready_ack().as_ascii()
                ),
                context: self.link.context(),
            });
        }
        Ok(())
    }

    fn send_chunk(&mut self, payload: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self
                .link
                .transact(CMD_UPLOAD_DATA, payload, self.config.io_timeout)
            {
                Ok(_) => return Ok(()),
                Err(
                    e @ (FlashError::Timeout { .. }
                    | FlashError::ChecksumMismatch { .. }
                    | FlashError::FrameCorruption { .. }),
                ) if attempt < self.config.transfer_retries => {
                    attempt += 1;
                    self.observer.on_log(
                        LogLevel::Warn,
                        &format!("upload chunk failed (attempt {}): {}, retrying", attempt, e),
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn jump(&mut self, address: u64) -> Result<()> {
        info!(address = format_args!("0x{:X}", address), "Jumping to agent");
        self.link
            .transact(CMD_JUMP, &address.to_le_bytes(), self.config.io_timeout)?;
        Ok(())
    }

    /// Probe IDENTIFY until the new execution context answers. The codec
    /// is reset to defaults since the new code starts without checksums.
    fn wait_for_handoff(&mut self, family: ChipFamily) -> Result<ChipIdentity> {
        let current = self.link.variant();
        let candidates: Vec<ProtocolVariant> = if current == ProtocolVariant::HdlcFramed {
            vec![current]
        } else {
            std::iter::once(current)
                .chain(ProtocolVariant::NEGOTIATED.into_iter().filter(|&v| v != current))
                .collect()
        };

        let started = Instant::now();
        let deadline = started + self.config.handoff_timeout;
        while Instant::now() < deadline {
            for &variant in &candidates {
                self.link.set_codec(FrameCodec::for_variant(variant));
                match identify(self.link, self.config.probe_timeout, family) {
                    Ok(identity) => {
                        info!(
                            variant = %variant,
                            stage = %identity.stage,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Handoff complete"
                        );
                        return Ok(identity);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!(variant = %variant, error = %e, "Waiting for handoff"),
                }
            }
        }

        Err(FlashError::HandoffTimeout {
            waited_ms: self.config.handoff_timeout.as_millis() as u64,
            context: self.link.context(),
        })
    }
}
