//! Handshake negotiator: chip identification and variant selection.
//!
//! ```text
//! Idle -> PortOpened -> IdentitySent -> IdentityAck -> VariantSelected -> AgentRequired | Ready
//!                            ^               |
//!                            +-- IdentityTimeout (next variant in the cycle)
//! ```
//!
//! Each cycle sends IDENTIFY as BinaryFramed twice, then as XmlCommand.
//! HdlcFramed is chosen up front from the USB vendor id or an explicit
//! hint; on a serial port, which has no vendor id, it is the last attempt
//! of every cycle.

pub mod machine;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chip::{ChipFamily, ChipIdentity, ExecutionStage};
use crate::codec::{FrameCodec, ProtocolVariant};
use crate::error::{FlashError, Result};
use crate::events::{FlashEvent, FlashObserver, LogLevel};
use crate::link::DeviceLink;
use crate::protocol::IdentityHeader;
use crate::protocol::constants::CMD_IDENTIFY;

pub use machine::{CyclePlan, HandshakeState};

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub max_cycles: u32,
    pub timeout: Duration,
    /// BinaryFramed attempts per cycle before falling back to XmlCommand.
    pub binary_attempts: u32,
    pub variant_hint: Option<ProtocolVariant>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            timeout: Duration::from_millis(500),
            binary_attempts: 2,
            variant_hint: None,
        }
    }
}

/// Result of a completed negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub variant: ProtocolVariant,
    pub identity: ChipIdentity,
    /// `AgentRequired` or `Ready`.
    pub state: HandshakeState,
}

pub struct Negotiator {
    state: HandshakeState,
    config: HandshakeConfig,
    observer: Arc<dyn FlashObserver>,
}

impl Negotiator {
    pub fn new(config: HandshakeConfig, observer: Arc<dyn FlashObserver>) -> Self {
        Self {
            state: HandshakeState::Idle,
            config,
            observer,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    fn goto_state(&mut self, to: HandshakeState) {
        if !self.state.can_transition_to(to) {
            warn!(from = %self.state, to = %to, "Unexpected handshake transition");
        }
        info!(from = %self.state, to = %to, "Handshake transition");
        self.observer.on_event(&FlashEvent::HandshakeTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        });
        self.state = to;
    }

    /// Return to Idle, e.g. after a desynchronizing baud switch.
    pub fn reset(&mut self) {
        if self.state != HandshakeState::Idle {
            self.goto_state(HandshakeState::Idle);
        }
    }

    fn plan(
        &self,
        family: ChipFamily,
        serial: bool,
        prefer: Option<ProtocolVariant>,
    ) -> CyclePlan {
        if family == ChipFamily::UnisocLike
            || self.config.variant_hint == Some(ProtocolVariant::HdlcFramed)
        {
            return CyclePlan::fixed(ProtocolVariant::HdlcFramed);
        }
        let mut plan = CyclePlan::negotiated(self.config.binary_attempts);
        if serial {
            plan = plan.then(ProtocolVariant::HdlcFramed);
        }
        match prefer.or(self.config.variant_hint) {
            Some(v) => plan.preferring(v),
            None => plan,
        }
    }

    /// Run the machine from Idle on a freshly opened link.
    pub fn run(&mut self, link: &mut DeviceLink) -> Result<HandshakeOutcome> {
        self.negotiate(link, None)
    }

    /// Re-enter the machine for a new execution context (after agent
    /// handoff). The variant in use is tried first; the codec is reselected.
    pub fn renegotiate(&mut self, link: &mut DeviceLink) -> Result<HandshakeOutcome> {
        let current = link.variant();
        self.negotiate(link, Some(current))
    }

    fn negotiate(
        &mut self,
        link: &mut DeviceLink,
        prefer: Option<ProtocolVariant>,
    ) -> Result<HandshakeOutcome> {
        self.reset();
        self.goto_state(HandshakeState::PortOpened);

        let usb_ids = link.usb_ids();
        let family = ChipFamily::from_usb_ids(usb_ids);
        let plan = self.plan(family, usb_ids.is_none(), prefer);
        debug!(?family, attempts = ?plan.attempts, "Handshake plan");

        for cycle in 1..=self.config.max_cycles {
            for &variant in &plan.attempts {
                link.set_codec(FrameCodec::for_variant(variant));
                self.goto_state(HandshakeState::IdentitySent(variant));

                match identify(link, self.config.timeout, family) {
                    Ok(identity) => {
                        self.goto_state(HandshakeState::IdentityAck);
                        self.goto_state(HandshakeState::VariantSelected(variant));
                        if identity.protection.checksum_supported {
                            link.set_checksum(true);
                        }
                        let terminal = if identity.stage == ExecutionStage::Agent {
                            HandshakeState::Ready
                        } else {
                            HandshakeState::AgentRequired
                        };
                        self.goto_state(terminal);
                        info!(
                            variant = %variant,
                            chip = %identity,
                            checksum = identity.protection.checksum_supported,
                            "Handshake complete"
                        );
                        return Ok(HandshakeOutcome {
                            variant,
                            identity,
                            state: terminal,
                        });
                    }
                    Err(
                        e @ (FlashError::Timeout { .. }
                        | FlashError::FrameCorruption { .. }
                        | FlashError::ChecksumMismatch { .. }
                        | FlashError::DeviceError { .. }),
                    ) => {
                        debug!(cycle, variant = %variant, error = %e, "No identity");
                        self.goto_state(HandshakeState::IdentityTimeout);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.observer.on_log(
                LogLevel::Warn,
                &format!("handshake cycle {}/{} failed", cycle, self.config.max_cycles),
            );
        }

        Err(FlashError::HandshakeExhausted {
            cycles: self.config.max_cycles,
            context: link.context(),
        })
    }
}

/// Send one IDENTIFY with the link's current codec and parse the answer.
/// On success the chip is recorded in the link's error context.
pub fn identify(
    link: &mut DeviceLink,
    timeout: Duration,
    family: ChipFamily,
) -> Result<ChipIdentity> {
    let response = link.probe(CMD_IDENTIFY, &[], timeout)?;
    if !response.is_ok() {
        return Err(FlashError::DeviceError {
            status: response.status,
            context: link.context(),
        });
    }
    let identity = IdentityHeader::from_bytes(&response.data)
        .ok()
        .and_then(|h| ChipIdentity::from_header(&h, family))
        .ok_or_else(|| FlashError::FrameCorruption {
            detail: format!("malformed identity record ({} bytes)", response.data.len()),
            context: link.context(),
        })?;
    link.set_chip(Some(identity.to_string()));
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::link::RetryPolicy;
    use crate::protocol::constants::{FLAG_CHECKSUM_SUPPORTED, RESPONSE_FLAG, UNISOC_VENDOR_ID};
    use crate::transport::MockTransport;

    fn negotiator(max_cycles: u32) -> Negotiator {
        Negotiator::new(
            HandshakeConfig {
                max_cycles,
                timeout: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(NullObserver),
        )
    }

    fn link(mock: &MockTransport) -> DeviceLink {
        DeviceLink::new(
            Box::new(mock.clone()),
            ProtocolVariant::BinaryFramed,
            Arc::new(NullObserver),
            RetryPolicy::default(),
        )
    }

    fn identity_bytes(stage: u8, flags: u32) -> Vec<u8> {
        IdentityHeader {
            hw_code: 0x0766,
            stage,
            flags,
            ..Default::default()
        }
        .to_bytes()
    }

    #[test]
    fn test_falls_back_to_xml_after_two_binary_timeouts() {
        let mock = MockTransport::new();
        mock.queue_timeout();
        mock.queue_timeout();
        let xml = FrameCodec::for_variant(ProtocolVariant::XmlCommand);
        mock.queue_response(&xml, CMD_IDENTIFY, 0, &identity_bytes(0, 0));

        let mut link = link(&mock);
        let mut neg = negotiator(3);
        let outcome = neg.run(&mut link).unwrap();
        assert_eq!(outcome.variant, ProtocolVariant::XmlCommand);
        assert_eq!(outcome.state, HandshakeState::AgentRequired);
        assert_eq!(link.variant(), ProtocolVariant::XmlCommand);

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes[2].starts_with(b"<?xml"));
    }

    #[test]
    fn test_exhaustion_is_bounded() {
        let mock = MockTransport::new();
        let mut link = link(&mock);
        let mut neg = negotiator(2);
        assert!(matches!(
            neg.run(&mut link),
            Err(FlashError::HandshakeExhausted { cycles: 2, .. })
        ));
        // two cycles of (binary, binary, xml, hdlc)
        assert_eq!(mock.get_writes().len(), 8);
    }

    #[test]
    fn test_serial_port_reaches_hdlc_without_hint() {
        let mock = MockTransport::new();
        mock.queue_timeout();
        mock.queue_timeout();
        mock.queue_timeout();
        let hdlc = FrameCodec::for_variant(ProtocolVariant::HdlcFramed);
        mock.queue_response(&hdlc, CMD_IDENTIFY, 0, &identity_bytes(0, 0));

        let mut link = link(&mock);
        let outcome = negotiator(1).run(&mut link).unwrap();
        assert_eq!(outcome.variant, ProtocolVariant::HdlcFramed);
        assert_eq!(outcome.state, HandshakeState::AgentRequired);
        let writes = mock.get_writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[3][0], 0x7E);
    }

    #[test]
    fn test_usb_link_never_tries_hdlc_unprompted() {
        let mock = MockTransport::with_usb_ids(0x0E8D, 0x0003);
        let mut link = link(&mock);
        assert!(negotiator(1).run(&mut link).is_err());
        let writes = mock.get_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w[0] != 0x7E));
    }

    #[test]
    fn test_hdlc_selected_from_usb_vendor() {
        let mock = MockTransport::with_usb_ids(UNISOC_VENDOR_ID, 0x4D00);
        let hdlc = FrameCodec::for_variant(ProtocolVariant::HdlcFramed);
        mock.queue_response(&hdlc, CMD_IDENTIFY, 0, &identity_bytes(2, 0));

        let mut link = link(&mock);
        let outcome = negotiator(1).run(&mut link).unwrap();
        assert_eq!(outcome.variant, ProtocolVariant::HdlcFramed);
        assert_eq!(outcome.state, HandshakeState::Ready);
        assert_eq!(mock.get_writes()[0][0], 0x7E);
    }

    #[test]
    fn test_checksum_enabled_when_advertised() {
        let mock = MockTransport::new();
        let plain = FrameCodec::for_variant(ProtocolVariant::BinaryFramed);
        mock.queue_response(
            &plain,
            CMD_IDENTIFY,
            0,
            &identity_bytes(2, FLAG_CHECKSUM_SUPPORTED),
        );
        let mut link = link(&mock);
        negotiator(1).run(&mut link).unwrap();

        // Subsequent frames carry the CRC32 trailer.
        let mut crc = FrameCodec::for_variant(ProtocolVariant::BinaryFramed);
        crc.set_checksum(true);
        mock.queue_response(&crc, 0x02, 0, &[]);
        link.transact(0x02, &[], Duration::from_millis(10)).unwrap();
        let writes = mock.get_writes();
        assert_eq!(writes.last().unwrap().len(), 12 + 4);
    }

    #[test]
    fn test_malformed_identity_counts_as_failed_attempt() {
        let mock = MockTransport::new();
        let plain = FrameCodec::for_variant(ProtocolVariant::BinaryFramed);
        mock.queue_bytes(&plain.encode(CMD_IDENTIFY | RESPONSE_FLAG, &[0, 0, 0, 0, 1]).unwrap());
        mock.queue_response(&plain, CMD_IDENTIFY, 0, &identity_bytes(1, 0));
        let mut link = link(&mock);
        let outcome = negotiator(1).run(&mut link).unwrap();
        assert_eq!(outcome.identity.stage, ExecutionStage::FirstStage);
    }
}
