//! Handshake states and transition bookkeeping.

use std::fmt;

use crate::codec::ProtocolVariant;

/// Handshake negotiator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    PortOpened,
    /// IDENTIFY sent using this variant.
    IdentitySent(ProtocolVariant),
    IdentityAck,
    IdentityTimeout,
    VariantSelected(ProtocolVariant),
    /// Boot ROM or first stage answered; an agent must be uploaded.
    AgentRequired,
    /// Agent answered; storage commands are available.
    Ready,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Idle => write!(f, "IDLE"),
            HandshakeState::PortOpened => write!(f, "PORT_OPENED"),
            HandshakeState::IdentitySent(v) => write!(f, "IDENTITY_SENT({v})"),
            HandshakeState::IdentityAck => write!(f, "IDENTITY_ACK"),
            HandshakeState::IdentityTimeout => write!(f, "IDENTITY_TIMEOUT"),
            HandshakeState::VariantSelected(v) => write!(f, "VARIANT_SELECTED({v})"),
            HandshakeState::AgentRequired => write!(f, "AGENT_REQUIRED"),
            HandshakeState::Ready => write!(f, "READY"),
        }
    }
}

impl HandshakeState {
    /// Whether the negotiator has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::AgentRequired | HandshakeState::Ready)
    }

    /// Whether the transition `self -> to` is part of the machine.
    pub fn can_transition_to(&self, to: HandshakeState) -> bool {
        use HandshakeState::*;
        match (self, to) {
            (Idle, PortOpened) => true,
            (PortOpened | IdentityTimeout, IdentitySent(_)) => true,
            (IdentitySent(_), IdentityAck | IdentityTimeout) => true,
            (IdentityAck, VariantSelected(_)) => true,
            (VariantSelected(_), AgentRequired | Ready) => true,
            // renegotiation after handoff or a failed baud switch
            (AgentRequired | Ready | IdentityTimeout, Idle) => true,
            _ => false,
        }
    }
}

/// Plan of variants tried in one negotiation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub attempts: Vec<ProtocolVariant>,
}

impl CyclePlan {
    /// BinaryFramed `binary_attempts` times, then XmlCommand once.
    pub fn negotiated(binary_attempts: u32) -> Self {
        let mut attempts = vec![ProtocolVariant::BinaryFramed; binary_attempts.max(1) as usize];
        attempts.push(ProtocolVariant::XmlCommand);
        Self { attempts }
    }

    /// Single deterministic variant.
    pub fn fixed(variant: ProtocolVariant) -> Self {
        Self {
            attempts: vec![variant],
        }
    }

    /// Append `variant` as the last attempt of each cycle.
    pub fn then(mut self, variant: ProtocolVariant) -> Self {
        if !self.attempts.contains(&variant) {
            self.attempts.push(variant);
        }
        self
    }

    /// Move `variant` to the front while keeping the rest in order.
    pub fn preferring(mut self, variant: ProtocolVariant) -> Self {
        if let Some(pos) = self.attempts.iter().position(|v| *v == variant) {
            let v = self.attempts.remove(pos);
            self.attempts.insert(0, v);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiated_plan_order() {
        let plan = CyclePlan::negotiated(2);
        assert_eq!(
            plan.attempts,
            vec![
                ProtocolVariant::BinaryFramed,
                ProtocolVariant::BinaryFramed,
                ProtocolVariant::XmlCommand
            ]
        );
        let plan = plan.preferring(ProtocolVariant::XmlCommand);
        assert_eq!(plan.attempts[0], ProtocolVariant::XmlCommand);
        assert_eq!(plan.attempts.len(), 3);

        let plan = plan
            .then(ProtocolVariant::HdlcFramed)
            .then(ProtocolVariant::HdlcFramed);
        assert_eq!(plan.attempts.len(), 4);
        assert_eq!(plan.attempts[3], ProtocolVariant::HdlcFramed);
    }

    #[test]
    fn test_transitions() {
        let sent = HandshakeState::IdentitySent(ProtocolVariant::BinaryFramed);
        assert!(HandshakeState::Idle.can_transition_to(HandshakeState::PortOpened));
        assert!(sent.can_transition_to(HandshakeState::IdentityTimeout));
        assert!(!HandshakeState::Idle.can_transition_to(HandshakeState::Ready));
        assert!(HandshakeState::Ready.is_terminal());
    }
}
