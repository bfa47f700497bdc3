//! Authentication strategies.
//!
//! A strategy turns caller-supplied material into an [`AuthLevel`]. A
//! rejection never closes the session: it leaves the level at `Basic`, and
//! vendor-protected partitions then fail with `NotAuthorized`.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::chip::ChipIdentity;
use crate::error::{FlashError, Result};
use crate::link::DeviceLink;
use crate::protocol::constants::{
    AUTH_KIND_DIGEST, AUTH_KIND_SIGNATURE, AUTH_KIND_TOKEN, CMD_AUTH_CHALLENGE, CMD_SEND_AUTH,
};

/// Capability granted by authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AuthLevel {
    #[default]
    Basic,
    Vendor,
}

/// What a strategy needs from the caller before `supply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialRequest {
    None,
    /// A digest/signature pair made for this exact chip.
    DigestSignature { chip: String, serial: String },
    /// Hex request for an out-of-band signer.
    SignerRequest { request_hex: String },
}

/// Opaque credential blobs. Held only for the lifetime of a session.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    DigestSignature { digest: Vec<u8>, signature: Vec<u8> },
    Token(Vec<u8>),
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::DigestSignature { digest, signature } => write!(
                f,
                "DigestSignature({} + {} bytes)",
                digest.len(),
                signature.len()
            ),
            AuthMaterial::Token(t) => write!(f, "Token({} bytes)", t.len()),
        }
    }
}

/// What a strategy may touch while authenticating.
pub struct AuthContext<'a> {
    pub link: &'a mut DeviceLink,
    pub chip: &'a ChipIdentity,
    pub timeout: Duration,
}

impl AuthContext<'_> {
    fn rejected(&self, reason: impl Into<String>) -> FlashError {
        FlashError::AuthRejected {
            reason: reason.into(),
            context: self.link.context(),
        }
    }

    /// SEND_AUTH(kind, len, blob); status 0 means accepted.
    fn send(&mut self, kind: u8, blob: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(5 + blob.len());
        payload.push(kind);
        payload.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        payload.extend_from_slice(blob);
        let response = self.link.request_once(CMD_SEND_AUTH, &payload, self.timeout)?;
        if !response.is_ok() {
            return Err(self.rejected(format!("device status {}", response.status)));
        }
        Ok(())
    }
}

pub trait AuthStrategy: Send {
    fn name(&self) -> &'static str;

    /// Describe the material needed for the current chip.
    fn challenge(&mut self, ctx: &mut AuthContext<'_>) -> Result<MaterialRequest>;

    /// Present material. `Err(AuthRejected)` leaves the session usable.
    fn supply(&mut self, ctx: &mut AuthContext<'_>, material: AuthMaterial) -> Result<AuthLevel>;
}

/// Always accepted; grants `Basic`.
#[derive(Debug, Default)]
pub struct NoAuth;

impl AuthStrategy for NoAuth {
    fn name(&self) -> &'static str {
        "none"
    }

    fn challenge(&mut self, _ctx: &mut AuthContext<'_>) -> Result<MaterialRequest> {
        Ok(MaterialRequest::None)
    }

    fn supply(&mut self, _ctx: &mut AuthContext<'_>, _material: AuthMaterial) -> Result<AuthLevel> {
        Ok(AuthLevel::Basic)
    }
}

/// Caller-supplied digest + signature, bound to one chip.
///
/// Signatures are instance-specific, so material the device rejected is
/// remembered and never sent again.
#[derive(Debug, Default)]
pub struct DigestSignaturePair {
    bound_to: Option<(u16, [u8; 16])>,
    rejected: HashSet<u32>,
}

impl DigestSignaturePair {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(digest: &[u8], signature: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(digest.len() as u32).to_le_bytes());
        hasher.update(digest);
        hasher.update(signature);
        hasher.finalize()
    }
}

impl AuthStrategy for DigestSignaturePair {
    fn name(&self) -> &'static str {
        "digest-signature"
    }

    fn challenge(&mut self, ctx: &mut AuthContext<'_>) -> Result<MaterialRequest> {
        self.bound_to = Some((ctx.chip.hw_code, ctx.chip.serial));
        Ok(MaterialRequest::DigestSignature {
            chip: ctx.chip.to_string(),
            serial: ctx.chip.serial_hex(),
        })
    }

    fn supply(&mut self, ctx: &mut AuthContext<'_>, material: AuthMaterial) -> Result<AuthLevel> {
        let AuthMaterial::DigestSignature { digest, signature } = material else {
            return Err(ctx.rejected("expected a digest/signature pair"));
        };
        let chip = (ctx.chip.hw_code, ctx.chip.serial);
        match self.bound_to {
            Some(bound) if bound != chip => {
                return Err(ctx.rejected("material is bound to a different chip"));
            }
            _ => self.bound_to = Some(chip),
        }
        let fingerprint = Self::fingerprint(&digest, &signature);
        if self.rejected.contains(&fingerprint) {
            return Err(ctx.rejected("material was already rejected for this chip"));
        }

        let result = ctx
            .send(AUTH_KIND_DIGEST, &digest)
            .and_then(|_| ctx.send(AUTH_KIND_SIGNATURE, &signature));
        match result {
            Ok(()) => {
                info!(chip = %ctx.chip, "Digest/signature accepted");
                Ok(AuthLevel::Vendor)
            }
            Err(e @ FlashError::AuthRejected { .. }) => {
                warn!(chip = %ctx.chip, "Digest/signature rejected");
                self.rejected.insert(fingerprint);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Token signed out of band from a device-derived request.
#[derive(Debug, Default)]
pub struct CloudIssuedToken {
    pending: Option<Vec<u8>>,
}

impl CloudIssuedToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request bytes: hw_code, hw_sub_code (LE), serial, device nonce.
    pub fn request_bytes(chip: &ChipIdentity, nonce: &[u8]) -> Vec<u8> {
        let mut request = Vec::with_capacity(20 + nonce.len());
        request.extend_from_slice(&chip.hw_code.to_le_bytes());
        request.extend_from_slice(&chip.hw_sub_code.to_le_bytes());
        request.extend_from_slice(&chip.serial);
        request.extend_from_slice(nonce);
        request
    }
}

impl AuthStrategy for CloudIssuedToken {
    fn name(&self) -> &'static str {
        "cloud-token"
    }

    fn challenge(&mut self, ctx: &mut AuthContext<'_>) -> Result<MaterialRequest> {
        let nonce = ctx.link.transact(CMD_AUTH_CHALLENGE, &[], ctx.timeout)?;
        let request = Self::request_bytes(ctx.chip, &nonce);
        let request_hex = hex::encode_upper(&request);
        self.pending = Some(request);
        Ok(MaterialRequest::SignerRequest { request_hex })
    }

    fn supply(&mut self, ctx: &mut AuthContext<'_>, material: AuthMaterial) -> Result<AuthLevel> {
        let AuthMaterial::Token(token) = material else {
            return Err(ctx.rejected("expected a signer token"));
        };
        if self.pending.take().is_none() {
            return Err(ctx.rejected("no outstanding challenge"));
        }
        ctx.send(AUTH_KIND_TOKEN, &token)?;
        info!(chip = %ctx.chip, "Signer token accepted");
        Ok(AuthLevel::Vendor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{ChipFamily, ExecutionStage, ProtectionFlags};
    use crate::codec::{FrameCodec, ProtocolVariant};
    use crate::events::NullObserver;
    use crate::link::RetryPolicy;
    use crate::protocol::constants::STATUS_REJECTED;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    fn chip(serial: u8) -> ChipIdentity {
        ChipIdentity {
            hw_code: 0x0766,
            hw_sub_code: 0x8A00,
            hw_version: 0xCA00,
            sw_version: 1,
            family: ChipFamily::Generic,
            stage: ExecutionStage::Agent,
            protection: ProtectionFlags::default(),
            serial: [serial; 16],
        }
    }

    fn link(mock: &MockTransport) -> DeviceLink {
        DeviceLink::new(
            Box::new(mock.clone()),
            ProtocolVariant::BinaryFramed,
            Arc::new(NullObserver),
            RetryPolicy::default(),
        )
    }

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_rejected_pair_is_never_resent() {
        let mock = MockTransport::new();
        let codec = FrameCodec::for_variant(ProtocolVariant::BinaryFramed);
        mock.queue_response(&codec, CMD_SEND_AUTH, 0, &[]);
        mock.queue_response(&codec, CMD_SEND_AUTH, STATUS_REJECTED, &[]);
        let mut link = link(&mock);
        let chip = chip(1);
        let mut ctx = AuthContext {
            link: &mut link,
            chip: &chip,
            timeout: T,
        };
        let material = AuthMaterial::DigestSignature {
            digest: vec![1; 32],
            signature: vec![2; 64],
        };

        let mut strategy = DigestSignaturePair::new();
        assert!(matches!(
            strategy.supply(&mut ctx, material.clone()),
            Err(FlashError::AuthRejected { .. })
        ));
        assert_eq!(mock.get_writes().len(), 2);

        assert!(matches!(
            strategy.supply(&mut ctx, material),
            Err(FlashError::AuthRejected { .. })
        ));
        assert_eq!(mock.get_writes().len(), 2);
    }

    #[test]
    fn test_pair_bound_to_challenged_chip() {
        let mock = MockTransport::new();
        let mut link = link(&mock);
        let first = chip(1);
        let other = chip(2);
        let mut strategy = DigestSignaturePair::new();
        strategy
            .challenge(&mut AuthContext {
                link: &mut link,
                chip: &first,
                timeout: T,
            })
            .unwrap();
        let err = strategy
            .supply(
                &mut AuthContext {
                    link: &mut link,
                    chip: &other,
                    timeout: T,
                },
                AuthMaterial::DigestSignature {
                    digest: vec![],
                    signature: vec![],
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("different chip"));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_token_requires_outstanding_challenge() {
        let mock = MockTransport::new();
        let codec = FrameCodec::for_variant(ProtocolVariant::BinaryFramed);
        let mut link = link(&mock);
        let chip = chip(3);
        let mut strategy = CloudIssuedToken::new();

        let err = strategy
            .supply(
                &mut AuthContext {
                    link: &mut link,
                    chip: &chip,
                    timeout: T,
                },
                AuthMaterial::Token(vec![9; 8]),
            )
            .unwrap_err();
        assert!(matches!(err, FlashError::AuthRejected { .. }));

        mock.queue_response(&codec, CMD_AUTH_CHALLENGE, 0, &[0xA5; 8]);
        mock.queue_response(&codec, CMD_SEND_AUTH, 0, &[]);
        let mut ctx = AuthContext {
            link: &mut link,
            chip: &chip,
            timeout: T,
        };
        let MaterialRequest::SignerRequest { request_hex } = strategy.challenge(&mut ctx).unwrap()
        else {
            panic!("expected signer request");
        };
        assert_eq!(
            request_hex,
            hex::encode_upper(CloudIssuedToken::request_bytes(&chip, &[0xA5; 8]))
        );
        assert_eq!(
            strategy.supply(&mut ctx, AuthMaterial::Token(vec![1, 2])).unwrap(),
            AuthLevel::Vendor
        );
    }

    #[test]
    fn test_no_auth_is_basic() {
        let mock = MockTransport::new();
        let mut link = link(&mock);
        let chip = chip(0);
        let mut ctx = AuthContext {
            link: &mut link,
            chip: &chip,
            timeout: T,
        };
        assert_eq!(
            NoAuth.supply(&mut ctx, AuthMaterial::Token(vec![])).unwrap(),
            AuthLevel::Basic
        );
        assert_eq!(NoAuth.challenge(&mut ctx).unwrap(), MaterialRequest::None);
    }
}
