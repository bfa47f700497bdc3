//! Chip identity as reported by IDENTIFY.

use std::fmt;

use crate::protocol::IdentityHeader;
use crate::protocol::constants::{
    FLAG_AUTH_REQUIRED, FLAG_CHECKSUM_SUPPORTED, FLAG_REJECTS_UNSIGNED_AGENT, FLAG_SECURE_BOOT,
    MEDIATEK_VENDOR_ID, UNISOC_VENDOR_ID,
};

/// Which code is currently executing on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    BootRom,
    FirstStage,
    Agent,
}

impl ExecutionStage {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ExecutionStage::BootRom),
            1 => Some(ExecutionStage::FirstStage),
            2 => Some(ExecutionStage::Agent),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ExecutionStage::BootRom => 0,
            ExecutionStage::FirstStage => 1,
            ExecutionStage::Agent => 2,
        }
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStage::BootRom => write!(f, "boot-rom"),
            ExecutionStage::FirstStage => write!(f, "first-stage"),
            ExecutionStage::Agent => write!(f, "agent"),
        }
    }
}

/// Protection state decoded from the identity flags word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectionFlags {
    pub secure_boot: bool,
    pub auth_required: bool,
    pub rejects_unsigned_agent: bool,
    pub checksum_supported: bool,
    pub anti_rollback: u32,
}

impl ProtectionFlags {
    pub fn from_bits(flags: u32, anti_rollback: u32) -> Self {
        Self {
            secure_boot: flags & FLAG_SECURE_BOOT != 0,
            auth_required: flags & FLAG_AUTH_REQUIRED != 0,
            rejects_unsigned_agent: flags & FLAG_REJECTS_UNSIGNED_AGENT != 0,
            checksum_supported: flags & FLAG_CHECKSUM_SUPPORTED != 0,
            anti_rollback,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut flags = 0;
        if self.secure_boot {
            flags |= FLAG_SECURE_BOOT;
        }
        if self.auth_required {
            flags |= FLAG_AUTH_REQUIRED;
        }
        if self.rejects_unsigned_agent {
            flags |= FLAG_REJECTS_UNSIGNED_AGENT;
        }
        if self.checksum_supported {
            flags |= FLAG_CHECKSUM_SUPPORTED;
        }
        flags
    }
}

/// Boot ROM family, derived from USB enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    MediaTekLike,
    /// Speaks HdlcFramed from the first byte.
    UnisocLike,
    Generic,
}

impl ChipFamily {
    pub fn from_usb_ids(ids: Option<(u16, u16)>) -> Self {
        match ids {
            Some((MEDIATEK_VENDOR_ID, _)) => ChipFamily::MediaTekLike,
            Some((UNISOC_VENDOR_ID, _)) => ChipFamily::UnisocLike,
            _ => ChipFamily::Generic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipIdentity {
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub family: ChipFamily,
    pub stage: ExecutionStage,
    pub protection: ProtectionFlags,
    pub serial: [u8; 16],
}

impl ChipIdentity {
    /// Build from a parsed IDENTIFY body. Unknown stage bytes yield `None`.
    pub fn from_header(header: &IdentityHeader, family: ChipFamily) -> Option<Self> {
        Some(Self {
            hw_code: header.hw_code,
            hw_sub_code: header.hw_sub_code,
            hw_version: header.hw_version,
            sw_version: header.sw_version,
            family,
            stage: ExecutionStage::from_u8(header.stage)?,
            protection: ProtectionFlags::from_bits(header.flags, header.anti_rollback),
            serial: header.serial,
        })
    }

    pub fn to_header(&self) -> IdentityHeader {
        IdentityHeader {
            hw_code: self.hw_code,
            hw_sub_code: self.hw_sub_code,
            hw_version: self.hw_version,
            sw_version: self.sw_version,
            flags: self.protection.bits(),
            anti_rollback: self.protection.anti_rollback,
            stage: self.stage.as_u8(),
            serial: self.serial,
        }
    }

    pub fn serial_hex(&self) -> String {
        hex::encode_upper(self.serial)
    }

    /// Whether an agent upload needs a credential or a bypass first.
    pub fn needs_signed_agent(&self) -> bool {
        self.stage == ExecutionStage::BootRom && self.protection.rejects_unsigned_agent
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hw {:04X}/{:04X} v{:04X} sw {:04X} ({})",
            self.hw_code, self.hw_sub_code, self.hw_version, self.sw_version, self.stage
        )
    }
}
