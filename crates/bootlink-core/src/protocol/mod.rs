//! Protocol module - command ids, acknowledgement codes, body layouts.

pub mod ack;
pub mod constants;
pub mod header;

use std::fmt;

pub use ack::AckCode;
pub use constants::*;
pub use header::{
    HeaderError, IdentityHeader, PatchRequest, SectorRequest, StorageInfo, UploadHeader,
    split_status, with_status,
};

/// Command id wrapper used for diagnostics ("last command" in errors).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode(pub u32);

impl CommandCode {
    pub fn response(self) -> Self {
        Self(self.0 | RESPONSE_FLAG)
    }

    pub fn is_response(self) -> bool {
        self.0 & RESPONSE_FLAG != 0
    }
}

impl fmt::Debug for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match command_name(self.0) {
            Some(name) if self.is_response() => write!(f, "{name}-response(0x{:04X})", self.0),
            Some(name) => write!(f, "{name}(0x{:04X})", self.0),
            None => write!(f, "0x{:04X}", self.0),
        }
    }
}
