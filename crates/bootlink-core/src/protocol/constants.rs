//! Wire protocol constants shared by every codec variant.
//!
//! Command ids fit in 15 bits so that the response flag (`0x8000`) can be
//! OR-ed in and the result still fits the 16-bit id field of HdlcFramed.

// ============================================================================
// Device Identification
// ============================================================================

/// MediaTek-style boot ROM / preloader vendor id.
pub const MEDIATEK_VENDOR_ID: u16 = 0x0E8D;
/// Boot ROM product id.
pub const MEDIATEK_BROM_PID: u16 = 0x0003;
/// Preloader product id.
pub const MEDIATEK_PRELOADER_PID: u16 = 0x2000;

/// Unisoc-style boot ROM vendor id. Devices with this id speak HdlcFramed.
pub const UNISOC_VENDOR_ID: u16 = 0x1782;
/// Unisoc download mode product id.
pub const UNISOC_DOWNLOAD_PID: u16 = 0x4D00;

/// All supported (VID, PID) pairs for USB discovery.
pub const SUPPORTED_USB_IDS: &[(u16, u16)] = &[
    (MEDIATEK_VENDOR_ID, MEDIATEK_BROM_PID),
    (MEDIATEK_VENDOR_ID, MEDIATEK_PRELOADER_PID),
    (UNISOC_VENDOR_ID, UNISOC_DOWNLOAD_PID),
];

// ============================================================================
// Framing
// ============================================================================

/// BinaryFramed magic (little-endian on the wire).
pub const BINARY_MAGIC: u32 = 0xFEEE_EEEF;
/// BinaryFramed header: magic + command + length.
pub const BINARY_HEADER_SIZE: usize = 12;
/// BinaryFramed maximum payload.
pub const BINARY_MAX_PAYLOAD: usize = 1024 * 1024;

/// XmlCommand maximum payload (before hex expansion).
pub const XML_MAX_PAYLOAD: usize = 256 * 1024;

/// HDLC flag byte.
pub const HDLC_FLAG: u8 = 0x7E;
/// HDLC escape byte.
pub const HDLC_ESCAPE: u8 = 0x7D;
/// Value XOR-ed into an escaped byte.
pub const HDLC_ESCAPE_XOR: u8 = 0x20;
/// HdlcFramed maximum payload.
pub const HDLC_MAX_PAYLOAD: usize = 0x3000;
/// Default HdlcFramed baud sequence (boot ROM rate first).
pub const HDLC_BAUD_SEQUENCE: &[u32] = &[115_200, 921_600];

/// OR-ed into a request id to form the matching response id.
pub const RESPONSE_FLAG: u32 = 0x8000;

// ============================================================================
// Commands (Host -> Device)
// ============================================================================

pub const CMD_IDENTIFY: u32 = 0x0001;
pub const CMD_PING: u32 = 0x0002;
pub const CMD_AUTH_CHALLENGE: u32 = 0x0003;
pub const CMD_SEND_AUTH: u32 = 0x0004;
pub const CMD_EXPLOIT: u32 = 0x0005;

pub const CMD_UPLOAD_BEGIN: u32 = 0x0010;
pub const CMD_UPLOAD_DATA: u32 = 0x0011;
pub const CMD_UPLOAD_END: u32 = 0x0012;
pub const CMD_JUMP: u32 = 0x0013;

pub const CMD_STORAGE_INFO: u32 = 0x0020;
pub const CMD_GET_TABLE: u32 = 0x0021;

pub const CMD_READ: u32 = 0x0030;
pub const CMD_WRITE: u32 = 0x0031;
pub const CMD_ERASE: u32 = 0x0032;
pub const CMD_PATCH: u32 = 0x0033;
pub const CMD_SET_BOOT_LUN: u32 = 0x0034;

pub const CMD_BAUD_SWITCH: u32 = 0x0040;
pub const CMD_RESET: u32 = 0x0050;

/// Header bytes preceding sector data in READ/WRITE/ERASE requests:
/// lun (u32) + start sector (u64) + sector count (u32).
pub const SECTOR_REQUEST_HEADER: usize = 16;

// ============================================================================
// Response status codes
// ============================================================================

pub const STATUS_OK: u32 = 0;
pub const STATUS_REJECTED: u32 = 1;
pub const STATUS_NOT_AUTHORIZED: u32 = 2;
pub const STATUS_INVALID_ARGUMENT: u32 = 3;
pub const STATUS_UNSUPPORTED: u32 = 4;
pub const STATUS_OUT_OF_RANGE: u32 = 5;

// ============================================================================
// Identity flags
// ============================================================================

pub const FLAG_SECURE_BOOT: u32 = 1 << 0;
pub const FLAG_AUTH_REQUIRED: u32 = 1 << 1;
pub const FLAG_REJECTS_UNSIGNED_AGENT: u32 = 1 << 2;
pub const FLAG_CHECKSUM_SUPPORTED: u32 = 1 << 3;

// ============================================================================
// Acknowledgement codes (Device -> Host)
// ============================================================================

/// Exploit succeeded and signature verification is disabled.
pub const ACK_BYPASSED: u32 = 0x4259_5053; // 'BYPS'
/// Exploit succeeded but only produced a diagnostic dump.
pub const ACK_DIAG_DUMP: u32 = 0x4455_4D50; // 'DUMP'
/// First-stage agent ready.
pub const ACK_READY_FIRST: u32 = 0x5244_5931; // 'RDY1'
/// Second-stage agent ready.
pub const ACK_READY_SECOND: u32 = 0x5244_5932; // 'RDY2'
/// Generic error ack prefix, e.g. 'ER01'.
pub const ACK_ERROR_01: u32 = 0x4552_3031; // 'ER01'

// ============================================================================
// Auth kinds (first byte of SEND_AUTH payload)
// ============================================================================

pub const AUTH_KIND_DIGEST: u8 = 1;
pub const AUTH_KIND_SIGNATURE: u8 = 2;
pub const AUTH_KIND_TOKEN: u8 = 3;

/// Returns the mnemonic used for a command id in XmlCommand frames and logs.
pub fn command_name(id: u32) -> Option<&'static str> {
    let name = match id & !RESPONSE_FLAG {
        CMD_IDENTIFY => "identify",
        CMD_PING => "nop",
        CMD_AUTH_CHALLENGE => "challenge",
        CMD_SEND_AUTH => "auth",
        CMD_EXPLOIT => "payload",
        CMD_UPLOAD_BEGIN => "uploadbegin",
        CMD_UPLOAD_DATA => "uploaddata",
        CMD_UPLOAD_END => "uploadend",
        CMD_JUMP => "jump",
        CMD_STORAGE_INFO => "getstorageinfo",
        CMD_GET_TABLE => "gettable",
        CMD_READ => "read",
        CMD_WRITE => "program",
        CMD_ERASE => "erase",
        CMD_PATCH => "patch",
        CMD_SET_BOOT_LUN => "setbootablestoragedrive",
        CMD_BAUD_SWITCH => "setbaud",
        CMD_RESET => "power",
        _ => return None,
    };
    Some(name)
}

/// Reverse of [`command_name`] for request ids.
pub fn command_id(name: &str) -> Option<u32> {
    const ALL: &[u32] = &[
        CMD_IDENTIFY,
        CMD_PING,
        CMD_AUTH_CHALLENGE,
        CMD_SEND_AUTH,
        CMD_EXPLOIT,
        CMD_UPLOAD_BEGIN,
        CMD_UPLOAD_DATA,
        CMD_UPLOAD_END,
        CMD_JUMP,
        CMD_STORAGE_INFO,
        CMD_GET_TABLE,
        CMD_READ,
        CMD_WRITE,
        CMD_ERASE,
        CMD_PATCH,
        CMD_SET_BOOT_LUN,
        CMD_BAUD_SWITCH,
        CMD_RESET,
    ];
    ALL.iter()
        .copied()
        .find(|&id| command_name(id) == Some(name))
}
