//! Bootlink-Core: boot ROM and download-agent flashing protocol engine.
//!
//! This crate talks to a device sitting in its boot ROM, uploads a
//! download agent and then reads, writes, erases and patches partitions
//! through it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: serial, USB and in-memory byte channels
//! - **Codec**: BinaryFramed, XmlCommand and HdlcFramed wire variants
//! - **Link**: request/response exchange with checksum and timeout retries
//! - **Handshake**: identification and variant negotiation
//! - **Agent**: exploit, boot authentication, upload and handoff
//! - **Auth**: pluggable strategies granting a capability level
//! - **Partition**: GPT parsing and the per-LUN partition catalog
//! - **Executor**: block I/O, sparse writes, batches and patches
//! - **Session**: the orchestrator owning one device connection
//! - **Events**: observer pattern for front-end decoupling
//!
//! # Example
//!
//! ```no_run
//! use bootlink_core::session::{Session, SessionConfig};
//! use bootlink_core::repository::DirectoryRepository;
//!
//! let config = SessionConfig {
//!     port: Some("/dev/ttyUSB0".to_string()),
//!     ..Default::default()
//! };
//!
//! let repo = DirectoryRepository::open("loaders").expect("no loader repository");
//! let mut session = Session::open_configured(config).expect("handshake failed");
//! session.load_agent_from(&repo).expect("agent failed");
//! let mut out = std::fs::File::create("boot.img").unwrap();
//! session.read("boot", None, &mut out, None).expect("read failed");
//! ```

pub mod agent;
pub mod auth;
pub mod chip;
pub mod codec;
pub mod error;
pub mod events;
pub mod executor;
pub mod firmware;
pub mod handshake;
pub mod link;
pub mod partition;
pub mod protocol;
pub mod repository;
pub mod session;
pub mod sparse;
pub mod transport;
pub mod worker;

// Re-exports for convenience
pub use agent::{AgentBundle, AgentImage, AgentStage, ExploitDescriptor, ExploitKind, ExploitTable};
pub use auth::{AuthLevel, AuthMaterial, AuthStrategy, CloudIssuedToken, DigestSignaturePair, MaterialRequest, NoAuth};
pub use chip::{ChipFamily, ChipIdentity, ExecutionStage, ProtectionFlags};
pub use codec::ProtocolVariant;
pub use error::{ErrorContext, FlashError, Result};
pub use events::{ChannelObserver, FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver, TracingObserver};
pub use executor::{BatchReport, CancelToken, Operation, OperationOutcome, Patch, WriteSource};
pub use firmware::{FirmwareImageReader, ImageEntry, ManifestImageReader};
pub use handshake::HandshakeState;
pub use partition::{Partition, PartitionCatalog};
pub use repository::{DirectoryRepository, LoaderRepository};
pub use session::{Session, SessionConfig};
pub use transport::{MockTransport, NusbTransport, SerialTransport, SimConfig, SimulatedDevice, Transport, TransportError};
pub use worker::SessionHandle;
