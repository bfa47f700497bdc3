//! Shared helpers for integration tests: fast session settings, a sparse
//! image encoder and observers that act on progress.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use bootlink_core::chip::ExecutionStage;
use bootlink_core::events::{FlashEvent, FlashObserver, NullObserver};
use bootlink_core::executor::CancelToken;
use bootlink_core::sparse::{CHUNK_DONT_CARE, CHUNK_FILL, CHUNK_HEADER_SIZE, CHUNK_RAW, SPARSE_HEADER_SIZE, SPARSE_MAGIC};
use bootlink_core::transport::{SimConfig, SimulatedDevice};
use bootlink_core::{AgentBundle, AgentImage, AgentStage, Session, SessionConfig};

/// Session settings with short timeouts so failure paths finish quickly.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        handshake_timeout_ms: 20,
        io_timeout_ms: 200,
        io_timeout_per_kib_ms: 0,
        erase_timeout_ms: 500,
        handoff_timeout_ms: 200,
        handoff_probe_ms: 10,
        baud_grace_ms: 60,
        block_size: 64 * 1024,
        ..Default::default()
    }
}

pub fn open(sim: &SimulatedDevice, config: SessionConfig) -> Session {
    open_observed(sim, config, Arc::new(NullObserver))
}

pub fn open_observed(
    sim: &SimulatedDevice,
    config: SessionConfig,
    observer: Arc<dyn FlashObserver>,
) -> Session {
    Session::open(Box::new(sim.clone()), config, observer).expect("handshake with simulator")
}

/// Simulator already running the agent, plus an open session on it.
pub fn agent_session(config: SimConfig) -> (SimulatedDevice, Session) {
    let sim = SimulatedDevice::new(SimConfig {
        stage: ExecutionStage::Agent,
        ..config
    });
    let session = open(&sim, fast_config());
    (sim, session)
}

pub fn agent_bundle(len: usize) -> AgentBundle {
    AgentBundle {
        first: AgentImage {
            data: (0..len).map(|i| (i * 7) as u8).collect(),
            address: 0x4000_0000,
            stage: AgentStage::First,
        },
        second: None,
        auth: None,
    }
}

/// Deterministic non-zero test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

/// Writer whose contents stay inspectable after it is moved into a batch.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Cancels the session once an operation reports progress past zero.
#[derive(Default)]
pub struct CancelOnProgress {
    token: Mutex<Option<CancelToken>>,
}

impl CancelOnProgress {
    pub fn arm(&self, token: CancelToken) {
        *self.token.lock().unwrap() = Some(token);
    }
}

impl FlashObserver for CancelOnProgress {
    fn on_event(&self, event: &FlashEvent) {
        if let FlashEvent::Progress { done, .. } = event
            && *done > 0
            && let Some(token) = self.token.lock().unwrap().as_ref()
        {
            token.cancel();
        }
    }
}

/// Records every event.
#[derive(Default)]
pub struct Recorder(Mutex<Vec<FlashEvent>>);

impl Recorder {
    pub fn events(&self) -> Vec<FlashEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl FlashObserver for Recorder {
    fn on_event(&self, event: &FlashEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

/// Sparse image encoder.
pub struct SparseImage {
    block_size: u32,
    blocks: u32,
    chunks: Vec<Vec<u8>>,
}

impl SparseImage {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            blocks: 0,
            chunks: Vec::new(),
        }
    }

    fn chunk(mut self, kind: u16, blocks: u32, body: &[u8]) -> Self {
        let mut c = Vec::with_capacity(CHUNK_HEADER_SIZE + body.len());
        c.extend_from_slice(&kind.to_le_bytes());
        c.extend_from_slice(&0u16.to_le_bytes());
        c.extend_from_slice(&blocks.to_le_bytes());
        c.extend_from_slice(&((CHUNK_HEADER_SIZE + body.len()) as u32).to_le_bytes());
        c.extend_from_slice(body);
        self.chunks.push(c);
        self.blocks += blocks;
        self
    }

    pub fn raw(self, data: &[u8]) -> Self {
        let blocks = data.len() as u32 / self.block_size;
        self.chunk(CHUNK_RAW, blocks, data)
    }

    pub fn fill(self, pattern: u32, blocks: u32) -> Self {
        self.chunk(CHUNK_FILL, blocks, &pattern.to_le_bytes())
    }

    pub fn dont_care(self, blocks: u32) -> Self {
        self.chunk(CHUNK_DONT_CARE, blocks, &[])
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SPARSE_MAGIC.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(SPARSE_HEADER_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(CHUNK_HEADER_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.blocks.to_le_bytes());
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for c in &self.chunks {
            out.extend_from_slice(c);
        }
        out
    }
}
