//! From boot ROM to a ready agent: exploits, boot authentication, handoff,
//! baud switching and background execution.

mod common;

use std::sync::{Arc, mpsc};

use bootlink_core::agent::{AgentImage, AgentStage, ExploitDescriptor, ExploitKind, ExploitTable};
use bootlink_core::auth::{AuthMaterial, DigestSignaturePair};
use bootlink_core::protocol::constants::{
    ACK_BYPASSED, ACK_DIAG_DUMP, CMD_BAUD_SWITCH, CMD_JUMP, CMD_UPLOAD_BEGIN,
    FLAG_REJECTS_UNSIGNED_AGENT,
};
use bootlink_core::repository::{DirectoryRepository, INDEX_FILE};
use bootlink_core::transport::sim::sign;
use bootlink_core::transport::{SimConfig, SimulatedDevice};
use bootlink_core::{AuthLevel, ExecutionStage, FlashError, HandshakeState, SessionHandle};
use common::*;

fn signed_boot_sim(exploit_ack: Option<u32>) -> SimulatedDevice {
    SimulatedDevice::new(SimConfig {
        boot_flags: FLAG_REJECTS_UNSIGNED_AGENT,
        exploit_ack,
        ..Default::default()
    })
}

fn bypass_table() -> Arc<ExploitTable> {
    Arc::new(ExploitTable::new([ExploitDescriptor {
        name: "brom-bypass".into(),
        hw_code: 0x0766,
        target_stage: ExecutionStage::BootRom,
        kind: ExploitKind::Bypass,
        payload: vec![0x13, 0x37],
    }]))
}

#[test]
fn boot_rom_to_ready_agent() {
    let sim = SimulatedDevice::new(SimConfig::default());
    let mut session = open(&sim, fast_config());
    assert_eq!(session.state(), HandshakeState::AgentRequired);
    assert_eq!(session.identity().stage, ExecutionStage::BootRom);

    session.load_agent(agent_bundle(5000)).unwrap();
    assert_eq!(session.state(), HandshakeState::Ready);
    assert_eq!(session.identity().stage, ExecutionStage::Agent);
    assert_eq!(sim.uploaded()[0].data, agent_bundle(5000).first.data);

    let mut out = Vec::new();
    session.read("boot", None, &mut out, Some(4096)).unwrap();
    assert_eq!(out.len(), 4096);

    // Loading again is a no-op once the agent runs.
    session.load_agent(agent_bundle(16)).unwrap();
    assert_eq!(sim.uploaded().len(), 1);
}

#[test]
fn second_stage_is_uploaded_when_needed() {
    let sim = SimulatedDevice::new(SimConfig {
        requires_second_stage: true,
        ..Default::default()
    });
    let mut session = open(&sim, fast_config());
    let mut bundle = agent_bundle(1024);
    bundle.second = Some(AgentImage {
        data: pattern(3000, 5),
        address: 0x5000_0000,
        stage: AgentStage::Second,
    });

    session.load_agent(bundle).unwrap();
    let uploaded = sim.uploaded();
    assert_eq!(uploaded.len(), 2);
    assert_eq!(uploaded[1].stage, 2);
    assert_eq!(sim.stage(), ExecutionStage::Agent);
}

#[test]
fn second_image_is_chained_even_when_first_reports_agent() {
    let sim = SimulatedDevice::new(SimConfig::default());
    let mut session = open(&sim, fast_config());
    let mut bundle = agent_bundle(1024);
    bundle.second = Some(AgentImage {
        data: pattern(2500, 9),
        address: 0x5000_0000,
        stage: AgentStage::Second,
    });

    session.load_agent(bundle).unwrap();
    assert_eq!(session.state(), HandshakeState::Ready);
    let uploaded = sim.uploaded();
    assert_eq!(uploaded.len(), 2);
    assert_eq!(uploaded[1].stage, 2);
    assert_eq!(uploaded[1].data, pattern(2500, 9));
    assert_eq!(sim.count(CMD_JUMP), 2);
}

#[test]
fn missing_second_stage_is_reported() {
    let sim = SimulatedDevice::new(SimConfig {
        requires_second_stage: true,
        ..Default::default()
    });
    let mut session = open(&sim, fast_config());
    let err = session.load_agent(agent_bundle(1024)).unwrap_err();
    assert!(matches!(err, FlashError::InvalidImage(_)));
}

#[test]
fn signed_chip_without_credentials_fails_fast() {
    let sim = signed_boot_sim(None);
    let mut session = open(&sim, fast_config());
    let err = session.load_agent(agent_bundle(64)).unwrap_err();
    assert!(matches!(err, FlashError::SignatureRequired { .. }));
    assert_eq!(sim.count(CMD_UPLOAD_BEGIN), 0);
}

#[test]
fn exploit_with_wrong_ack_is_a_failure() {
    let sim = signed_boot_sim(Some(ACK_DIAG_DUMP));
    let mut session = open(&sim, fast_config()).with_exploits(bypass_table());
    let err = session.load_agent(agent_bundle(64)).unwrap_err();
    match err {
        FlashError::ExploitFailed { name, ack, .. } => {
            assert_eq!(name, "brom-bypass");
            assert_eq!(ack, "DUMP");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sim.count(CMD_UPLOAD_BEGIN), 0);
    assert!(session.is_open());
}

#[test]
fn bypass_exploit_allows_unsigned_agent() {
    let sim = signed_boot_sim(Some(ACK_BYPASSED));
    let mut session = open(&sim, fast_config()).with_exploits(bypass_table());
    session.load_agent(agent_bundle(64)).unwrap();
    assert!(sim.is_bypassed());
    assert_eq!(session.state(), HandshakeState::Ready);
}

#[test]
fn bundled_credential_unlocks_signed_chip() {
    let sim = signed_boot_sim(None);
    let mut session = open(&sim, fast_config());
    let digest = b"agent-digest".to_vec();
    let mut bundle = agent_bundle(64);
    bundle.auth = Some(AuthMaterial::DigestSignature {
        signature: sign(&digest, b"sim-key"),
        digest,
    });

    session.load_agent(bundle).unwrap();
    assert_eq!(session.state(), HandshakeState::Ready);
}

#[test]
fn boot_rom_authentication_before_upload() {
    let sim = signed_boot_sim(None);
    let mut session = open(&sim, fast_config());

    session
        .authenticate(Box::new(DigestSignaturePair::new()))
        .unwrap();
    let digest = b"boot-digest".to_vec();
    session
        .supply_auth(AuthMaterial::DigestSignature {
            signature: sign(&digest, b"sim-key"),
            digest,
        })
        .unwrap();
    // Boot ROM authorization does not carry over to the agent.
    assert_eq!(session.auth_level(), AuthLevel::Basic);

    session.load_agent(agent_bundle(64)).unwrap();
    assert_eq!(session.state(), HandshakeState::Ready);
}

#[test]
fn hung_agent_invalidates_session() {
    let sim = SimulatedDevice::new(SimConfig {
        hang_after_jump: true,
        ..Default::default()
    });
    let mut session = open(&sim, fast_config());
    let err = session.load_agent(agent_bundle(64)).unwrap_err();
    assert!(matches!(err, FlashError::HandoffTimeout { .. }));
    assert!(!session.is_open());
}

#[test]
fn agent_from_directory_repository() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("agent.bin"), pattern(2048, 1)).unwrap();
    std::fs::write(
        dir.path().join(INDEX_FILE),
        "[[loader]]\nhw_code = 0x0766\nfirst = \"agent.bin\"\nfirst_address = 0x40000000\n",
    )
    .unwrap();
    let repo = DirectoryRepository::open(dir.path()).unwrap();

    let sim = SimulatedDevice::new(SimConfig::default());
    let mut session = open(&sim, fast_config());
    session.load_agent_from(&repo).unwrap();
    assert_eq!(sim.uploaded()[0].data, pattern(2048, 1));
    assert_eq!(sim.uploaded()[0].address, 0x4000_0000);
}

#[test]
fn baud_switch_follows_device() {
    let (sim, mut session) = agent_session(SimConfig::default());
    session.switch_baud(921_600).unwrap();
    assert_eq!(session.state(), HandshakeState::Ready);
    assert_eq!(sim.count(CMD_BAUD_SWITCH), 1);
    session.refresh_catalog().unwrap();
}

#[test]
fn baud_switch_without_answer_desynchronizes() {
    let (_sim, mut session) = agent_session(SimConfig {
        follows_baud: false,
        ..Default::default()
    });
    let err = session.switch_baud(921_600).unwrap_err();
    assert!(matches!(err, FlashError::Desynchronized { baud: 921_600, .. }));
    assert_eq!(session.state(), HandshakeState::Idle);

    let mut out = Vec::new();
    let err = session.read("boot", None, &mut out, None).unwrap_err();
    assert!(matches!(err, FlashError::NotReady { .. }));
}

#[test]
fn worker_rejects_concurrent_operations() {
    let (_sim, session) = agent_session(SimConfig::default());
    let handle = SessionHandle::new(session);
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let worker = handle
        .spawn("hold", move |session| {
            started_tx.send(()).ok();
            release_rx.recv().ok();
            Ok(session.identity().hw_code)
        })
        .unwrap();
    started_rx.recv().unwrap();

    assert!(handle.is_busy());
    assert!(matches!(handle.spawn("second", |_| Ok(())), Err(FlashError::Busy)));
    assert!(matches!(handle.with_session(|s| s.state()), Err(FlashError::Busy)));

    release_tx.send(()).unwrap();
    assert_eq!(worker.join().unwrap().unwrap(), 0x0766);
    assert!(!handle.is_busy());
    assert_eq!(handle.with_session(|s| s.state()).unwrap(), HandshakeState::Ready);
}
