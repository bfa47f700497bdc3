//! Partition I/O through a session against the simulated device.

mod common;

use std::sync::Arc;

use bootlink_core::auth::{AuthMaterial, DigestSignaturePair, MaterialRequest};
use bootlink_core::codec::ProtocolVariant;
use bootlink_core::protocol::constants::{
    CMD_ERASE, CMD_READ, CMD_SEND_AUTH, CMD_STORAGE_INFO, CMD_WRITE,
};
use bootlink_core::transport::sim::sign;
use bootlink_core::transport::{SimConfig, SimPartition, SimulatedDevice};
use bootlink_core::{AuthLevel, ExecutionStage, FlashError, HandshakeState, SessionConfig, WriteSource};
use common::*;

#[test]
fn read_returns_partition_contents() {
    let (sim, mut session) = agent_session(SimConfig::default());
    let data = pattern(256 * 4096, 3);
    sim.fill(0, 256, &data);

    let mut out = Vec::new();
    let outcome = session.read("boot", None, &mut out, None).unwrap();
    assert!(!outcome.cancelled);
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(out, data);
    // 1 MiB in 64 KiB blocks
    assert_eq!(sim.count(CMD_READ), 16);
}

#[test]
fn read_limit_stops_early() {
    let (sim, mut session) = agent_session(SimConfig::default());
    sim.fill(0, 512, &pattern(8192, 9));

    let mut out = Vec::new();
    let outcome = session.read("system", None, &mut out, Some(5000)).unwrap();
    assert_eq!(outcome.bytes, 5000);
    assert_eq!(out, pattern(8192, 9)[..5000]);
}

#[test]
fn raw_write_pads_last_sector() {
    let (sim, mut session) = agent_session(SimConfig::default());
    let data = pattern(10_000, 5);

    let written = session
        .write("boot", None, WriteSource::from_bytes(data.clone()))
        .unwrap();
    assert_eq!(written, 10_000);

    let stored = sim.read_bytes(0, 256, 3 * 4096);
    assert_eq!(&stored[..10_000], &data[..]);
    assert!(stored[10_000..].iter().all(|&b| b == 0));
}

#[test]
fn oversized_source_is_rejected_before_io() {
    let (sim, mut session) = agent_session(SimConfig::default());
    let err = session
        .write("boot", None, WriteSource::from_bytes(vec![1u8; 256 * 4096 + 1]))
        .unwrap_err();
    assert!(matches!(err, FlashError::SizeMismatch { .. }));
    assert_eq!(sim.count(CMD_WRITE), 0);
    assert!(session.is_open());
}

#[test]
fn unknown_partition() {
    let (_sim, mut session) = agent_session(SimConfig::default());
    let err = session.erase("cache", None).unwrap_err();
    assert!(matches!(err, FlashError::UnknownPartition { name } if name == "cache"));
}

#[test]
fn protected_partition_needs_vendor_auth() {
    let (sim, mut session) = agent_session(SimConfig::default());

    let err = session
        .write("nvram", None, WriteSource::from_bytes(vec![0xAB; 4096]))
        .unwrap_err();
    assert!(matches!(err, FlashError::NotAuthorized { partition, .. } if partition == "nvram"));
    assert_eq!(sim.count(CMD_WRITE), 0);

    // The refusal leaves the session usable.
    let mut out = Vec::new();
    session.read("boot", None, &mut out, Some(4096)).unwrap();
    assert_eq!(out.len(), 4096);
}

#[test]
fn device_side_refusal_maps_to_not_authorized() {
    let sim = SimulatedDevice::new(SimConfig {
        stage: ExecutionStage::Agent,
        device_protected: vec!["userdata".into()],
        ..Default::default()
    });
    let mut session = open(&sim, fast_config());
    let err = session.erase("userdata", None).unwrap_err();
    assert!(matches!(err, FlashError::NotAuthorized { partition, .. } if partition == "userdata"));
    assert!(session.is_open());
}

#[test]
fn vendor_auth_unlocks_protected_partition() {
    let sim = SimulatedDevice::new(SimConfig {
        stage: ExecutionStage::Agent,
        device_protected: vec!["nvram".into()],
        ..Default::default()
    });
    let mut session = open(&sim, fast_config());
    assert_eq!(session.auth_level(), AuthLevel::Basic);

    let request = session
        .authenticate(Box::new(DigestSignaturePair::new()))
        .unwrap();
    assert!(matches!(request, MaterialRequest::DigestSignature { .. }));

    let digest = b"nvram-unlock".to_vec();
    let err = session
        .supply_auth(AuthMaterial::DigestSignature {
            digest: digest.clone(),
            signature: vec![0; 4],
        })
        .unwrap_err();
    assert!(matches!(err, FlashError::AuthRejected { .. }));
    assert_eq!(session.auth_level(), AuthLevel::Basic);
    assert!(session.is_open());

    let level = session
        .supply_auth(AuthMaterial::DigestSignature {
            signature: sign(&digest, b"sim-key"),
            digest,
        })
        .unwrap();
    assert_eq!(level, AuthLevel::Vendor);
    assert_eq!(session.auth_level(), AuthLevel::Vendor);

    session
        .write("nvram", None, WriteSource::from_bytes(vec![0xAB; 4096]))
        .unwrap();
    assert_eq!(sim.read_bytes(0, 2560, 4), vec![0xAB; 4]);
}

#[test]
fn unanswered_credentials_are_not_resent() {
    let (sim, mut session) = agent_session(SimConfig::default());
    session
        .authenticate(Box::new(DigestSignaturePair::new()))
        .unwrap();

    let digest = b"nvram-unlock".to_vec();
    sim.drop_next_responses(1);
    let err = session
        .supply_auth(AuthMaterial::DigestSignature {
            signature: sign(&digest, b"sim-key"),
            digest,
        })
        .unwrap_err();

    assert!(matches!(err, FlashError::Timeout { .. }));
    assert_eq!(sim.count(CMD_SEND_AUTH), 1);
    assert_eq!(session.auth_level(), AuthLevel::Basic);
    assert!(session.is_open());
}

#[test]
fn cancel_mid_read_reports_partial_bytes() {
    let sim = SimulatedDevice::new(SimConfig {
        stage: ExecutionStage::Agent,
        ..Default::default()
    });
    sim.fill(0, 256, &pattern(256 * 4096, 1));
    let observer = Arc::new(CancelOnProgress::default());
    let mut session = open_observed(&sim, fast_config(), observer.clone());
    observer.arm(session.cancel_token());

    let mut out = Vec::new();
    let outcome = session.read("boot", None, &mut out, None).unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.bytes, 64 * 1024);
    assert_eq!(out.len(), 64 * 1024);
    assert_eq!(sim.count(CMD_READ), 1);
    assert!(session.is_open());
}

#[test]
fn cancel_requested_before_read_stops_it_then_clears() {
    let (sim, mut session) = agent_session(SimConfig::default());
    session.cancel_token().cancel();

    let mut out = Vec::new();
    let outcome = session.read("boot", None, &mut out, Some(8192)).unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.bytes, 0);
    assert_eq!(sim.count(CMD_READ), 0);

    let outcome = session.read("boot", None, &mut out, Some(8192)).unwrap();
    assert!(!outcome.cancelled);
    assert_eq!(outcome.bytes, 8192);
}

#[test]
fn sparse_image_declaring_a_gigabyte_streams_only_data() {
    const GIB_BLOCKS: u32 = (1 << 30) / 4096;
    let sim = SimulatedDevice::new(SimConfig {
        stage: ExecutionStage::Agent,
        lun_sectors: vec![300_000],
        partitions: vec![SimPartition::new(0, "system", 512, 270_000)],
        ..Default::default()
    });
    let mut session = open(&sim, fast_config());

    let raw = pattern(4096, 7);
    let image = SparseImage::new(4096)
        .raw(&raw)
        .fill(0xDEAD_BEEF, 2)
        .dont_care(GIB_BLOCKS - 3)
        .build();
    assert!(image.len() < 4200);

    let written = session
        .write("system", None, WriteSource::from_bytes(image))
        .unwrap();
    assert_eq!(written, 1 << 30);

    let mut expected = raw;
    expected.extend(0xDEAD_BEEFu32.to_le_bytes().repeat(2 * 4096 / 4));
    assert_eq!(sim.read_bytes(0, 512, 3 * 4096), expected);
    assert_eq!(sim.stored_sectors(0), 3);
    assert_eq!(sim.bytes_written(), 3 * 4096);
    // Frames never exceed one configured block plus framing.
    assert!(sim.max_frame() <= 64 * 1024 + 64);
}

#[test]
fn sparse_dont_care_region_does_not_keep_stale_bytes() {
    let (sim, mut session) = agent_session(SimConfig::default());
    sim.fill(0, 513, &[0x5A; 4096]);

    let image = SparseImage::new(4096)
        .raw(&pattern(4096, 3))
        .dont_care(1)
        .build();
    session
        .write("system", None, WriteSource::from_bytes(image))
        .unwrap();

    assert_eq!(sim.read_bytes(0, 512, 4096), pattern(4096, 3));
    assert_eq!(sim.read_bytes(0, 513, 4096), vec![0u8; 4096]);
    assert_eq!(sim.count(CMD_ERASE), 1);
}

#[test]
fn hdlc_sparse_dont_care_region_is_zero_filled() {
    let sim = SimulatedDevice::new(SimConfig {
        variant: ProtocolVariant::HdlcFramed,
        agent_variant: ProtocolVariant::HdlcFramed,
        stage: ExecutionStage::Agent,
        sector_size: 512,
        ..Default::default()
    });
    sim.fill(0, 520, &[0x5A; 4096]);
    let mut session = open(
        &sim,
        SessionConfig {
            variant_hint: Some(ProtocolVariant::HdlcFramed),
            ..fast_config()
        },
    );

    let image = SparseImage::new(4096)
        .raw(&pattern(4096, 3))
        .dont_care(1)
        .build();
    session
        .write("system", None, WriteSource::from_bytes(image))
        .unwrap();

    assert_eq!(sim.read_bytes(0, 520, 4096), vec![0u8; 4096]);
    assert_eq!(sim.count(CMD_ERASE), 0);
}

#[test]
fn native_erase_clears_partition() {
    let (sim, mut session) = agent_session(SimConfig::default());
    sim.fill(0, 2624, &pattern(16 * 4096, 2));

    let erased = session.erase("userdata", None).unwrap();
    assert_eq!(erased, 1024 * 4096);
    assert_eq!(sim.count(CMD_ERASE), 1);
    assert_eq!(sim.stored_sectors(0), 0);
}

#[test]
fn hdlc_erase_falls_back_to_zero_writes() {
    let sim = SimulatedDevice::new(SimConfig {
        variant: ProtocolVariant::HdlcFramed,
        agent_variant: ProtocolVariant::HdlcFramed,
        stage: ExecutionStage::Agent,
        sector_size: 512,
        ..Default::default()
    });
    sim.fill(0, 2624, &pattern(8192, 4));
    let mut session = open(
        &sim,
        SessionConfig {
            variant_hint: Some(ProtocolVariant::HdlcFramed),
            ..fast_config()
        },
    );
    assert_eq!(session.variant(), ProtocolVariant::HdlcFramed);

    let erased = session.erase("userdata", None).unwrap();
    assert_eq!(erased, 1024 * 512);
    assert_eq!(sim.count(CMD_ERASE), 0);
    assert!(sim.count(CMD_WRITE) > 0);
    assert_eq!(sim.stored_sectors(0), 0);
}

#[test]
fn corrupted_response_is_retried() {
    let (sim, mut session) = agent_session(SimConfig {
        corrupt_responses: 1,
        ..Default::default()
    });
    let catalog = session.refresh_catalog().unwrap();
    assert_eq!(catalog.len(), 4);
    assert_eq!(sim.count(CMD_STORAGE_INFO), 2);
}

#[test]
fn persistent_corruption_is_bounded() {
    let (sim, mut session) = agent_session(SimConfig {
        corrupt_responses: 100,
        ..Default::default()
    });
    let err = session.refresh_catalog().unwrap_err();
    assert!(matches!(err, FlashError::ChecksumMismatch { .. }));
    // first attempt plus the configured resends
    assert_eq!(sim.count(CMD_STORAGE_INFO), 4);
    assert!(session.is_open());
}

#[test]
fn dropped_response_is_retried_after_timeout() {
    let (sim, mut session) = agent_session(SimConfig {
        drop_responses: 1,
        ..Default::default()
    });
    session.refresh_catalog().unwrap();
    assert_eq!(sim.count(CMD_STORAGE_INFO), 2);
}

#[test]
fn disconnect_invalidates_session() {
    let (sim, mut session) = agent_session(SimConfig::default());
    session.refresh_catalog().unwrap();
    sim.unplug();

    let mut out = Vec::new();
    let err = session.read("boot", None, &mut out, None).unwrap_err();
    assert!(matches!(err, FlashError::DeviceDisconnected { .. }));
    assert!(!session.is_open());
    assert!(session.catalog().is_none());
    assert_eq!(session.state(), HandshakeState::Idle);

    let err = session.read("boot", None, &mut out, None).unwrap_err();
    assert!(matches!(err, FlashError::SessionClosed));
}

#[test]
fn storage_commands_need_an_agent() {
    let sim = SimulatedDevice::new(SimConfig::default());
    let mut session = open(&sim, fast_config());
    assert_eq!(session.state(), HandshakeState::AgentRequired);

    let mut out = Vec::new();
    let err = session.read("boot", None, &mut out, None).unwrap_err();
    assert!(matches!(err, FlashError::NotReady { .. }));
    assert_eq!(sim.count(CMD_READ), 0);
}
