//! bootlink - flash devices through their boot ROM and a download agent.

mod cli;

use anyhow::{Context, bail};
use bootlink_core::auth::{AuthMaterial, DigestSignaturePair};
use bootlink_core::firmware::{FirmwareImageReader, ManifestImageReader};
use bootlink_core::{
    DirectoryRepository, ExploitTable, HandshakeState, OperationOutcome, Session, SessionConfig,
    WriteSource,
};
use clap::Parser;
use cli::{Cli, Commands};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a tracing subscriber was already installed");
    }

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if cli.port.is_some() {
        config.port = cli.port.clone();
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    Ok(config)
}

/// Open the device and bring it to the state `command` needs.
fn connect(cli: &Cli, config: SessionConfig) -> anyhow::Result<Session> {
    let serial = config.port.is_some();
    let mut session = Session::open_configured(config)?;
    info!(chip = %session.identity(), variant = %session.variant(), "Connected");

    if let Some(path) = &cli.exploits {
        let table = ExploitTable::load_from_file(path)?;
        info!(exploits = table.len(), "Exploit table loaded");
        session = session.with_exploits(Arc::new(table));
    }

    if !cli.command.needs_agent() {
        return Ok(session);
    }

    if session.state() == HandshakeState::AgentRequired {
        let Some(dir) = &cli.loaders else {
            bail!("device is at {}, --loaders is required to start the agent", session.identity().stage);
        };
        let repo = DirectoryRepository::open(dir)?;
        session.load_agent_from(&repo)?;
    }

    if serial {
        session.apply_baud_sequence()?;
    }

    if let (Some(digest), Some(signature)) = (&cli.auth_digest, &cli.auth_signature) {
        session.authenticate(Box::new(DigestSignaturePair::new()))?;
        let material = AuthMaterial::DigestSignature {
            digest: std::fs::read(digest)
                .with_context(|| format!("reading {}", digest.display()))?,
            signature: std::fs::read(signature)
                .with_context(|| format!("reading {}", signature.display()))?,
        };
        let level = session.supply_auth(material)?;
        info!(?level, "Authorized");
    }
    Ok(session)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    if let Commands::InitConfig { output } = &cli.command {
        config.save_to_file(output)?;
        println!("Wrote {}", output.display());
        return Ok(());
    }

    let mut session = connect(&cli, config)?;

    match &cli.command {
        Commands::Probe => {
            let id = session.identity();
            println!("Chip:        {}", id);
            println!("HW code:     {:04X} (sub {:04X})", id.hw_code, id.hw_sub_code);
            println!("Versions:    hw {:04X} sw {:04X}", id.hw_version, id.sw_version);
            println!("Serial:      {}", id.serial_hex());
            println!("Stage:       {}", id.stage);
            println!("Family:      {:?}", id.family);
            println!("Protection:  {:?}", id.protection);
            println!("Variant:     {}", session.variant());
            println!("State:       {}", session.state());
        }
        Commands::PrintTable => {
            let catalog = session.refresh_catalog()?;
            println!("{:<4} {:<20} {:>12} {:>12} {:>14}", "LUN", "Name", "Start", "Sectors", "Bytes");
            for p in catalog.iter() {
                println!(
                    "{:<4} {:<20} {:>12} {:>12} {:>14}",
                    p.lun,
                    p.name,
                    p.start_sector,
                    p.sector_count,
                    p.capacity()
                );
            }
            println!("Sector size {} bytes, boot LUN {}", catalog.sector_size(), catalog.boot_lun());
        }
        Commands::Read {
            partition,
            output,
            lun,
            length,
        } => {
            let file = File::create(output)
                .with_context(|| format!("creating {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            let outcome = session.read(partition, *lun, &mut writer, *length)?;
            writer.flush()?;
            if outcome.cancelled {
                warn!(bytes = outcome.bytes, "Read cancelled");
            }
            println!("Read {} bytes from '{}' to {}", outcome.bytes, partition, output.display());
        }
        Commands::Write {
            partition,
            input,
            lun,
        } => {
            let source = WriteSource::from_file(input)?;
            let bytes = session.write(partition, *lun, source)?;
            println!("Wrote {} bytes to '{}'", bytes, partition);
        }
        Commands::Erase { partition, lun } => {
            let bytes = session.erase(partition, *lun)?;
            println!("Erased {} bytes of '{}'", bytes, partition);
        }
        Commands::Flash {
            manifest,
            manifest_layout,
        } => {
            let reader = ManifestImageReader::load_from_file(manifest)?;
            let entries = reader.entries()?;
            if *manifest_layout {
                let sector_size = match (reader.sector_size, session.storage_info()) {
                    (Some(ss), _) => ss,
                    (None, Some(info)) => info.sector_size,
                    (None, None) => session.refresh_catalog()?.sector_size(),
                };
                session.import_catalog(&entries, sector_size, reader.boot_lun.unwrap_or(0))?;
            }
            let operations = entries
                .iter()
                .map(|e| e.to_operation())
                .collect::<Result<Vec<_>, _>>()?;
            let report = session.batch(operations, reader.patches())?;

            for entry in &report.entries {
                match &entry.outcome {
                    OperationOutcome::Completed { bytes } => {
                        println!("  ok      {:<5} {}:{} ({} bytes)", entry.operation, entry.lun, entry.partition, bytes)
                    }
                    OperationOutcome::Failed { error } => {
                        println!("  FAILED  {:<5} {}:{}: {}", entry.operation, entry.lun, entry.partition, error)
                    }
                    OperationOutcome::Skipped => {
                        println!("  skipped {:<5} {}:{}", entry.operation, entry.lun, entry.partition)
                    }
                }
            }
            for patch in &report.skipped_patches {
                println!("  patch for '{}' skipped", patch.partition);
            }
            if let Some(lun) = report.boot_lun_activated {
                println!("Boot LUN set to {}", lun);
            }
            if let Some(failure) = report.first_failure() {
                bail!("flashing stopped at '{}'", failure.partition);
            }
            if let Some(error) = &report.boot_lun_error {
                bail!("images written but the boot LUN was not activated: {}", error);
            }
        }
        Commands::Reset => {
            session.reset()?;
            println!("Device reset");
        }
        Commands::InitConfig { .. } => {}
    }

    session.close();
    Ok(())
}
