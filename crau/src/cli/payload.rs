// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufReader, BufWriter, Seek},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{
    crypto::{self, PassphraseSource},
    format::{
        payload::PayloadReader,
        properties::PayloadProperties,
        signature,
        text::Text,
    },
    update::{
        generator::{self, Generator},
        updater::Updater,
    },
    util,
};

fn load_public_key(group: &PublicKeyGroup) -> Result<RsaPublicKey> {
    if let Some(path) = &group.public_key {
        crypto::read_pem_public_key_file(path)
            .with_context(|| format!("Failed to load public key: {path:?}"))
    } else {
        warn!("Verifying with the embedded developer public key");

        signature::dev_public_key().context("Failed to load developer public key")
    }
}

fn load_private_key(group: &PrivateKeyGroup) -> Result<RsaPrivateKey> {
    if let Some(path) = &group.key {
        let source = PassphraseSource::new(
            path,
            group.pass_file.as_deref(),
            group.pass_env_var.as_deref(),
        );

        crypto::read_pem_key_file(path, &source)
            .with_context(|| format!("Failed to load key: {path:?}"))
    } else {
        warn!("Signing with the embedded developer key");

        signature::dev_signing_key().context("Failed to load developer key")
    }
}

fn open_payload(path: &Path) -> Result<PayloadReader<BufReader<File>>> {
    info!("Loading payload from {path:?}");

    let file = File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;

    PayloadReader::new(BufReader::new(file))
        .with_context(|| format!("Failed to read payload header: {path:?}"))
}

fn temp_file_next_to(path: &Path) -> Result<NamedTempFile> {
    let parent = util::parent_path(path);

    NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in: {parent:?}"))
}

pub fn apply_main(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let public_key = load_public_key(&cli.public_key)?;

    // The destination is only published once every check has passed.
    let temp_file = temp_file_next_to(&cli.output)?;

    let updater = Updater {
        src_partition: cli.source.clone(),
        dst_partition: temp_file.path().to_owned(),
        public_key,
    };

    let mut payload = updater
        .open_payload(&cli.payload)
        .with_context(|| format!("Failed to load payload: {:?}", cli.payload))?;

    updater
        .run(&mut payload, cancel_signal)
        .with_context(|| format!("Failed to apply payload: {:?}", cli.payload))?;

    temp_file
        .persist(&cli.output)
        .with_context(|| format!("Failed to move temporary file to: {:?}", cli.output))?;

    info!("Successfully wrote {:?}", cli.output);

    Ok(())
}

pub fn dump_main(cli: &DumpCli, cancel_signal: &AtomicBool) -> Result<()> {
    let public_key = load_public_key(&cli.public_key)?;
    let mut payload = open_payload(&cli.payload)?;

    println!("{}", Text(payload.manifest()));

    payload
        .verify_all(&public_key, cancel_signal)
        .with_context(|| format!("Failed to verify payload: {:?}", cli.payload))?;

    if let Some(signatures) = payload.signatures() {
        println!("{}", Text(signatures));
    }

    Ok(())
}

pub fn verify_main(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let public_key = load_public_key(&cli.public_key)?;
    let mut payload = open_payload(&cli.payload)?;

    payload
        .verify_all(&public_key, cancel_signal)
        .with_context(|| format!("Failed to verify payload: {:?}", cli.payload))?;

    info!("Payload is valid");

    Ok(())
}

pub fn generate_main(cli: &GenerateCli, cancel_signal: &AtomicBool) -> Result<()> {
    let key = load_private_key(&cli.key)?;

    let procedure = generator::full_update(&cli.input, cancel_signal)
        .with_context(|| format!("Failed to generate full update: {:?}", cli.input))?;

    let mut generator = Generator::new(key);
    generator
        .partition(procedure)
        .context("Failed to add partition procedure")?;

    let temp_file = temp_file_next_to(&cli.output)?;

    info!("Writing payload to {:?}", cli.output);

    let writer = generator
        .write_to(BufWriter::new(temp_file), cancel_signal)
        .with_context(|| format!("Failed to write payload: {:?}", cli.output))?;
    let mut temp_file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush payload: {:?}", cli.output))?;

    if let Some(path) = &cli.output_properties {
        temp_file.as_file_mut().rewind()?;

        let properties =
            PayloadProperties::from_reader(BufReader::new(temp_file.as_file()), cancel_signal)
                .context("Failed to compute payload properties")?;

        fs::write(path, properties.to_string())
            .with_context(|| format!("Failed to write properties: {path:?}"))?;
    }

    temp_file
        .persist(&cli.output)
        .with_context(|| format!("Failed to move temporary file to: {:?}", cli.output))?;

    Ok(())
}

pub fn properties_main(cli: &PropertiesCli, cancel_signal: &AtomicBool) -> Result<()> {
    let file = File::open(&cli.payload)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.payload))?;

    let properties = PayloadProperties::from_reader(BufReader::new(file), cancel_signal)
        .with_context(|| format!("Failed to read payload: {:?}", cli.payload))?;

    print!("{properties}");

    Ok(())
}

#[derive(Debug, Args)]
struct PublicKeyGroup {
    /// Path to SPKI public key for verifying the payload signatures.
    ///
    /// If unset, the embedded developer public key is used.
    #[arg(long, value_name = "FILE", value_parser)]
    public_key: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PrivateKeyGroup {
    /// Path to private key for signing the payload.
    ///
    /// If unset, the embedded developer key is used. That key is public
    /// knowledge, so payloads signed with it are only suitable for testing.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: Option<PathBuf>,

    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass", requires = "key")]
    pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass", requires = "key")]
    pass_file: Option<PathBuf>,
}

/// Apply a payload to produce a new partition image.
///
/// The output is written to a temporary file first and only moved into place
/// once every operation, the new partition hash, and the payload signatures
/// have been verified.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    payload: PathBuf,

    /// Path to output partition image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to existing partition image.
    ///
    /// Only needed if the payload declares a required old partition.
    #[arg(short, long, value_name = "FILE", value_parser)]
    source: Option<PathBuf>,

    #[command(flatten)]
    public_key: PublicKeyGroup,
}

/// Print the manifest and signatures of a payload.
///
/// All operations and the signatures are verified as well.
#[derive(Debug, Parser)]
pub struct DumpCli {
    /// Path to payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    payload: PathBuf,

    #[command(flatten)]
    public_key: PublicKeyGroup,
}

/// Verify the operation data and signatures of a payload.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    payload: PathBuf,

    #[command(flatten)]
    public_key: PublicKeyGroup,
}

/// Generate a signed full update payload from a partition image.
#[derive(Debug, Parser)]
pub struct GenerateCli {
    /// Path to input partition image.
    ///
    /// The size must be a multiple of the 4096-byte block size.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    key: PrivateKeyGroup,

    /// Path to output payload properties file.
    #[arg(long, value_name = "FILE", value_parser)]
    output_properties: Option<PathBuf>,
}

/// Print the size and digests of a payload file.
#[derive(Debug, Parser)]
pub struct PropertiesCli {
    /// Path to payload.
    #[arg(short, long, value_name = "FILE", value_parser)]
    payload: PathBuf,
}
