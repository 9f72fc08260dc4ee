// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use bzip2::{Compression, write::BzEncoder};
use prost::Message;
use ring::digest::Context;
use rsa::{RsaPrivateKey, traits::PublicKeyParts};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    format::{
        payload::{self, Header, Procedure, ProcedureKind},
        signature,
    },
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallOperation, install_operation,
    },
    stream::{self, HashingWriter, ToWriter},
    util::NumBytes,
};

/// Block size of all generated payloads.
pub const BLOCK_SIZE: usize = payload::BLOCK_SIZE as usize;

/// Maximum amount of source data covered by a single operation.
pub const CHUNK_SIZE: usize = BLOCK_SIZE * 256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Read an incomplete block of {size} bytes at offset {offset}")]
    ShortRead { offset: u64, size: usize },
    #[error("Procedure already exists: {0}")]
    ProcedureExists(ProcedureKind),
    #[error("Partition procedure must be added first")]
    MissingPartition,
    #[error("Procedure kind cannot be added here: {0}")]
    InvalidProcedureKind(ProcedureKind),
    #[error("Expected {expected} bytes of operation data, but wrote {actual} bytes")]
    DataSizeMismatch { expected: u64, actual: u64 },
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to open file: {0:?}")]
    OpenFile(PathBuf, #[source] io::Error),
    #[error("Failed to write payload header")]
    Header(#[source] payload::Error),
    #[error("Failed to sign payload")]
    Signature(#[from] signature::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A procedure along with the operation data it references. The data must be
/// the concatenation of every operation's data in order.
pub struct ProcedureData {
    pub procedure: Procedure,
    pub data: Box<dyn Read>,
}

/// Splits a source image into block-aligned chunks, emitting one REPLACE or
/// REPLACE_BZ operation per chunk. Operation data is written to `payload`.
/// Data offsets are left unset.
pub struct FullScanner<W: Write, R: Read> {
    payload: W,
    source: R,
    offset: u64,
    operations: Vec<InstallOperation>,
}

impl<W: Write, R: Read> FullScanner<W, R> {
    pub fn new(payload: W, source: R) -> Self {
        Self {
            payload,
            source,
            offset: 0,
            operations: vec![],
        }
    }

    fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        (&mut self.source)
            .take(CHUNK_SIZE as u64)
            .read_to_end(&mut chunk)?;

        Ok(chunk)
    }

    /// Process the next chunk. Returns `false` once the source has been fully
    /// consumed.
    pub fn scan(&mut self, cancel_signal: &AtomicBool) -> Result<bool> {
        stream::check_cancel(cancel_signal)?;

        let chunk = self.read_chunk()?;
        if chunk.is_empty() {
            return Ok(false);
        } else if chunk.len() % BLOCK_SIZE != 0 {
            return Err(Error::ShortRead {
                offset: self.offset,
                size: chunk.len() % BLOCK_SIZE,
            });
        }

        let start_block = self.offset / BLOCK_SIZE as u64;
        let num_blocks = (chunk.len() / BLOCK_SIZE) as u64;
        self.offset += chunk.len() as u64;

        let compressed = compress(&chunk)?;

        let (op_type, data) = if compressed.len() < chunk.len() {
            (install_operation::Type::ReplaceBz, compressed.as_slice())
        } else {
            (install_operation::Type::Replace, chunk.as_slice())
        };

        debug!(
            "Blocks {start_block}+{num_blocks}: {op_type:?} with {}",
            NumBytes(data.len()),
        );

        self.payload.write_all(data)?;

        let data_length =
            u32::try_from(data.len()).map_err(|_| Error::IntegerTooLarge("data_length"))?;
        let digest = ring::digest::digest(&ring::digest::SHA256, data);

        self.operations.push(InstallOperation {
            r#type: op_type.into(),
            dst_extents: vec![Extent {
                start_block: Some(start_block),
                num_blocks: Some(num_blocks),
            }],
            data_length: Some(data_length),
            data_sha256_hash: Some(digest.as_ref().to_vec()),
            ..Default::default()
        });

        Ok(true)
    }

    pub fn finish(self) -> (W, Vec<InstallOperation>) {
        (self.payload, self.operations)
    }
}

fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Build a partition procedure that embeds the entire contents of `path`, so
/// that applying it does not depend on any previous partition state.
pub fn full_update(path: &Path, cancel_signal: &AtomicBool) -> Result<ProcedureData> {
    info!("Generating full update from {path:?}");

    let mut source = File::open(path).map_err(|e| Error::OpenFile(path.to_owned(), e))?;
    let new_info = payload::compute_install_info(BufReader::new(&mut source), cancel_signal)?;
    source.rewind()?;

    let mut data = tempfile::tempfile()?;
    let mut scanner = FullScanner::new(BufWriter::new(&mut data), BufReader::new(source));

    while scanner.scan(cancel_signal)? {}

    let (mut writer, operations) = scanner.finish();
    writer.flush()?;
    drop(writer);

    data.rewind()?;

    Ok(ProcedureData {
        procedure: Procedure {
            kind: ProcedureKind::Partition,
            operations,
            old_info: None,
            new_info: Some(new_info),
        },
        data: Box::new(BufReader::new(data)),
    })
}

/// Assembles a signed payload from procedures. The partition procedure must be
/// added first.
pub struct Generator {
    key: RsaPrivateKey,
    manifest: DeltaArchiveManifest,
    payloads: Vec<Box<dyn Read>>,
}

impl Generator {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self {
            key,
            manifest: DeltaArchiveManifest {
                block_size: Some(payload::BLOCK_SIZE),
                ..Default::default()
            },
            payloads: vec![],
        }
    }

    /// Add the main partition procedure. This must be called exactly once,
    /// before any other procedure is added.
    pub fn partition(&mut self, proc: ProcedureData) -> Result<()> {
        if !self.payloads.is_empty() {
            return Err(Error::ProcedureExists(ProcedureKind::Partition));
        } else if proc.procedure.kind != ProcedureKind::Partition {
            return Err(Error::InvalidProcedureKind(proc.procedure.kind));
        }

        self.manifest.partition_operations = proc.procedure.operations;
        self.manifest.old_partition_info = proc.procedure.old_info;
        self.manifest.new_partition_info = proc.procedure.new_info;
        self.payloads.push(proc.data);

        Ok(())
    }

    /// Add an auxiliary procedure. Each kind may only be added once.
    pub fn add_procedure(&mut self, kind: ProcedureKind, mut proc: ProcedureData) -> Result<()> {
        if self.payloads.is_empty() {
            return Err(Error::MissingPartition);
        }

        match kind {
            ProcedureKind::Kernel | ProcedureKind::PcrPolicy => {}
            k => return Err(Error::InvalidProcedureKind(k)),
        }

        if self
            .manifest
            .procedures
            .iter()
            .any(|p| p.r#type == kind.to_wire())
        {
            return Err(Error::ProcedureExists(kind));
        }

        proc.procedure.kind = kind;
        self.manifest.procedures.push(proc.procedure.to_wire());
        self.payloads.push(proc.data);

        Ok(())
    }

    /// Assign sequential data offsets to every operation in manifest order and
    /// fill in the signatures location. Returns the total data size.
    fn update_offsets(&mut self) -> Result<u64> {
        let mut offset = 0u32;

        let operations = self.manifest.partition_operations.iter_mut().chain(
            self.manifest
                .procedures
                .iter_mut()
                .flat_map(|p| p.operations.iter_mut()),
        );

        for op in operations {
            match op.data_length {
                None => op.data_offset = None,
                Some(length) => {
                    op.data_offset = Some(offset);
                    offset = offset
                        .checked_add(length)
                        .ok_or(Error::IntegerTooLarge("data_offset"))?;
                }
            }
        }

        let signatures_size = signature::signatures_size(self.key.size() * 8);

        self.manifest.signatures_offset = Some(offset.into());
        self.manifest.signatures_size = Some(signatures_size as u64);

        Ok(offset.into())
    }

    /// Finalize the payload and write it to `writer`. Returns the writer.
    pub fn write_to<W: Write>(mut self, writer: W, cancel_signal: &AtomicBool) -> Result<W> {
        let data_size = self.update_offsets()?;

        let manifest_raw = self.manifest.encode_to_vec();
        let header = Header {
            version: payload::VERSION,
            manifest_size: manifest_raw.len() as u64,
        };

        // Everything up to the signatures is covered by the signatures.
        let mut writer = HashingWriter::new(writer, Context::new(&ring::digest::SHA256));

        header.to_writer(&mut writer).map_err(Error::Header)?;
        writer.write_all(&manifest_raw)?;

        let mut written = 0;
        for data in &mut self.payloads {
            written += stream::copy(data, &mut writer, cancel_signal)?;
        }

        if written != data_size {
            return Err(Error::DataSizeMismatch {
                expected: data_size,
                actual: written,
            });
        }

        let (mut writer, context) = writer.finish();
        let digest = context.finish();

        let signatures = signature::sign_digest(digest.as_ref(), &self.key)?;
        writer.write_all(&signatures.encode_to_vec())?;

        Ok(writer)
    }

    /// Finalize the payload and write it to a new file at `path`.
    pub fn write(self, path: &Path, cancel_signal: &AtomicBool) -> Result<()> {
        info!("Writing payload to {path:?}");

        let file = File::create(path).map_err(|e| Error::OpenFile(path.to_owned(), e))?;
        let mut writer = self.write_to(BufWriter::new(file), cancel_signal)?;
        writer.flush()?;

        Ok(())
    }
}
