// SPDX-FileCopyrightText: 2022-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Write},
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use prost::Message;
use ring::digest::{Context, Digest};
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        operation::{self, Operation},
        signature, text,
    },
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, InstallInfo, InstallOperation, InstallProcedure, Signatures,
        install_procedure,
    },
    stream::{self, CountingReader, FromReader, HashingReader, ReadDiscardExt, ToWriter},
};

pub const MAGIC: &[u8; 4] = b"CrAU";
pub const VERSION: u64 = 1;
pub const BLOCK_SIZE: u32 = 4096;

/// Size of the fixed portion of the header preceding the manifest.
pub const HEADER_SIZE: usize = MAGIC.len() + 8 + 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Payload missing magic prefix: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Payload version unsupported: {0}")]
    InvalidVersion(u64),
    #[error("Missing manifest")]
    MissingManifest,
    #[error("Payload block size not {BLOCK_SIZE}: {0}")]
    InvalidBlockSize(u32),
    #[error("Expected signatures offset {expected}, not {actual}")]
    InvalidSignaturesOffset { expected: u64, actual: u64 },
    #[error("Expected {expected} bytes of {what}, but read {actual} bytes")]
    Truncated {
        what: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("Found {0} trailing bytes")]
    TrailingData(u64),
    #[error("Operation {index} failed:\n{dump}")]
    Operation {
        index: usize,
        dump: String,
        #[source]
        source: operation::Error,
    },
    #[error("Failed to decode {0}")]
    Protobuf(&'static str, #[source] prost::DecodeError),
    #[error("Signature verification failed")]
    Signature(#[from] signature::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The fixed-size header at the start of every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u64,
    pub manifest_size: u64,
}

impl<R: Read> FromReader<R> for Header {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let version = u64::from_be_bytes(buf);
        if version != VERSION {
            return Err(Error::InvalidVersion(version));
        }

        reader.read_exact(&mut buf)?;
        let manifest_size = u64::from_be_bytes(buf);

        Ok(Self {
            version,
            manifest_size,
        })
    }
}

impl<W: Write> ToWriter<W> for Header {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_all(&self.version.to_be_bytes())?;
        writer.write_all(&self.manifest_size.to_be_bytes())?;
        Ok(())
    }
}

/// Kind of a procedure. The main partition transform is described by the
/// top-level manifest fields and has no wire-level procedure type of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    Partition,
    Kernel,
    PcrPolicy,
    Unknown(i32),
}

impl ProcedureKind {
    fn from_wire(value: Option<i32>) -> Self {
        // An unset type decodes as the first enumerator, like any proto2 enum.
        let value = value.unwrap_or_default();

        match install_procedure::Type::try_from(value) {
            Ok(install_procedure::Type::Kernel) => Self::Kernel,
            Ok(install_procedure::Type::PcrPolicy) => Self::PcrPolicy,
            Err(_) => Self::Unknown(value),
        }
    }

    /// Wire-level value. [`None`] for the partition procedure.
    pub fn to_wire(self) -> Option<i32> {
        match self {
            Self::Partition => None,
            Self::Kernel => Some(install_procedure::Type::Kernel.into()),
            Self::PcrPolicy => Some(install_procedure::Type::PcrPolicy.into()),
            Self::Unknown(v) => Some(v),
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partition => f.write_str("partition"),
            Self::Kernel => f.write_str("kernel"),
            Self::PcrPolicy => f.write_str("pcr_policy"),
            Self::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

/// One logical install transform and the operations it consists of.
#[derive(Clone, Debug, PartialEq)]
pub struct Procedure {
    pub kind: ProcedureKind,
    pub operations: Vec<InstallOperation>,
    pub old_info: Option<InstallInfo>,
    pub new_info: Option<InstallInfo>,
}

impl Procedure {
    fn from_wire(procedure: &InstallProcedure) -> Self {
        Self {
            kind: ProcedureKind::from_wire(procedure.r#type),
            operations: procedure.operations.clone(),
            old_info: procedure.old_info.clone(),
            new_info: procedure.new_info.clone(),
        }
    }

    /// Wire-level representation for the manifest's `procedures` list.
    pub fn to_wire(&self) -> InstallProcedure {
        InstallProcedure {
            r#type: self.kind.to_wire(),
            operations: self.operations.clone(),
            old_info: self.old_info.clone(),
            new_info: self.new_info.clone(),
        }
    }
}

/// Streaming reader for a payload. Every byte read from the underlying
/// reader, starting with the header, is fed into a SHA-256 context that is
/// later checked against the payload signatures.
///
/// The payload is consumed strictly sequentially. Operation data must be
/// read in manifest order via [`Self::operation`].
pub struct PayloadReader<R: Read> {
    inner: CountingReader<HashingReader<R>>,
    header: Header,
    manifest: DeltaArchiveManifest,
    blob_offset: u64,
    signatures: Option<Signatures>,
}

impl<R: Read> fmt::Debug for PayloadReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadReader")
            .field("header", &self.header)
            .field("offset", &self.offset())
            .field("operations", &self.manifest.partition_operations.len())
            .field("procedures", &self.manifest.procedures.len())
            .finish_non_exhaustive()
    }
}

impl<R: Read> PayloadReader<R> {
    /// Parse the header and manifest. After this returns, the reader is
    /// positioned at the start of the operation data.
    pub fn new(reader: R) -> Result<Self> {
        let hashing_reader = HashingReader::new(reader, Context::new(&ring::digest::SHA256));
        let mut inner = CountingReader::new(hashing_reader);

        let header = Header::from_reader(&mut inner)?;
        if header.manifest_size == 0 {
            return Err(Error::MissingManifest);
        }

        let manifest_raw = read_exact_or_truncated(&mut inner, header.manifest_size, "manifest")?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())
            .map_err(|e| Error::Protobuf("manifest", e))?;

        if manifest.block_size() != BLOCK_SIZE {
            return Err(Error::InvalidBlockSize(manifest.block_size()));
        }

        let blob_offset = inner.offset();

        Ok(Self {
            inner,
            header,
            manifest,
            blob_offset,
            signatures: None,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn manifest(&self) -> &DeltaArchiveManifest {
        &self.manifest
    }

    /// The signatures block. Only available after [`Self::verify_signature`]
    /// has read it.
    pub fn signatures(&self) -> Option<&Signatures> {
        self.signatures.as_ref()
    }

    /// Number of bytes consumed after the end of the manifest. Operation data
    /// offsets and the signatures offset are relative to the same point.
    pub fn offset(&self) -> u64 {
        self.inner.offset() - self.blob_offset
    }

    /// SHA-256 digest of every byte read so far, header included.
    pub fn sum(&self) -> Digest {
        self.inner.get_ref().digest()
    }

    /// All procedures in application order. The partition procedure is
    /// synthesized from the top-level manifest fields and always comes first.
    pub fn procedures(&self) -> Vec<Procedure> {
        let partition = Procedure {
            kind: ProcedureKind::Partition,
            operations: self.manifest.partition_operations.clone(),
            old_info: self.manifest.old_partition_info.clone(),
            new_info: self.manifest.new_partition_info.clone(),
        };

        std::iter::once(partition)
            .chain(self.manifest.procedures.iter().map(Procedure::from_wire))
            .collect()
    }

    /// Create a context for processing `operation`, which must be the next
    /// operation in manifest order. The context's reader is limited to the
    /// operation's data length and hashes everything read through it.
    pub fn operation<'a>(
        &'a mut self,
        procedure: &'a Procedure,
        operation: &'a InstallOperation,
    ) -> Operation<'a, R> {
        let stream_offset = self.offset();
        let block_size = self.manifest.block_size();

        Operation::new(self, stream_offset, block_size, procedure, operation)
    }

    /// Verify the data of every operation of every procedure, followed by the
    /// signatures block.
    pub fn verify_all(&mut self, public_key: &RsaPublicKey, cancel_signal: &AtomicBool) -> Result<()> {
        let mut index = 0;

        for procedure in self.procedures() {
            for operation in &procedure.operations {
                index += 1;

                self.operation(&procedure, operation)
                    .verify(cancel_signal)
                    .map_err(|e| Error::Operation {
                        index,
                        dump: text::Text(operation).to_string(),
                        source: e,
                    })?;
            }
        }

        self.verify_signature(public_key)
    }

    /// Read and verify the signatures block, which must begin exactly where
    /// the last operation's data ended and must be the last thing in the
    /// stream.
    pub fn verify_signature(&mut self, public_key: &RsaPublicKey) -> Result<()> {
        let expected = self.manifest.signatures_offset();
        let actual = self.offset();
        if expected != actual {
            return Err(Error::InvalidSignaturesOffset { expected, actual });
        }

        let digest = self.sum();

        let signatures_raw = read_exact_or_truncated(
            &mut self.inner,
            self.manifest.signatures_size(),
            "signatures",
        )?;
        let signatures = Signatures::decode(signatures_raw.as_slice())
            .map_err(|e| Error::Protobuf("signatures", e))?;

        signature::verify_digest(digest.as_ref(), &signatures, public_key)?;
        self.signatures = Some(signatures);

        let trailing = self.inner.read_discard_all()?;
        if trailing != 0 {
            return Err(Error::TrailingData(trailing));
        }

        debug!("Payload fully consumed at offset {}", self.inner.offset());

        Ok(())
    }
}

impl<R: Read> Read for PayloadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Read exactly `size` bytes without trusting `size` for the allocation.
fn read_exact_or_truncated(reader: impl Read, size: u64, what: &'static str) -> Result<Vec<u8>> {
    // Bounds the up-front allocation only. The reader may still yield less.
    let capacity = size.min(1024 * 1024).to_usize().unwrap_or_default();
    let mut buf = Vec::with_capacity(capacity);

    reader.take(size).read_to_end(&mut buf)?;

    let actual = buf.len() as u64;
    if actual != size {
        return Err(Error::Truncated {
            what,
            expected: size,
            actual,
        });
    }

    Ok(buf)
}

/// Compute the size and SHA-256 digest of everything in `reader`.
pub fn compute_install_info(reader: impl Read, cancel_signal: &AtomicBool) -> io::Result<InstallInfo> {
    let mut context = Context::new(&ring::digest::SHA256);
    let size = stream::copy_inspect(reader, io::sink(), |data| context.update(data), cancel_signal)?;

    Ok(InstallInfo {
        hash: Some(context.finish().as_ref().to_vec()),
        size: Some(size),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn raw_header(magic: &[u8; 4], version: u64, manifest_size: u64) -> Vec<u8> {
        let mut data = magic.to_vec();
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(&manifest_size.to_be_bytes());
        data
    }

    #[test]
    fn header_round_trip() {
        let header = Header {
            version: VERSION,
            manifest_size: 0x0102,
        };

        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer).unwrap();
        let data = writer.into_inner();

        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(data, raw_header(MAGIC, 1, 0x0102));
        assert_eq!(Header::from_reader(Cursor::new(&data)).unwrap(), header);
    }

    #[test]
    fn header_rejections() {
        assert_matches!(
            Header::from_reader(Cursor::new(raw_header(b"CrAV", 1, 1))),
            Err(Error::InvalidMagic(m)) if &m == b"CrAV"
        );
        assert_matches!(
            Header::from_reader(Cursor::new(raw_header(MAGIC, 2, 1))),
            Err(Error::InvalidVersion(2))
        );
        assert_matches!(
            Header::from_reader(Cursor::new(&MAGIC[..])),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        );
        assert_matches!(
            PayloadReader::new(Cursor::new(raw_header(MAGIC, 1, 0))),
            Err(Error::MissingManifest)
        );
    }

    #[test]
    fn manifest_rejections() {
        let manifest = DeltaArchiveManifest {
            block_size: Some(512),
            ..Default::default()
        }
        .encode_to_vec();

        let mut data = raw_header(MAGIC, 1, manifest.len() as u64);
        data.extend_from_slice(&manifest);

        assert_matches!(
            PayloadReader::new(Cursor::new(&data)),
            Err(Error::InvalidBlockSize(512))
        );

        let mut data = raw_header(MAGIC, 1, 100);
        data.extend_from_slice(&[0u8; 10]);

        assert_matches!(
            PayloadReader::new(Cursor::new(&data)),
            Err(Error::Truncated {
                what: "manifest",
                expected: 100,
                actual: 10,
            })
        );
    }

    #[test]
    fn offset_resets_after_manifest() {
        let manifest = DeltaArchiveManifest {
            block_size: Some(BLOCK_SIZE),
            ..Default::default()
        }
        .encode_to_vec();

        let mut data = raw_header(MAGIC, 1, manifest.len() as u64);
        data.extend_from_slice(&manifest);
        data.extend_from_slice(b"foobar");

        let mut reader = PayloadReader::new(Cursor::new(&data)).unwrap();
        assert_eq!(reader.offset(), 0);

        let signed_len = data.len() - 6;
        let expected = ring::digest::digest(&ring::digest::SHA256, &data[..signed_len]);
        assert_eq!(reader.sum().as_ref(), expected.as_ref());

        reader.read_discard_exact(3).unwrap();
        assert_eq!(reader.offset(), 3);
    }

    #[test]
    fn debug_skips_stream() {
        let manifest = DeltaArchiveManifest {
            block_size: Some(BLOCK_SIZE),
            ..Default::default()
        }
        .encode_to_vec();

        let mut data = raw_header(MAGIC, 1, manifest.len() as u64);
        data.extend_from_slice(&manifest);

        let reader = PayloadReader::new(Cursor::new(&data)).unwrap();
        let output = format!("{reader:?}");

        assert!(output.starts_with("PayloadReader { header: Header {"));
        assert!(output.contains("offset: 0, operations: 0, procedures: 0, .."));
    }

    #[test]
    fn partition_procedure_comes_first() {
        let manifest = DeltaArchiveManifest {
            block_size: Some(BLOCK_SIZE),
            new_partition_info: Some(InstallInfo {
                hash: None,
                size: Some(4096),
            }),
            procedures: vec![
                InstallProcedure {
                    r#type: Some(install_procedure::Type::Kernel.into()),
                    ..Default::default()
                },
                InstallProcedure {
                    r#type: None,
                    ..Default::default()
                },
                InstallProcedure {
                    r#type: Some(42),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
        .encode_to_vec();

        let mut data = raw_header(MAGIC, 1, manifest.len() as u64);
        data.extend_from_slice(&manifest);

        let reader = PayloadReader::new(Cursor::new(&data)).unwrap();
        let kinds = reader
            .procedures()
            .iter()
            .map(|p| p.kind)
            .collect::<Vec<_>>();

        assert_eq!(
            kinds,
            [
                ProcedureKind::Partition,
                ProcedureKind::Kernel,
                ProcedureKind::Kernel,
                ProcedureKind::Unknown(42),
            ]
        );
        assert_eq!(
            reader.procedures()[0].new_info.as_ref().and_then(|i| i.size),
            Some(4096)
        );
    }

    #[test]
    fn install_info_of_reader() {
        let cancel_signal = AtomicBool::new(false);
        let info = compute_install_info(Cursor::new(b"foobar"), &cancel_signal).unwrap();
        let expected = ring::digest::digest(&ring::digest::SHA256, b"foobar");

        assert_eq!(info.size, Some(6));
        assert_eq!(info.hash.as_deref(), Some(expected.as_ref()));
    }
}
