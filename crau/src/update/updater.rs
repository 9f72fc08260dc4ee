// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use ring::digest::Context;
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::info;

use crate::{
    format::{
        operation,
        payload::{self, PayloadReader, Procedure, ProcedureKind},
        text,
    },
    protobuf::chromeos_update_engine::InstallInfo,
    stream,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected {expected} bytes, but read {actual} bytes")]
    ShortBlob { expected: u64, actual: u64 },
    #[error("Expected hash {expected}, but got {actual}")]
    MismatchedDigest { expected: String, actual: String },
    #[error("{path:?} does not match the {kind} procedure's {which} info")]
    InfoCheck {
        path: PathBuf,
        kind: ProcedureKind,
        which: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("Procedure requires a source partition, but none was given")]
    MissingSource,
    #[error("{kind} procedure has no new info")]
    MissingNewInfo { kind: ProcedureKind },
    #[error("Unsupported procedure: {0}")]
    UnsupportedProcedure(ProcedureKind),
    #[error("Unknown procedure type: {0}")]
    UnknownProcedure(i32),
    #[error("{kind} operation {index} failed:\n{dump}")]
    Operation {
        kind: ProcedureKind,
        index: usize,
        dump: String,
        #[source]
        source: operation::Error,
    },
    #[error("Failed to open file: {0:?}")]
    OpenFile(PathBuf, #[source] io::Error),
    #[error("Payload error")]
    Payload(#[from] payload::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Applies payloads to a destination partition image.
pub struct Updater {
    /// Existing partition image. Only read if a procedure declares old info.
    pub src_partition: Option<PathBuf>,
    pub dst_partition: PathBuf,
    pub public_key: RsaPublicKey,
}

impl Updater {
    pub fn open_payload(&self, path: &Path) -> Result<PayloadReader<BufReader<File>>> {
        info!("Loading payload from {path:?}");

        let file = File::open(path).map_err(|e| Error::OpenFile(path.to_owned(), e))?;

        self.use_payload(BufReader::new(file))
    }

    pub fn use_payload<R: Read>(&self, reader: R) -> Result<PayloadReader<R>> {
        Ok(PayloadReader::new(reader)?)
    }

    /// Apply every procedure in order and then verify the payload signatures.
    /// On failure, the destination is left in an unspecified state.
    pub fn run<R: Read>(
        &self,
        payload: &mut PayloadReader<R>,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        for procedure in payload.procedures() {
            match procedure.kind {
                ProcedureKind::Partition => {
                    self.apply_procedure(payload, &procedure, cancel_signal)?;
                }
                k @ (ProcedureKind::Kernel | ProcedureKind::PcrPolicy) => {
                    return Err(Error::UnsupportedProcedure(k));
                }
                ProcedureKind::Unknown(v) => return Err(Error::UnknownProcedure(v)),
            }
        }

        payload.verify_signature(&self.public_key)?;

        Ok(())
    }

    /// Check the source image against the procedure's old info, then write
    /// the destination image and check it against the new info.
    pub fn apply_procedure<R: Read>(
        &self,
        payload: &mut PayloadReader<R>,
        procedure: &Procedure,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let kind = procedure.kind;
        let mut src_file = None;

        if let Some(old_info) = procedure
            .old_info
            .as_ref()
            .filter(|i| i.size() != 0 && !i.hash().is_empty())
        {
            let path = self.src_partition.as_deref().ok_or(Error::MissingSource)?;
            let mut file = File::open(path).map_err(|e| Error::OpenFile(path.to_owned(), e))?;

            verify_info(&mut file, old_info, cancel_signal).map_err(|e| Error::InfoCheck {
                path: path.to_owned(),
                kind,
                which: "old",
                source: Box::new(e),
            })?;

            src_file = Some(file);
        }

        let new_info = procedure
            .new_info
            .as_ref()
            .ok_or(Error::MissingNewInfo { kind })?;

        let path = &self.dst_partition;
        let mut dst_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::OpenFile(path.clone(), e))?;

        for (i, operation) in procedure.operations.iter().enumerate() {
            let index = i + 1;
            info!("{kind} operation {index}");

            payload
                .operation(procedure, operation)
                .apply(&mut dst_file, src_file.as_mut(), cancel_signal)
                .map_err(|e| Error::Operation {
                    kind,
                    index,
                    dump: text::Text(operation).to_string(),
                    source: e,
                })?;
        }

        dst_file.rewind()?;

        verify_info(&mut dst_file, new_info, cancel_signal).map_err(|e| Error::InfoCheck {
            path: path.clone(),
            kind,
            which: "new",
            source: Box::new(e),
        })
    }
}

/// Check that the first `info.size` bytes of `reader` have the SHA-256 digest
/// `info.hash`.
pub fn verify_info(reader: impl Read, info: &InstallInfo, cancel_signal: &AtomicBool) -> Result<()> {
    let expected = info.size();
    let mut context = Context::new(&ring::digest::SHA256);

    let actual = stream::copy_inspect(
        reader.take(expected),
        io::sink(),
        |data| context.update(data),
        cancel_signal,
    )?;
    if actual != expected {
        return Err(Error::ShortBlob { expected, actual });
    }

    let digest = context.finish();
    if digest.as_ref() != info.hash() {
        return Err(Error::MismatchedDigest {
            expected: hex::encode(info.hash()),
            actual: hex::encode(digest),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn info(data: &[u8]) -> InstallInfo {
        let cancel_signal = AtomicBool::new(false);
        payload::compute_install_info(Cursor::new(data), &cancel_signal).unwrap()
    }

    #[test]
    fn verify_info_outcomes() {
        let cancel_signal = AtomicBool::new(false);
        let expected = info(b"foobar");

        verify_info(Cursor::new(b"foobar"), &expected, &cancel_signal).unwrap();
        // Data beyond the declared size is not covered.
        verify_info(Cursor::new(b"foobarbaz"), &expected, &cancel_signal).unwrap();

        assert_matches!(
            verify_info(Cursor::new(b"foo"), &expected, &cancel_signal),
            Err(Error::ShortBlob {
                expected: 6,
                actual: 3,
            })
        );
        assert_matches!(
            verify_info(Cursor::new(b"foobaz"), &expected, &cancel_signal),
            Err(Error::MismatchedDigest { .. })
        );
    }
}
