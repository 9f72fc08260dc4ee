// SPDX-FileCopyrightText: 2022-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Take, Write},
    sync::atomic::AtomicBool,
};

use bzip2::bufread::BzDecoder;
use ring::digest::Context;
use thiserror::Error;
use tracing::warn;

use crate::{
    format::payload::{PayloadReader, Procedure},
    protobuf::chromeos_update_engine::{Extent, InstallOperation, install_operation::Type},
    stream::{self, HashingReader},
};

/// Maximum number of compressed bytes that may remain unread after a
/// REPLACE_BZ operation's decompressed stream has ended. Some producers leave
/// a few bytes of residue behind.
pub const BZ_TRAILING_SLACK: u64 = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected payload data offset {expected}, not {actual}")]
    InvalidDataOffset { expected: u64, actual: u64 },
    #[error("Replace contains source extents")]
    SourceExtents,
    #[error("Missing payload data hash")]
    MissingDataHash,
    #[error("Expected payload data hash {expected}, not {actual}")]
    MismatchedDigest { expected: String, actual: String },
    #[error("Unsupported operation: {0:?}")]
    UnsupportedOperation(Type),
    #[error("Unknown operation type: {0}")]
    UnknownOperationType(i32),
    #[error("Replace left {0} trailing bytes")]
    TrailingData(u64),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to decompress bzip2 data")]
    Decompress(#[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

type OperationReader<'a, R> = HashingReader<Take<&'a mut PayloadReader<R>>>;

/// Context for processing one operation's data from a payload. The data
/// reader is limited to the operation's data length and every byte read
/// through it is hashed separately from the whole-payload digest.
pub struct Operation<'a, R: Read> {
    reader: OperationReader<'a, R>,
    stream_offset: u64,
    block_size: u32,
    procedure: &'a Procedure,
    operation: &'a InstallOperation,
}

impl<'a, R: Read> Operation<'a, R> {
    pub(crate) fn new(
        payload: &'a mut PayloadReader<R>,
        stream_offset: u64,
        block_size: u32,
        procedure: &'a Procedure,
        operation: &'a InstallOperation,
    ) -> Self {
        let limited = payload.take(operation.data_length().into());

        Self {
            reader: HashingReader::new(limited, Context::new(&ring::digest::SHA256)),
            stream_offset,
            block_size,
            procedure,
            operation,
        }
    }

    fn op_type(&self) -> Result<Type> {
        let value = self.operation.r#type;

        Type::try_from(value).map_err(|_| Error::UnknownOperationType(value))
    }

    fn verify_offset(&self) -> Result<()> {
        let expected = u64::from(self.operation.data_offset());
        if expected != self.stream_offset {
            return Err(Error::InvalidDataOffset {
                expected,
                actual: self.stream_offset,
            });
        }

        Ok(())
    }

    fn verify_no_source(&self) -> Result<()> {
        if !self.operation.src_extents.is_empty() {
            return Err(Error::SourceExtents);
        }

        Ok(())
    }

    /// Check the digest of every data byte read so far against the declared
    /// data hash.
    fn verify_hash(&self) -> Result<()> {
        let expected = match self.operation.data_sha256_hash.as_deref() {
            Some(h) if !h.is_empty() => h,
            _ => return Err(Error::MissingDataHash),
        };

        let digest = self.reader.digest();
        if digest.as_ref() != expected {
            return Err(Error::MismatchedDigest {
                expected: hex::encode(expected),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }

    /// Number of this operation's data bytes not yet read from the payload.
    fn remaining(&self) -> u64 {
        self.reader.get_ref().limit()
    }

    /// Consume the operation's data and check its integrity without writing
    /// anything.
    pub fn verify(&mut self, cancel_signal: &AtomicBool) -> Result<()> {
        let op_type = self.op_type()?;

        match op_type {
            Type::Replace => {
                self.verify_offset()?;
                self.verify_no_source()?;

                stream::copy(&mut self.reader, io::sink(), cancel_signal)?;

                self.verify_hash()
            }
            Type::ReplaceBz => {
                self.verify_offset()?;
                self.verify_no_source()?;

                let max_size = self.procedure.new_info.as_ref().and_then(|i| i.size);
                let ranges = self.dst_ranges(max_size)?;

                self.decode_bz(Discard, &ranges, cancel_signal)
            }
            Type::Move | Type::Bsdiff => Err(Error::UnsupportedOperation(op_type)),
        }
    }

    /// Write the operation's data to `dst`. `src` is the old partition image,
    /// which is only needed by operation types that read from source extents.
    pub fn apply(
        &mut self,
        mut dst: impl Write + Seek,
        _src: Option<&mut File>,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let op_type = self.op_type()?;

        match op_type {
            Type::Replace | Type::ReplaceBz => self.replace(&mut dst, op_type, cancel_signal),
            Type::Move | Type::Bsdiff => Err(Error::UnsupportedOperation(op_type)),
        }
    }

    /// Compute the byte range of a destination extent, clipped to the
    /// procedure's declared new size if there is one.
    fn extent_range(&self, extent: &Extent, max_size: Option<u64>) -> Result<(u64, u64)> {
        let block_size = u64::from(self.block_size);

        let offset = extent
            .start_block()
            .checked_mul(block_size)
            .ok_or(Error::IntegerTooLarge("start_block"))?;
        let mut length = extent
            .num_blocks()
            .checked_mul(block_size)
            .ok_or(Error::IntegerTooLarge("num_blocks"))?;
        let end = offset
            .checked_add(length)
            .ok_or(Error::IntegerTooLarge("num_blocks"))?;

        // The last extent of a full update may be declared larger than the
        // data it actually carries.
        if let Some(max_size) = max_size.filter(|s| end > *s) {
            let excess = end - max_size;
            warn!("Extent exceeds destination bounds by {excess} bytes");
            length = length.saturating_sub(excess);
        }

        Ok((offset, length))
    }

    fn dst_ranges(&self, max_size: Option<u64>) -> Result<Vec<(u64, u64)>> {
        self.operation
            .dst_extents
            .iter()
            .map(|e| self.extent_range(e, max_size))
            .collect()
    }

    /// Decode a REPLACE_BZ blob into `ranges` of `dst`. The whole blob is
    /// consumed and its hash checked before any problem with its contents is
    /// reported.
    fn decode_bz(
        &mut self,
        mut dst: impl Write + Seek,
        ranges: &[(u64, u64)],
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let (decoded, buffered) = {
            let mut decoder = BzDecoder::new(BufReader::new(&mut self.reader));
            let decoded = decode_ranges(&mut decoder, &mut dst, ranges, cancel_signal);

            (decoded, decoder.get_ref().buffer().len() as u64)
        };

        let decoded = match decoded {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e.into()),
            r => r,
        };

        let residue = buffered + self.remaining();
        stream::copy(&mut self.reader, io::sink(), cancel_signal)?;

        self.verify_hash()?;

        let excess = decoded.map_err(Error::Decompress)?;
        if excess != 0 {
            return Err(Error::TrailingData(excess));
        }

        if residue > BZ_TRAILING_SLACK {
            return Err(Error::TrailingData(residue));
        } else if residue != 0 {
            warn!("Compressed stream left {residue} bytes unread");
        }

        Ok(())
    }

    fn replace(
        &mut self,
        mut dst: impl Write + Seek,
        op_type: Type,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        self.verify_offset()?;
        self.verify_no_source()?;

        let max_size = self
            .procedure
            .new_info
            .as_ref()
            .and_then(|i| i.size)
            .ok_or(Error::MissingField("new_info"))?;
        let ranges = self.dst_ranges(Some(max_size))?;

        if op_type == Type::ReplaceBz {
            return self.decode_bz(&mut dst, &ranges, cancel_signal);
        }

        for (offset, length) in ranges {
            dst.seek(SeekFrom::Start(offset))?;
            stream::copy_n(&mut self.reader, &mut dst, length, cancel_signal)?;
        }

        let residue = self.remaining();
        if residue != 0 {
            return Err(Error::TrailingData(residue));
        }

        self.verify_hash()
    }
}

/// Copy decompressed data into each range of `dst`, then run the decoder to
/// the end of its stream. Returns the number of decompressed bytes that did
/// not fit in any range.
fn decode_ranges(
    mut decoder: impl Read,
    mut dst: impl Write + Seek,
    ranges: &[(u64, u64)],
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    for &(offset, length) in ranges {
        dst.seek(SeekFrom::Start(offset))?;
        stream::copy_n(&mut decoder, &mut dst, length, cancel_signal)?;
    }

    stream::copy(decoder, io::sink(), cancel_signal)
}

/// Verify-mode destination. Writes are discarded and seeks always succeed.
struct Discard;

impl Write for Discard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Discard {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Ok(0)
    }
}
