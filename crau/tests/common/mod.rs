// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::{io::Cursor, sync::atomic::AtomicBool};

use prost::Message;
use rand::{RngCore, SeedableRng, rngs::StdRng};

use crau::{
    format::{
        payload::{self, Header, PayloadReader},
        signature,
    },
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallInfo, InstallOperation, install_operation,
    },
    stream::ToWriter,
    update::generator::{self, Generator},
};

pub const BLOCK: usize = generator::BLOCK_SIZE;

pub fn no_cancel() -> AtomicBool {
    AtomicBool::new(false)
}

pub fn random_bytes(seed: u64, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Full update payload for `source`, signed with the developer key.
pub fn generate(source: &[u8]) -> Vec<u8> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, source).unwrap();

    let cancel_signal = no_cancel();
    let procedure = generator::full_update(file.path(), &cancel_signal).unwrap();

    let mut generator = Generator::new(signature::dev_signing_key().unwrap());
    generator.partition(procedure).unwrap();

    generator
        .write_to(Cursor::new(Vec::new()), &cancel_signal)
        .unwrap()
        .into_inner()
}

/// Serialize a payload with arbitrary manifest contents. The signatures
/// location is filled in and the result is validly signed.
pub fn build_payload(mut manifest: DeltaArchiveManifest, data: &[u8]) -> Vec<u8> {
    let key = signature::dev_signing_key().unwrap();

    manifest.block_size.get_or_insert(payload::BLOCK_SIZE);
    manifest.signatures_offset = Some(data.len() as u64);
    manifest.signatures_size = Some(signature::signatures_size(2048) as u64);

    let manifest_raw = manifest.encode_to_vec();
    let header = Header {
        version: payload::VERSION,
        manifest_size: manifest_raw.len() as u64,
    };

    let mut result = Vec::new();
    header.to_writer(&mut result).unwrap();
    result.extend_from_slice(&manifest_raw);
    result.extend_from_slice(data);

    let digest = ring::digest::digest(&ring::digest::SHA256, &result);
    let signatures = signature::sign_digest(digest.as_ref(), &key).unwrap();
    result.extend_from_slice(&signatures.encode_to_vec());

    result
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

pub fn install_info(data: &[u8]) -> InstallInfo {
    InstallInfo {
        hash: Some(sha256(data)),
        size: Some(data.len() as u64),
    }
}

pub fn extent(start_block: u64, num_blocks: u64) -> Extent {
    Extent {
        start_block: Some(start_block),
        num_blocks: Some(num_blocks),
    }
}

/// An operation carrying `data` at `offset`, writing to `dst_extents`.
pub fn data_operation(
    op_type: install_operation::Type,
    offset: u32,
    data: &[u8],
    dst_extents: Vec<Extent>,
) -> InstallOperation {
    InstallOperation {
        r#type: op_type.into(),
        data_offset: Some(offset),
        data_length: Some(data.len() as u32),
        dst_extents,
        data_sha256_hash: Some(sha256(data)),
        ..Default::default()
    }
}

/// Absolute position in `payload` of the data at `offset` relative to the end
/// of the manifest.
pub fn data_position(payload: &[u8], offset: u32) -> usize {
    let reader = PayloadReader::new(Cursor::new(payload)).unwrap();

    payload::HEADER_SIZE + reader.header().manifest_size as usize + offset as usize
}

pub fn bzip2_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
    std::io::Write::write_all(&mut encoder, data).unwrap();
    encoder.finish().unwrap()
}
