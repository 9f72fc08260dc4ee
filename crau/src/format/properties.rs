// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read},
    sync::atomic::AtomicBool,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use ring::digest::{Context, SHA1_FOR_LEGACY_USE_ONLY, SHA256};

use crate::stream;

/// Whole-file properties of a payload, as advertised by an update-check
/// server. Unlike the signed region, these cover the signatures block too.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadProperties {
    pub size: u64,
    pub sha1: Vec<u8>,
    pub sha256: Vec<u8>,
}

impl PayloadProperties {
    pub fn from_reader(reader: impl Read, cancel_signal: &AtomicBool) -> io::Result<Self> {
        let mut h_sha1 = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
        let mut h_sha256 = Context::new(&SHA256);

        let size = stream::copy_inspect(
            reader,
            io::sink(),
            |data| {
                h_sha1.update(data);
                h_sha256.update(data);
            },
            cancel_signal,
        )?;

        Ok(Self {
            size,
            sha1: h_sha1.finish().as_ref().to_vec(),
            sha256: h_sha256.finish().as_ref().to_vec(),
        })
    }
}

/// `KEY=value` lines with base64-encoded digests.
impl fmt::Display for PayloadProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FILE_SIZE={}", self.size)?;
        writeln!(f, "FILE_SHA1={}", STANDARD.encode(&self.sha1))?;
        writeln!(f, "FILE_SHA256={}", STANDARD.encode(&self.sha256))
    }
}
