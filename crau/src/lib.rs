// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Tools for reading and writing `CrAU` version 1 update payloads.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod crypto;
pub mod format;
pub mod protobuf;
pub mod stream;
pub mod update;
pub mod util;
