// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod operation;
pub mod payload;
pub mod properties;
pub mod signature;
pub mod text;
