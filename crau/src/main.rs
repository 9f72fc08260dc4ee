// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Ctrl-C only flags the running copy loop so that `apply` and `generate` can
/// drop their temporary output files instead of leaving partial results.
fn cancel_on_interrupt() -> Result<Arc<AtomicBool>> {
    let cancel_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = cancel_signal.clone();

    ctrlc::set_handler(move || handler_signal.store(true, Ordering::SeqCst))
        .context("Failed to set signal handler")?;

    Ok(cancel_signal)
}

fn run() -> Result<()> {
    let cancel_signal = cancel_on_interrupt()?;

    crau::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal)
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
            error!("{e:?}");
        } else {
            eprintln!("{e:?}");
        }

        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
