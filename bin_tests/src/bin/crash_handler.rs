// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stands in for the external crash handler: records the arguments it was
//! launched with into the crash database, then exits.

use anyhow::Context;
use bin_tests::HANDLER_ARGS_FILE;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let database = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--database="))
        .context("missing --database")?;

    let path = Path::new(database).join(HANDLER_ARGS_FILE);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&args)?)?;
    // The crashing app polls for the final name.
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
