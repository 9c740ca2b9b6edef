// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf};

use anyhow::anyhow;
use clap::CommandFactory;

const TASKS: [&str; 2] = ["manual", "example-config"];

fn main() -> anyhow::Result<()> {
    match env::args()
        .nth(1)
        .ok_or(anyhow!("Must provide a task"))?
        .as_str()
    {
        "manual" => generate_manual(),
        "example-config" => generate_example_config(),
        _ => Err(anyhow!("Unknown task, use one of {:?}", TASKS)),
    }
}

fn docs_dir() -> anyhow::Result<PathBuf> {
    let mut root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    root.push("../");

    let outdir = root.join("sigportal/docs/");
    std::fs::create_dir_all(&outdir)?;
    Ok(outdir)
}

fn generate_manual() -> anyhow::Result<()> {
    let command = sigportal::cli::Cli::command();
    let manual = clap_mangen::Man::new(command);
    manual.generate_to(docs_dir()?)?;

    Ok(())
}

/// Write the default configuration next to the manual.
fn generate_example_config() -> anyhow::Result<()> {
    let config = sigportal::config::Config::default();
    let path = docs_dir()?.join("agent.toml");
    std::fs::write(
        &path,
        format!("# The default sigportal-agent configuration.\n\n{config}"),
    )?;
    println!("Wrote {}", path.display());

    Ok(())
}
