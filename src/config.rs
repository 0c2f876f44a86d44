use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use crate::cli::Cli;

pub const REACH_LIMIT_ENV: &str = "HPROF_WALKER_REACH_LIMIT";
pub const DUMP_ENV: &str = "HPROF_WALKER_DUMP";
pub const DEFAULT_REACH_LIMIT: usize = 100_000;

/// Tuning for path evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerConfig {
    /// Maximum number of objects one reachability filter may visit per
    /// candidate before giving up with "not reachable".
    pub reach_limit: usize,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            reach_limit: DEFAULT_REACH_LIMIT,
        }
    }
}

impl WalkerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self {
            reach_limit: resolve_reach_limit(cli.reach_limit)?,
        })
    }
}

pub fn resolve_reach_limit(flag: Option<usize>) -> Result<usize> {
    if let Some(limit) = flag {
        return Ok(limit);
    }

    if let Ok(raw) = env::var(REACH_LIMIT_ENV) {
        return raw
            .trim()
            .parse()
            .with_context(|| format!("{REACH_LIMIT_ENV} is not a number: {raw}"));
    }

    Ok(DEFAULT_REACH_LIMIT)
}

/// Dump files named on the command line, or the one from the environment.
pub fn resolve_dump_paths(args: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !args.is_empty() {
        return Ok(args.to_vec());
    }

    if let Ok(p) = env::var(DUMP_ENV) {
        return Ok(vec![PathBuf::from(p)]);
    }

    anyhow::bail!("No heap dump given. Pass a file or set {DUMP_ENV}")
}

pub fn resolve_dump_path(arg: Option<&PathBuf>) -> Result<PathBuf> {
    let paths = resolve_dump_paths(arg.map(std::slice::from_ref).unwrap_or(&[]))?;
    paths
        .into_iter()
        .next()
        .context("No heap dump given")
}
