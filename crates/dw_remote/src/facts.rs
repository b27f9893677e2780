//! Host facts: CPU, memory, disk and uptime
//!
//! Each fact is probed with its own command; a failed probe yields
//! [`Fact::Unknown`] instead of failing the host.

use crate::commands;
use crate::executor::{CommandExecutor, RunOptions};
use dw_store::Host;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A probed value or the reason it is unknown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Fact<T> {
    Known(T),
    Unknown { unknown: String },
}

impl<T> Fact<T> {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown {
            unknown: reason.into(),
        }
    }
}

impl<T> From<Result<T, String>> for Fact<T> {
    fn from(result: Result<T, String>) -> Self {
        match result {
            Ok(value) => Self::Known(value),
            Err(reason) => Self::unknown(reason),
        }
    }
}

/// Byte counts for a capacity-style resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Snapshot of host-level facts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostFacts {
    pub cpu_cores: Fact<u32>,
    pub memory: Fact<Usage>,
    pub disk: Fact<Usage>,
    pub uptime_secs: Fact<u64>,
}

/// Probe every fact on `host`.
pub async fn collect(executor: &CommandExecutor, host: &Host) -> HostFacts {
    HostFacts {
        cpu_cores: probe(executor, host, commands::CPU_CORES, parse_cpu_cores).await,
        memory: probe(executor, host, commands::MEMORY, parse_memory).await,
        disk: probe(executor, host, commands::DISK, parse_disk).await,
        uptime_secs: probe(executor, host, commands::UPTIME, parse_uptime).await,
    }
}

async fn probe<T>(
    executor: &CommandExecutor,
    host: &Host,
    command: &str,
    parse: fn(&str) -> Result<T, String>,
) -> Fact<T> {
    match executor.run_on(host, command, RunOptions::default()).await {
        Ok(output) => parse(&output.stdout).into(),
        Err(e) => {
            debug!(host_id = %host.host_id, command, error = %e, "Fact probe failed");
            Fact::unknown(e.to_string())
        }
    }
}

/// `nproc` output
pub fn parse_cpu_cores(output: &str) -> Result<u32, String> {
    output
        .trim()
        .parse()
        .map_err(|e| format!("invalid core count '{}': {e}", output.trim()))
}

/// `free -b` output
pub fn parse_memory(output: &str) -> Result<Usage, String> {
    let row = output
        .lines()
        .find(|line| line.trim_start().starts_with("Mem:"))
        .ok_or_else(|| "no Mem: row".to_string())?;
    usage_from_columns(row, 1, 2)
}

/// `df -P -B1 /` output
pub fn parse_disk(output: &str) -> Result<Usage, String> {
    let row = output
        .lines()
        .skip(1)
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| "no filesystem row".to_string())?;
    usage_from_columns(row, 1, 2)
}

/// `/proc/uptime` output
pub fn parse_uptime(output: &str) -> Result<u64, String> {
    let first = output
        .split_whitespace()
        .next()
        .ok_or_else(|| "empty uptime".to_string())?;
    let secs: f64 = first
        .parse()
        .map_err(|e| format!("invalid uptime '{first}': {e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid uptime '{first}'"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let whole = secs.floor() as u64;
    Ok(whole)
}

fn usage_from_columns(row: &str, total: usize, used: usize) -> Result<Usage, String> {
    let columns: Vec<&str> = row.split_whitespace().collect();
    let column = |i: usize| -> Result<u64, String> {
        columns
            .get(i)
            .ok_or_else(|| format!("missing column {i} in '{row}'"))?
            .parse()
            .map_err(|e| format!("invalid number in column {i} of '{row}': {e}"))
    };
    Ok(Usage {
        total_bytes: column(total)?,
        used_bytes: column(used)?,
    })
}
