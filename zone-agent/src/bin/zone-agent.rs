// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side CLI for inspecting zones the agent manages

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use serde_json::json;
use slog::{debug, Logger};
use std::sync::Arc;
use zone_agent::config::Config;
use zone_agent::console::console_output;
use zone_agent::driver::{list_zone_names, zone_info};
use zone_utils::executor::HostExecutor;
use zone_utils::kstat::{KstatCli, StatCollector};
use zone_utils::storage::{ConnectionInfo, StorageLocator};
use zone_utils::zone::ConnectionManager;
use zone_utils::zoneadm::ZoneadmConnector;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the agent's TOML configuration file
    #[arg(long)]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lists the names of all non-global zones
    List,
    /// Shows the power state, memory, CPUs and CPU time of a zone
    Info { name: String },
    /// Shows the CPU time consumed by a zone, in nanoseconds
    CpuTime { name: String },
    /// Shows resource-control and CPU statistics of a running zone
    Diagnostics { name: String },
    /// Prints the tail of a zone's console log
    ConsoleOutput { name: String },
    /// Shows how this host presents itself to the volume service
    VolumeConnector,
    /// Resolves a JSON connection descriptor into a storage URI
    ResolveUri {
        /// Connection info, as JSON
        connection_info: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config))?;
    let log = config
        .log
        .to_logger("zone-agent")
        .context("failed to construct logger")?;
    run(&log, &config, args.command).await
}

async fn run(log: &Logger, config: &Config, command: Command) -> anyhow::Result<()> {
    let executor = HostExecutor::new(log.clone()).as_executor();
    let zones = ConnectionManager::new(
        log,
        Box::new(ZoneadmConnector::new(log, executor.clone())),
    );
    let stats = StatCollector::new(
        log,
        zones.clone(),
        Arc::new(KstatCli::new(executor.clone())),
    );
    let storage = StorageLocator::new(
        log,
        executor.clone(),
        config.zones.nfs_username.clone(),
        config.zones.nfs_groupname.clone(),
    );
    debug!(log, "running command"; "command" => ?command);

    let output = match command {
        Command::List => json!(list_zone_names(&zones).await?),
        Command::Info { name } => {
            let info = zone_info(&zones, &stats, &name).await?;
            json!({
                "state": info.state.to_string(),
                "max_mem_kb": info.max_mem_kb,
                "mem_kb": info.mem_kb,
                "num_cpu": info.num_cpu,
                "cpu_time_ns": info.cpu_time_ns,
            })
        }
        Command::CpuTime { name } => {
            let zone = zones
                .find_zone(&name)
                .await?
                .ok_or_else(|| anyhow!("zone {name} not found"))?;
            json!(stats.cpu_time_nanos(&zone).await)
        }
        Command::Diagnostics { name } => {
            let zone = zones
                .find_zone(&name)
                .await?
                .ok_or_else(|| anyhow!("zone {name} not found"))?;
            json!(stats.diagnostics(&zone).await?)
        }
        Command::ConsoleOutput { name } => {
            print!("{}", console_output(&config.zones.console_log_dir, &name)?);
            return Ok(());
        }
        Command::VolumeConnector => {
            json!(
                storage
                    .volume_connector(&config.host.my_ip, &config.host.host)
                    .await
            )
        }
        Command::ResolveUri { connection_info } => {
            let info: ConnectionInfo = serde_json::from_str(&connection_info)
                .context("failed to parse connection info")?;
            json!(storage.resolve_storage_uri(&info).await?)
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
