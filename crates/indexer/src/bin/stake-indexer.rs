// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use url::Url;
use vrsc_indexer::{
    ChainRpcObj, IndexerConfig, LedgerDb, LedgerDbObj, RpcClient, ScanConfig, ScanManager,
    ScanType, StatisticsAggregator,
};

/// Arguments for the stake indexer.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct StakeIndexerArgs {
    /// URL of the verusd JSON-RPC endpoint.
    #[clap(short, long, env)]
    rpc_url: Url,

    /// RPC user name.
    #[clap(long, env)]
    rpc_user: Option<String>,

    /// RPC password.
    #[clap(long, env, requires = "rpc_user")]
    rpc_password: Option<String>,

    /// Per-request RPC timeout in seconds.
    #[clap(long, default_value = "30")]
    rpc_timeout: u64,

    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,

    /// Path to the TOML config listing tracked identities and scan tuning.
    #[clap(short, long, env = "INDEXER_CONFIG")]
    config: PathBuf,

    /// Scan to run: historical, incremental or gap-fill:<from>-<to>.
    #[clap(long, default_value = "historical")]
    scan_type: ScanType,

    /// Starting block number, overriding the config file.
    #[clap(long)]
    start_block: Option<u64>,

    /// Ending block number, overriding the config file.
    #[clap(long)]
    end_block: Option<u64>,

    /// Maximum seconds to wait for a new block between passes.
    #[clap(long, default_value = "600")]
    interval: u64,

    /// Number of consecutive failed passes before quitting.
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Run a single pass and exit.
    #[clap(long, default_value_t = false)]
    once: bool,

    /// Pending stake amounts to resolve after each pass.
    #[clap(long, default_value = "500")]
    backfill_limit: u64,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

async fn run_pass(
    manager: &ScanManager,
    aggregator: &StatisticsAggregator,
    scan_type: ScanType,
    scan_config: &ScanConfig,
    backfill_limit: u64,
) -> Result<()> {
    let start_time = std::time::Instant::now();
    let summary = manager.run(scan_type, scan_config.clone()).await?;
    if backfill_limit > 0 {
        manager.backfill_stake_amounts(scan_config, backfill_limit).await?;
    }
    aggregator.recompute_all().await?;
    tracing::info!(
        "Pass over {} finished as {} in {:.2}s",
        summary.scan_type,
        summary.state,
        start_time.elapsed().as_secs_f64()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = StakeIndexerArgs::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    let config = IndexerConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    let mut scan_config = config.scan.clone();
    if args.start_block.is_some() {
        scan_config.start_from_height = args.start_block;
    }
    if args.end_block.is_some() {
        scan_config.end_at_height = args.end_block;
    }
    scan_config.validate()?;

    let credentials = args.rpc_user.clone().zip(args.rpc_password.clone());
    let rpc: ChainRpcObj = Arc::new(RpcClient::new(
        args.rpc_url.clone(),
        credentials,
        Duration::from_secs(args.rpc_timeout),
    )?);
    let tracked = config.resolve_identities(rpc.as_ref()).await?;
    tracing::info!("Tracking {} identities", tracked.len());

    let db: LedgerDbObj = Arc::new(LedgerDb::new(&args.db).await?);
    let manager = ScanManager::new(
        rpc,
        db.clone(),
        tracked,
        config.extraction_params(),
        scan_config.cache_max_entries,
    );
    let aggregator = StatisticsAggregator::new(db);

    // Fixed ranges and explicit end heights run once and exit
    let run_once = args.once
        || args.end_block.is_some()
        || matches!(args.scan_type, ScanType::GapFill { .. });
    if run_once {
        tracing::info!("Running indexer once");
        run_pass(&manager, &aggregator, args.scan_type, &scan_config, args.backfill_limit)
            .await?;
        tracing::info!("Indexer completed successfully");
        return Ok(());
    }

    // Otherwise, run in a loop
    let mut failures = 0u32;
    loop {
        let pass = run_pass(&manager, &aggregator, args.scan_type, &scan_config, args.backfill_limit);
        tokio::pin!(pass);
        let result = tokio::select! {
            result = &mut pass => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                manager.shutdown().await;
                // Let the cancelled pass checkpoint its finished blocks
                if let Err(e) = pass.await {
                    tracing::warn!("Interrupted pass failed: {:?}", e);
                }
                return Ok(());
            }
        };

        match result {
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                tracing::error!("Error running stake indexer: {:?}", e);
                if failures >= args.retries {
                    bail!("Maximum retries reached");
                }
            }
        }

        tracing::info!("Waiting up to {} seconds for a new block", args.interval);
        tokio::select! {
            _ = manager.wait_for_new_block(Duration::from_secs(args.interval)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
