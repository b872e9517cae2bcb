use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use rand::Rng;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use shardgate_pg::{InMemoryPlacementGroup, InterruptReason, Interrupted, PlacementGroupView};
use shardgate_recovery::{
    OperationScheduler, PlacementGroup, RecoveryConfig, RecoveryStats, SimulatedRecoveryProtocol,
};
use shardgate_types::{Epoch, ObjectId, ObjectVersion, PgId};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Simulate(args) => cmd_simulate(args, cli.format).await,
        Command::Config(args) => cmd_config(args, cli.format),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RecoveryConfig> {
    let Some(path) = path else {
        return Ok(RecoveryConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    RecoveryConfig::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SimulationReport {
    pgid: PgId,
    start_epoch: Epoch,
    final_epoch: Epoch,
    objects: usize,
    needed_recovery: usize,
    still_unhealthy: usize,
    requests: usize,
    succeeded: usize,
    interrupted: usize,
    failed: usize,
    retries: usize,
    recoveries_started: u64,
    protocol_calls: u64,
    elapsed_ms: u64,
    /// Absent when the backend had already stopped.
    stats: Option<RecoveryStats>,
}

async fn cmd_simulate(args: SimulateArgs, format: OutputFormat) -> anyhow::Result<()> {
    anyhow::ensure!(args.objects > 0, "--objects must be at least 1");
    anyhow::ensure!(args.attempts > 0, "--attempts must be at least 1");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.unhealthy_ratio),
        "--unhealthy-ratio must be within 0..=1"
    );
    let config = load_config(args.config.as_deref())?;

    let state = InMemoryPlacementGroup::new(args.pgid, args.start_epoch());
    let soids = seed_objects(&state, &args)?;
    let unhealthy = state.unhealthy_objects();

    let protocol = Arc::new(SimulatedRecoveryProtocol::new(
        state.clone(),
        Duration::from_millis(args.min_latency_ms),
        Duration::from_millis(args.max_latency_ms),
    ));
    for soid in unhealthy.iter().take(args.unrecoverable) {
        protocol.mark_unrecoverable(soid);
    }
    let scheduler = OperationScheduler::new();
    let pg = PlacementGroup::new(
        Arc::new(state.clone()),
        scheduler.clone(),
        protocol.clone(),
        config,
    )?;
    info!(
        pgid = %args.pgid,
        objects = soids.len(),
        unhealthy = unhealthy.len(),
        "starting simulation"
    );

    let started = Instant::now();
    if let Some(delay) = args.bump_epoch_after_ms {
        let state = state.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            let epoch = state.advance_epoch();
            info!(%epoch, "advanced epoch");
        });
    }
    if let Some(delay) = args.tear_down_after_ms {
        let state = state.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            state.tear_down();
            info!("tore down placement group");
        });
    }

    let mut clients = Vec::with_capacity(soids.len() * args.clients);
    for soid in &soids {
        for _ in 0..args.clients {
            clients.push(tokio::spawn(client(pg.clone(), soid.clone(), args.attempts)));
        }
    }

    let mut report = SimulationReport {
        pgid: args.pgid,
        start_epoch: args.start_epoch(),
        final_epoch: args.start_epoch(),
        objects: soids.len(),
        needed_recovery: unhealthy.len(),
        still_unhealthy: 0,
        requests: clients.len(),
        succeeded: 0,
        interrupted: 0,
        failed: 0,
        retries: 0,
        recoveries_started: 0,
        protocol_calls: 0,
        elapsed_ms: 0,
        stats: None,
    };
    for handle in clients {
        let (result, attempts) = handle.await?;
        report.retries += attempts - 1;
        match result {
            Ok(()) => report.succeeded += 1,
            Err(err) if err.is_recovery_failure() => report.failed += 1,
            Err(_) => report.interrupted += 1,
        }
    }

    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    report.final_epoch = state.current_epoch();
    report.still_unhealthy = state.unhealthy_objects().len();
    report.recoveries_started = scheduler.started_count("urgent_recovery");
    report.protocol_calls = protocol.calls();
    report.stats = pg.recovery_backend().snapshot().await.ok().map(|s| s.stats);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

/// Populate `state` with `args.objects` objects, a share of which need
/// recovery in one of the three ways an object can.
fn seed_objects(state: &InMemoryPlacementGroup, args: &SimulateArgs) -> anyhow::Result<Vec<ObjectId>> {
    let mut rng = rand::thread_rng();
    (0..args.objects)
        .map(|i| -> anyhow::Result<ObjectId> {
            let soid = ObjectId::new(format!("obj-{i}"))?;
            let version = ObjectVersion::new(args.epoch, i as u64 + 1);
            if !rng.gen_bool(args.unhealthy_ratio) {
                state.mark_clean(&soid, version);
                return Ok(soid);
            }
            match rng.gen_range(0..3) {
                0 => state.mark_unreadable(&soid, version),
                1 => {
                    state.mark_clean(&soid, version);
                    state.mark_degraded(&soid);
                }
                _ => {
                    state.mark_clean(&soid, version);
                    state.mark_backfilling(&soid);
                }
            }
            Ok(soid)
        })
        .collect()
}

/// One client request: gate on recovery, retrying after epoch changes.
async fn client(pg: PlacementGroup, soid: ObjectId, attempts: usize) -> (Result<(), Interrupted>, usize) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = pg.ensure_recovered(&soid).await;
        match &result {
            Err(err) if attempt < attempts && matches!(err.reason, InterruptReason::EpochChanged { .. }) => {
                debug!(%soid, attempt, "retrying after epoch change");
            }
            _ => return (result, attempt),
        }
    }
}

fn print_report(report: &SimulationReport) {
    let headline = if report.failed == 0 && report.interrupted == 0 {
        "✓".green().bold()
    } else {
        "!".yellow().bold()
    };
    println!(
        "{} Simulated {} requests against pg {} in {}ms",
        headline,
        report.requests.to_string().bold(),
        report.pgid.to_string().cyan(),
        report.elapsed_ms
    );
    if report.final_epoch == report.start_epoch {
        println!("  Epoch: {}", report.start_epoch.to_string().yellow());
    } else {
        println!(
            "  Epoch: {} → {}",
            report.start_epoch.to_string().yellow(),
            report.final_epoch.to_string().yellow()
        );
    }
    println!(
        "  Objects: {} ({} needed recovery, {} still unhealthy)",
        report.objects, report.needed_recovery, report.still_unhealthy
    );
    println!("  Succeeded: {}", report.succeeded.to_string().green());
    if report.interrupted > 0 {
        println!("  Interrupted: {}", report.interrupted.to_string().yellow());
    }
    if report.failed > 0 {
        println!("  Failed: {}", report.failed.to_string().red());
    }
    if report.retries > 0 {
        println!("  Retries: {}", report.retries);
    }
    println!(
        "  Recoveries: {} started, {} protocol calls",
        report.recoveries_started.to_string().bold(),
        report.protocol_calls
    );
    match &report.stats {
        Some(stats) => println!(
            "  Sessions: {} created, {} waiters, {} completed, {} cancelled, {} failed",
            stats.sessions_created, stats.waiters_attached, stats.completed, stats.cancelled, stats.failed
        ),
        None => println!("  Sessions: {}", "backend stopped".dimmed()),
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (config, source) = match &args.action {
        ConfigAction::Show => (RecoveryConfig::default(), None),
        ConfigAction::Check { path } => (load_config(Some(path))?, Some(path)),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => {
            if let Some(path) = source {
                println!("{} {} is valid", "✓".green().bold(), path.display().to_string().bold());
            }
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
