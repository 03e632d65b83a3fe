use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tokenslab::{
    scenario::{Scenario, StepOutcome},
    EventLog, LedgerConfig, LedgerError, LedgerSnapshot, TracingSink,
};

#[derive(Parser)]
#[command(name = "tokenslab", version, about = "Slab deposit ledger tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scenario against a fresh ledger and print deposit events as JSON lines.
    Replay {
        scenario: PathBuf,
        /// Override the scenario's slab geometry with a config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the final ledger snapshot here.
        #[arg(long)]
        snapshot_out: Option<PathBuf>,
    },
    /// Verify a snapshot and print its slab layout.
    Inspect { snapshot: PathBuf },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn replay_cmd(
    scenario_path: PathBuf,
    config: Option<PathBuf>,
    snapshot_out: Option<PathBuf>,
) -> Result<(), LedgerError> {
    let mut scenario = Scenario::from_json_file(&scenario_path)?;
    if let Some(path) = config {
        scenario.config = LedgerConfig::from_json_file(&path)?;
    }
    info!(
        scenario = %scenario_path.display(),
        max_slab = scenario.config.max_slab(),
        slab_capacity = %scenario.config.slab_capacity(),
        steps = scenario.steps.len(),
        "replaying scenario"
    );

    let log = Arc::new(EventLog::new());
    let run = scenario.run((log.clone(), TracingSink));

    for (idx, (_, outcome)) in run.outcomes.iter().enumerate() {
        if let StepOutcome::Failed { reason } = outcome {
            eprintln!("step {idx}: {reason}");
        }
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in log.events() {
        serde_json::to_writer(&mut out, &event)?;
        writeln!(out)?;
    }

    let snapshot = run.ledger.snapshot();
    if let Some(path) = snapshot_out {
        snapshot.save(&path)?;
        info!(path = %path.display(), root = %snapshot.state_root_hex(), "snapshot written");
    }
    info!(
        deposits = snapshot.meta.deposits,
        failures = run.failures(),
        current_slab = snapshot.slabs.current_slab,
        total_deposited = %snapshot.slabs.total_deposited,
        "replay finished"
    );
    Ok(())
}

fn inspect_cmd(path: PathBuf) -> Result<(), LedgerError> {
    let snapshot = LedgerSnapshot::load(&path)?;
    snapshot.verify()?;
    let config = &snapshot.config;
    println!("custodian      {}", snapshot.custodian);
    println!(
        "current slab   {} / {}{}",
        snapshot.slabs.current_slab,
        config.max_slab(),
        if snapshot.slabs.is_exhausted() { " (exhausted)" } else { "" }
    );
    println!("slab capacity  {}", config.slab_capacity());
    println!("deposits       {}", snapshot.meta.deposits);
    match snapshot.meta.last_slab {
        Some(slab) => println!("last slab      {slab}"),
        None => println!("last slab      -"),
    }
    println!("total          {}", snapshot.slabs.total_deposited);
    println!("depositors     {}", snapshot.depositors.len());
    for (idx, filled) in snapshot.slabs.slab_filled.iter().enumerate() {
        println!("  slab {idx:>3}  {filled} / {}", config.slab_capacity());
    }
    println!("state root     {}", snapshot.state_root_hex());
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Replay {
            scenario,
            config,
            snapshot_out,
        } => replay_cmd(scenario, config, snapshot_out),
        Command::Inspect { snapshot } => inspect_cmd(snapshot),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
