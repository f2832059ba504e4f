//! CLI Entry Point for eproc-daq
//!
//! Runs swept EPR acquisitions against the simulated instrument set.
//!
//! # Usage
//!
//! Inspect the configured sweep:
//! ```bash
//! eproc-daq plan --config config/eproc.toml
//! ```
//!
//! Run it and save the result (Ctrl-C stops after the current point and
//! still saves what was measured):
//! ```bash
//! eproc-daq run --output data/ --tag sample_7
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use daq_experiment::{EngineEvent, ScanPlan};
use eproc_daq::config::{EprocConfig, DEFAULT_CONFIG_PATH};
use eproc_daq::session::{describe_progress, Session};
use eproc_daq::tracing_setup;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "eproc-daq", version)]
#[command(about = "Swept EPR acquisition with a lock-in amplifier", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured sweep and save the data
    Run {
        /// Output directory, overrides storage.output_dir
        #[arg(long)]
        output: Option<PathBuf>,

        /// File name stem, overrides storage.tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Print the normalized sweep plan without acquiring
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EprocConfig::load_from(&cli.config)?;
    tracing_setup::init_from_config(&config)?;
    let session = Session::new(config)?;

    match cli.command {
        Commands::Run { output, tag } => {
            let session = match output {
                Some(dir) => session.with_output_dir(dir),
                None => session,
            };
            run(session, tag).await
        }
        Commands::Plan => show_plan(&session).await,
    }
}

fn print_plan(session: &Session, plan: &ScanPlan) {
    let grid = plan.axis.grid();
    let unit = plan.axis.kind().unit();
    println!("📋 {} sweep", plan.axis.kind());
    println!(
        "   {} {} .. {} {} in steps of {} {} ({} points)",
        grid.start,
        unit,
        grid.stop,
        unit,
        grid.step,
        unit,
        plan.point_count()
    );
    println!(
        "   {} sweeps x {} accumulations, settle {:?}",
        plan.repeats, plan.accumulations_per_point, plan.settle_time
    );
    let secs = session.engine().estimated_duration(plan).as_secs();
    println!(
        "   Estimated duration: {:02}h{:02}m{:02}s",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    );
}

async fn show_plan(session: &Session) -> Result<()> {
    let plan = session.prepare().await?;
    print_plan(session, &plan);
    Ok(())
}

async fn run(session: Session, tag: Option<String>) -> Result<()> {
    let engine = session.engine();
    let mut events = engine.subscribe();

    let plan = session.start().await?;
    print_plan(&session, &plan);
    println!("▶️  Acquiring - press Ctrl+C to stop after the current point");

    let join = engine.join();
    tokio::pin!(join);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ctrl_c_available = true;

    let outcome = loop {
        tokio::select! {
            reason = &mut join => break reason,
            signal = &mut ctrl_c, if ctrl_c_available => match signal {
                Ok(()) => {
                    warn!("Interrupt received, stopping after the current point");
                    engine.request_stop();
                    ctrl_c.set(tokio::signal::ctrl_c());
                }
                Err(e) => {
                    error!(error = %e, "Cannot listen for Ctrl+C, run continues until done");
                    ctrl_c_available = false;
                }
            },
            event = events.recv() => match event {
                Ok(EngineEvent::Progress(estimate)) if estimate.points_done == 0 => {
                    info!("{}", describe_progress(&estimate, plan.repeats));
                }
                Ok(EngineEvent::StateChanged(state)) => debug!(%state, "Engine state"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Progress events skipped"),
                Err(RecvError::Closed) => {}
            },
        }
    };

    // Data measured before a fault is saved as well
    let path = session.save(tag.as_deref()).await?;
    println!("💾 Saved to {}", path.display());

    match outcome {
        Ok(reason) => {
            println!("✅ Acquisition {}", reason);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Acquisition faulted: {}", e);
            Err(e.into())
        }
    }
}
