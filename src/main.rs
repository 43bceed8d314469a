mod cli;
mod logging;

use crate::cli::{Cli, Command};
use clap::Parser;
use derive_more::{Display, Error};
use exn::ResultExt;
use gloom_config::Config;
use gloom_library::Context;
use gloom_library::diff::{Change, diff};
use gloom_library::materialize::{ItemStatus, RunReport};
use gloom_library::orchestrator::{Orchestrator, RunOutcome, RunRequest, RunStatus};
use gloom_library::plan::Plan;
use gloom_library::records::JsonStore;
use gloom_storage::Staging;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Result<T> = std::result::Result<T, exn::Exn<ErrorKind>>;

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("unable to open the record store")]
    Records,
    #[display("run failed")]
    Run,
    #[display("diff failed")]
    Diff,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());
    logging::init(cli.verbose || config.as_ref().is_ok_and(|c| c.settings.debug_logging));
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = ?e, "unable to load configuration");
            return ExitCode::from(2);
        },
    };
    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "{}", *e);
            ExitCode::FAILURE
        },
    }
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    let paths = &config.paths;
    let store = JsonStore::open(&paths.records_file(), &paths.activity_file(), Staging::local(&paths.tmp_root))
        .await
        .or_raise(|| ErrorKind::Records)?;
    let orchestrator = Orchestrator::new(Context::new(config, Arc::new(store)));

    match command {
        Command::Plan { all } => {
            if let RunOutcome::Planned(plan) = orchestrator.run_now(RunRequest::DryRun).await.or_raise(|| ErrorKind::Run)? {
                print_plan(&plan, all);
            }
            Ok(ExitCode::SUCCESS)
        },
        Command::Run { force } => {
            let interrupt = orchestrator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, stopping after the current item");
                    interrupt.cancel_current().await;
                }
            });
            match orchestrator.run_now(RunRequest::Execute { force }).await.or_raise(|| ErrorKind::Run)? {
                RunOutcome::Executed(report) => {
                    print_report(&report);
                    Ok(if report.failed > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
                },
                RunOutcome::Planned(_) => Ok(ExitCode::SUCCESS),
            }
        },
        Command::Diff => {
            let diff = diff(orchestrator.context()).await.or_raise(|| ErrorKind::Diff)?;
            for entry in diff.entries.iter().filter(|e| e.change != Change::Unchanged) {
                println!("{:<10} {}", entry.change, entry.virtual_path.display());
            }
            for (change, count) in diff.counts() {
                println!("{change}: {count}");
            }
            Ok(ExitCode::SUCCESS)
        },
        Command::Watch => {
            watch(orchestrator).await;
            Ok(ExitCode::SUCCESS)
        },
    }
}

async fn watch(orchestrator: Orchestrator) {
    let shutdown = CancellationToken::new();
    let mut status = orchestrator.subscribe();
    let ack = orchestrator.trigger(RunRequest::Execute { force: false }).await;
    tracing::info!(?ack, "initial run");
    let auto_scan = orchestrator.spawn_auto_scan(shutdown.clone());
    if auto_scan.is_none() {
        tracing::warn!("automatic scans are disabled, only the initial run happens");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current {
                    RunStatus::Idle => {
                        if let Some(report) = orchestrator.last_report().await {
                            tracing::info!(
                                completed = report.completed,
                                skipped = report.skipped,
                                failed = report.failed,
                                "run finished"
                            );
                        }
                    },
                    RunStatus::Scanning { completed, total, .. } => tracing::debug!(completed, total, "running"),
                    RunStatus::Failed { message } => tracing::warn!(%message, "run failed"),
                }
            },
        }
    }

    tracing::info!("shutting down");
    shutdown.cancel();
    orchestrator.cancel_current().await;
    if let Some(handle) = auto_scan
        && let Err(e) = handle.await
    {
        tracing::error!(error = %e, "automatic scan task failed");
    }
    // Let an in-flight run reach a clean stop.
    let mut status = orchestrator.subscribe();
    let _ = status.wait_for(|s| !s.is_running()).await;
}

fn print_plan(plan: &Plan, all: bool) {
    for item in plan.items.iter().filter(|item| all || item.is_mutating()) {
        println!("{:<28} {} -> {}", item.action.to_string(), item.candidate.relative.display(), item.target.display());
    }
    for warning in &plan.warnings {
        println!("warning: {warning}");
    }
    println!("{}", plan.summary);
}

fn print_report(report: &RunReport) {
    for outcome in report.failures() {
        if let ItemStatus::Failed { error } = &outcome.status {
            println!("FAILED {} ({error})", outcome.source.display());
        }
    }
    println!("{}", report.summary);
    println!(
        "completed {}, skipped {}, failed {}{}",
        report.completed,
        report.skipped,
        report.failed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
}
