mod artifacts;
mod cleanup;
mod config;
mod context;
mod contracts;
mod deliverables;
mod doctor;
mod engine;
mod errors;
mod events;
mod executor;
mod guardrails;
mod llm;
mod matcher;
mod model;
mod plan_import;
mod plan_workflow;
mod prompts;
mod readiness;
mod repair;
mod reporting;
mod reviewer;
mod reviews;
mod scheduler;
mod skills;
mod status;
mod store;
mod telemetry;
mod util;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use crate::config::Workspace;
use crate::context::EngineContext;
use crate::engine::RunOutcome;

const USAGE: &str = "\
tandem - two-agent plan execution engine

Usage: tandem <COMMAND> [ARGS]

Commands:
  create-plan <top task>      Generate and review a plan until approved
  run [--plan-id <id>]        Drive the approved plan to completion
  status [--plan-id <id>]     Show per-task status with next steps
  errors [--plan-id <id>]     Show recent error events
  llm-calls [--plan-id <id>]  Show LM call telemetry
  contract-audit              Re-validate persisted normalized responses
  doctor [--plan-id <id>]     Preflight checks (read-only)
  repair-db                   Fix structural problems the doctor reports
  export [--plan-id <id>]     Bundle approved deliverables with a manifest
  reset-failed [--plan-id <id>]  Reset FAILED/attempt-capped tasks
  reset-db                    Delete all engine data (schema stays)

Options:
  -h, --help       Print help
  -V, --version    Print version
";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("");
    match command {
        "" | "--help" | "-h" => {
            println!("{}", USAGE);
            return Ok(());
        }
        "--version" | "-V" => {
            println!("tandem {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(dispatch(command, &args[1..]))?;
    std::process::exit(exit_code);
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn positional(args: &[String]) -> Option<String> {
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg.starts_with("--") {
            skip_next = true;
            continue;
        }
        return Some(arg.clone());
    }
    None
}

async fn resolve_plan_id(ctx: &EngineContext, args: &[String]) -> anyhow::Result<Option<String>> {
    if let Some(plan_id) = flag_value(args, "--plan-id") {
        return Ok(Some(plan_id));
    }
    if let Some(plan_id) = ctx.store.latest_plan_id().await? {
        return Ok(Some(plan_id));
    }
    // Fall back to the on-disk plan if the database is empty.
    let plan_path = ctx.workspace.plan_path();
    if plan_path.exists() {
        let plan_id = plan_import::load_plan_into_db(ctx.pool(), &plan_path).await?;
        return Ok(Some(plan_id));
    }
    Ok(None)
}

async fn dispatch(command: &str, args: &[String]) -> anyhow::Result<i32> {
    let workspace = Workspace::new(PathBuf::from("."));
    let ctx = EngineContext::init(workspace).await?;

    match command {
        "create-plan" => {
            let Some(top_task) = positional(args) else {
                eprintln!("Usage: tandem create-plan <top task>");
                return Ok(2);
            };
            match plan_workflow::generate_and_review_plan(&ctx, &top_task, None).await {
                Ok(result) => {
                    println!("plan approved: {}", result.plan_id);
                    println!("written to: {}", result.plan_path.display());
                    Ok(0)
                }
                Err(e) if e.downcast_ref::<plan_workflow::PlanNotApproved>().is_some() => {
                    eprintln!("{e:#}");
                    Ok(1)
                }
                Err(e) => Err(e),
            }
        }
        "run" => {
            let Some(plan_id) = resolve_plan_id(&ctx, args).await? else {
                eprintln!("no plan found; run create-plan first");
                return Ok(2);
            };
            // Preflight: a failing doctor refuses to run.
            let findings = doctor::run_doctor(ctx.pool(), Some(&plan_id), &ctx.config).await?;
            if !findings.is_empty() {
                eprintln!("doctor failed (preflight):");
                eprintln!("{}", doctor::format_findings(&findings));
                return Ok(2);
            }
            let outcome = engine::run_plan(&ctx, &plan_id).await?;
            cleanup::enforce_retention(ctx.pool(), &ctx.config.guardrails).await?;
            match outcome {
                RunOutcome::PlanDone => {
                    println!("plan complete: {}", plan_id);
                    Ok(0)
                }
                RunOutcome::BlockedWaitingUser(summary) => {
                    println!("plan blocked waiting for input; see {}", summary.display());
                    Ok(0)
                }
                RunOutcome::FuseTripped(trip) => {
                    eprintln!("fuse tripped ({}); re-run to continue", trip.scope());
                    Ok(1)
                }
            }
        }
        "status" => {
            let Some(plan_id) = resolve_plan_id(&ctx, args).await? else {
                println!("no plan found");
                return Ok(0);
            };
            println!("{}", reporting::render_status(&ctx.store, &plan_id).await?);
            Ok(0)
        }
        "errors" => {
            let Some(plan_id) = resolve_plan_id(&ctx, args).await? else {
                println!("no plan found");
                return Ok(0);
            };
            println!("{}", reporting::render_errors(ctx.pool(), &plan_id, 50).await?);
            Ok(0)
        }
        "llm-calls" => {
            let plan_id = flag_value(args, "--plan-id");
            println!(
                "{}",
                reporting::render_llm_calls(ctx.pool(), plan_id.as_deref(), 50).await?
            );
            Ok(0)
        }
        "contract-audit" => {
            let plan_id = flag_value(args, "--plan-id");
            let report = reporting::contract_audit(ctx.pool(), plan_id.as_deref(), 1000).await?;
            println!("{}", reporting::format_audit(&report));
            Ok(if report.drifted.is_empty() && report.invalid.is_empty() { 0 } else { 1 })
        }
        "doctor" => {
            let plan_id = resolve_plan_id(&ctx, args).await?;
            let findings = doctor::run_doctor(ctx.pool(), plan_id.as_deref(), &ctx.config).await?;
            println!("{}", doctor::format_findings(&findings));
            Ok(if findings.is_empty() { 0 } else { 1 })
        }
        "repair-db" => {
            let report = repair::repair_db(ctx.pool()).await?;
            println!(
                "repair: root_stubs={} decompose_edges={} orphan_edges_removed={}",
                report.root_stubs_created, report.decompose_edges_added, report.orphan_edges_removed
            );
            Ok(0)
        }
        "export" => {
            let Some(plan_id) = resolve_plan_id(&ctx, args).await? else {
                eprintln!("no plan found");
                return Ok(2);
            };
            let result = deliverables::export_deliverables(
                ctx.pool(),
                &ctx.workspace.deliverables_dir(),
                &plan_id,
                ctx.config.export_include_candidates,
            )
            .await?;
            println!(
                "exported {} file(s) to {}",
                result.files_copied,
                result.out_dir.display()
            );
            Ok(0)
        }
        "reset-failed" => {
            let Some(plan_id) = resolve_plan_id(&ctx, args).await? else {
                eprintln!("no plan found");
                return Ok(2);
            };
            let count = repair::reset_failed(ctx.pool(), &plan_id).await?;
            println!("reset {} task(s)", count);
            Ok(0)
        }
        "reset-db" => {
            repair::reset_db(ctx.pool()).await?;
            println!("database reset");
            Ok(0)
        }
        other => {
            eprintln!("unknown command: {}\n\n{}", other, USAGE);
            Ok(2)
        }
    }
}
