//! `planloop` CLI: judge and rewrite a plan until it strictly passes.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use planloop::core::types::{Mode, Phase, RunStatus};
use planloop::exit_codes;
use planloop::io::agent::CommandAgent;
use planloop::io::assets::Assets;
use planloop::io::cancel::CancelToken;
use planloop::io::config::{LoopConfig, load_config};
use planloop::io::layout::RunLayout;
use planloop::io::manual::ManualNotice;
use planloop::io::run_state::StateStore;
use planloop::logging;
use planloop::report::write_report;
use planloop::round::{LoopContext, LoopEvent, drive, resume_run, start_run};

#[derive(Parser)]
#[command(
    name = "planloop",
    version,
    about = "Judge and rewrite a plan with an agent until it strictly passes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new run for a plan.
    Run {
        #[command(flatten)]
        plan: PlanArg,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        /// Stop after this many rounds without a strict pass.
        #[arg(long, conflicts_with = "no_cap")]
        max_rounds: Option<u32>,
        /// Run until a strict pass or cancellation.
        #[arg(long)]
        no_cap: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Continue a stopped, failed or interrupted run.
    Resume {
        #[command(flatten)]
        plan: PlanArg,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Ask a running loop to stop at its next checkpoint.
    Stop {
        #[command(flatten)]
        plan: PlanArg,
    },
    /// Re-render the final report from persisted state.
    Report {
        #[command(flatten)]
        plan: PlanArg,
    },
    /// Print the persisted run status.
    Status {
        #[command(flatten)]
        plan: PlanArg,
    },
}

#[derive(Args)]
struct PlanArg {
    /// Plan markdown file.
    #[arg(long)]
    plan: PathBuf,
}

#[derive(Args)]
struct CommonArgs {
    /// Model passed to the agent.
    #[arg(long)]
    model: Option<String>,
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory with `prompts/` and `schemas/` (default: built-in set).
    #[arg(long)]
    assets: Option<PathBuf>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[plan-loop] error: {err:#}");
            exit_codes::ERROR
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            plan,
            mode,
            max_rounds,
            no_cap,
            common,
        } => {
            let mut config = load_config(common.config.as_deref())?;
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(max_rounds) = max_rounds {
                config.max_rounds = max_rounds;
                config.no_cap = false;
            }
            if no_cap {
                config.no_cap = true;
            }
            cmd_loop(&plan.plan, config, &common, false)
        }
        Command::Resume { plan, common } => {
            let config = load_config(common.config.as_deref())?;
            cmd_loop(&plan.plan, config, &common, true)
        }
        Command::Stop { plan } => cmd_stop(&plan.plan),
        Command::Report { plan } => cmd_report(&plan.plan),
        Command::Status { plan } => cmd_status(&plan.plan),
    }
}

fn cmd_loop(plan: &Path, mut config: LoopConfig, common: &CommonArgs, resume: bool) -> Result<i32> {
    if let Some(model) = &common.model {
        config.model = Some(model.clone());
    }
    config.validate()?;

    let layout = RunLayout::for_plan(plan)?;
    if !resume && !layout.plan_path.is_file() {
        bail!("plan file not found: {}", layout.plan_path.display());
    }
    let assets = match &common.assets {
        Some(dir) => {
            Assets::load(dir).with_context(|| format!("load assets from {}", dir.display()))?
        }
        None => Assets::builtin(&layout.assets_dir).context("prepare built-in assets")?,
    };
    let agent = CommandAgent::new(config.agent_command.clone(), config.model.clone())?;
    let store = StateStore::new(&layout.state_path);

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("install Ctrl-C handler")?;
    let cancel = CancelToken::new(store.clone(), interrupted);

    let (mut state, snapshot) = if resume {
        resume_run(&layout, &store)?
    } else {
        start_run(&layout, &store, config.mode, config.round_cap())?
    };

    let ctx = LoopContext {
        layout: &layout,
        assets: &assets,
        config: &config,
        agent: &agent,
        store: &store,
        cancel: &cancel,
        on_event: &print_event,
    };
    let outcome = drive(&ctx, &mut state, &snapshot, resume)?;
    Ok(outcome.exit_code)
}

fn cmd_stop(plan: &Path) -> Result<i32> {
    let layout = RunLayout::for_plan(plan)?;
    let store = StateStore::new(&layout.state_path);
    let state = store
        .request_stop()
        .with_context(|| format!("request stop for {}", plan.display()))?;
    println!(
        "[plan-loop] stop requested for {} (status={})",
        state.run_id,
        state.status.as_str()
    );
    Ok(exit_codes::OK)
}

fn cmd_report(plan: &Path) -> Result<i32> {
    let layout = RunLayout::for_plan(plan)?;
    let state = StateStore::new(&layout.state_path).load()?;
    let path = write_report(&layout, &state)?;
    println!("[plan-loop] final_report={}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_status(plan: &Path) -> Result<i32> {
    let layout = RunLayout::for_plan(plan)?;
    let state = StateStore::new(&layout.state_path).load()?;
    println!("run_id={}", state.run_id);
    println!("status={}", state.status.as_str());
    println!("round={}", state.round);
    println!("mode={}", state.mode.as_str());
    println!("lane={}", state.current_lane.as_str());
    println!(
        "max_rounds={}",
        state
            .max_rounds
            .map_or_else(|| "none".to_string(), |cap| cap.to_string())
    );
    println!("stop_requested={}", state.stop_requested);
    println!("current_plan={}", state.current_plan_path.display());
    if let Some(error) = &state.error {
        println!("error={error}");
    }
    Ok(exit_codes::OK)
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::Started {
            run_id,
            run_dir,
            mode,
            max_rounds,
            resumed,
        } => {
            let verb = if *resumed { "resumed" } else { "started" };
            println!("[plan-loop] {verb} {run_id}");
            println!("[plan-loop] run_dir={}", run_dir.display());
            let cap = max_rounds.map_or_else(|| "none".to_string(), |cap| cap.to_string());
            println!("[plan-loop] mode={}, max_rounds={cap}", mode.as_str());
        }
        LoopEvent::PhaseStarted { round, phase } => {
            let verb = match phase {
                Phase::Judge => "judging",
                Phase::Rewrite => "rewriting",
            };
            println!("[round {round}] {verb}...");
        }
        LoopEvent::PhaseCompleted {
            round,
            phase,
            provenance,
        } => println!("[round {round}] {} done ({provenance})", phase.as_str()),
        LoopEvent::Fallback { phase, reason } => {
            println!("[fallback] auto lane failed for {}: {reason}", phase.as_str());
            println!("[fallback] switching to manual lane for the remainder of this run.");
        }
        LoopEvent::Manual { phase, notice } => match notice {
            ManualNotice::Waiting { output } => {
                println!(
                    "[fallback/manual] waiting for {} output file: {output}",
                    phase.as_str()
                );
            }
            ManualNotice::Rejected { errors } => {
                println!(
                    "[fallback/manual] invalid JSON for {}: {}",
                    phase.as_str(),
                    errors.join("; ")
                );
                println!(
                    "[fallback/manual] overwrite the same output file with corrected content."
                );
            }
            ManualNotice::StillWaiting => {
                println!(
                    "[fallback/manual] still waiting for {} output...",
                    phase.as_str()
                );
            }
        },
        LoopEvent::RoundFinished {
            round,
            status,
            problem_count,
        } => println!("[round {round}] {status:?} with {problem_count} problem(s)"),
        LoopEvent::Finished(outcome) => {
            println!("[plan-loop] status={}", outcome.status.as_str());
            println!("[plan-loop] final_report={}", outcome.report_path.display());
            match outcome.status {
                RunStatus::Passed => {
                    if let Some(path) = &outcome.approved_plan_path {
                        println!("[plan-loop] approved_plan={}", path.display());
                    }
                    println!("CROSS-CHECK DONE: no remaining plan problems.");
                    println!("Manual review required before implementation.");
                }
                RunStatus::NeedsHumanTiebreaker => {
                    println!("Loop reached max rounds. Manual tie-breaker required.");
                }
                RunStatus::Stopped if outcome.exit_code == exit_codes::INTERRUPTED => {
                    println!("[plan-loop] interrupted by user");
                }
                RunStatus::Stopped => println!("[plan-loop] stopped: stop_requested=true"),
                RunStatus::Error => {
                    if let Some(error) = &outcome.error {
                        println!("[plan-loop] error: {error}");
                    }
                }
                RunStatus::Running => {}
            }
        }
    }
}
