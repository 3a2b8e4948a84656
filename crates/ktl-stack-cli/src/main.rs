use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use ktl_console::ConsoleRenderer;
use ktl_stack::bus::Observer;
use ktl_stack::engine;
use ktl_stack::pipeline::build_stack_diff_summary;
use ktl_stack::plan::StackPlan;
use ktl_stack::runtime::{Reporter, RuntimeContext};
use ktl_stack::store;
use ktl_stack::types::{RunCommand, RunOptions, RunStatus};

mod drivers;

#[derive(Parser, Debug)]
#[command(name = "ktl-stack", version)]
#[command(about = "DAG-driven multi-cluster release orchestrator for ktl stacks")]
struct Cli {
    /// Global cap on concurrently running releases.
    #[arg(long, default_value_t = 4, global = true)]
    concurrency: usize,

    /// Tail length for captured hook and helm output.
    #[arg(long, default_value_t = 40, global = true)]
    output_lines: usize,

    /// Disable the in-place console even on a TTY.
    #[arg(long, global = true)]
    no_console: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a compiled plan artifact against its clusters.
    Apply {
        /// Path to a compiled plan artifact (plan.json).
        #[arg(long)]
        plan: PathBuf,

        /// Cancel the whole run on the first terminal node failure.
        #[arg(long)]
        fail_fast: bool,

        /// Stop every node after its diff phase.
        #[arg(long)]
        plan_only: bool,

        /// Refuse to install releases that are not already deployed.
        #[arg(long)]
        upgrade_only: bool,

        /// Confirm immutable-field suspicion with a server dry-run.
        #[arg(long)]
        server_confirm: bool,

        /// Skip the pre-apply review gate.
        #[arg(long = "yes")]
        auto_approve: bool,

        /// Run-global allowance for rate-limit retry waiting (e.g. 10m).
        #[arg(long, default_value = "10m")]
        rate_limit_budget: String,
    },
    /// Delete every release of a compiled plan, reverse-dependency first.
    Delete {
        #[arg(long)]
        plan: PathBuf,

        #[arg(long)]
        fail_fast: bool,
    },
    /// Resume the most recent run of a stack root.
    Resume {
        /// Stack root containing `.ktl/stack/runs/`.
        #[arg(long, default_value = ".")]
        stack_root: PathBuf,

        /// Resume a specific run directory instead of the newest.
        #[arg(long)]
        run_root: Option<PathBuf>,

        /// Restrict the resumed plan to previously failed nodes.
        #[arg(long)]
        rerun_failed: bool,

        /// Proceed even when effective inputs drifted.
        #[arg(long)]
        allow_drift: bool,
    },
    /// Print the per-node diff summary of a compiled plan.
    Diff {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Show node statuses of the most recent run.
    Status {
        #[arg(long, default_value = ".")]
        stack_root: PathBuf,
    },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = runtime_context();

    match cli.cmd {
        Commands::Apply {
            plan,
            fail_fast,
            plan_only,
            upgrade_only,
            server_confirm,
            auto_approve,
            rate_limit_budget,
        } => {
            let plan = load_plan(&plan)?;
            let budget = humantime::parse_duration(&rate_limit_budget)
                .context("invalid --rate-limit-budget")?;

            if !auto_approve && !plan_only {
                print_review(&ctx, &plan)?;
            }

            let opts = RunOptions {
                command: RunCommand::Apply,
                concurrency: cli.concurrency,
                fail_fast,
                auto_approve,
                plan_only,
                upgrade_only,
                server_side_confirm: server_confirm,
                output_lines: cli.output_lines,
                rate_limit_budget: budget,
                ..RunOptions::default()
            };
            execute(&ctx, plan, &opts, cli.no_console)
        }
        Commands::Delete { plan, fail_fast } => {
            let plan = load_plan(&plan)?;
            let opts = RunOptions {
                command: RunCommand::Delete,
                concurrency: cli.concurrency,
                fail_fast,
                output_lines: cli.output_lines,
                ..RunOptions::default()
            };
            execute(&ctx, plan, &opts, cli.no_console)
        }
        Commands::Resume {
            stack_root,
            run_root,
            rerun_failed,
            allow_drift,
        } => {
            let run_dir = match &run_root {
                Some(root) => root.clone(),
                None => store::load_most_recent_run(&stack_root)?
                    .context("no previous run found under this stack root")?,
            };
            let loaded = store::load_run(&run_dir)?;

            let opts = RunOptions {
                command: RunCommand::Apply,
                concurrency: cli.concurrency,
                resume: true,
                rerun_failed,
                allow_drift,
                run_root: Some(run_dir),
                output_lines: cli.output_lines,
                ..RunOptions::default()
            };
            execute(&ctx, loaded.plan, &opts, cli.no_console)
        }
        Commands::Diff { plan } => {
            let plan = load_plan(&plan)?;
            let summary = build_stack_diff_summary(
                &ctx,
                &plan,
                &Default::default(),
                &plan.plan_hash,
            )?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Status { stack_root } => {
            let run_dir = store::load_most_recent_run(&stack_root)?
                .context("no previous run found under this stack root")?;
            let loaded = store::load_run(&run_dir)?;
            let run_store = store::RunStore::open(&run_dir);

            println!("run {}", run_store.run_id());
            if let Some(summary) = run_store.load_summary()? {
                println!("status: {}", summary.status);
            }
            for (id, status) in &loaded.status_by_id {
                let error = status
                    .last_error
                    .as_ref()
                    .map(|e| format!("  {}", e))
                    .unwrap_or_default();
                println!(
                    "  {:<30} {:<10} attempt {}{}",
                    id.as_str(),
                    status.status.to_string(),
                    status.attempt,
                    error
                );
            }
            Ok(())
        }
    }
}

fn runtime_context() -> RuntimeContext {
    let commit = option_env!("KTL_BUILD_GIT_SHA")
        .filter(|sha| !sha.is_empty())
        .map(str::to_string);
    let mut ctx = RuntimeContext::new(
        Arc::new(drivers::HelmCli),
        Arc::new(drivers::KubectlCli),
    )
    .with_reporter(Arc::new(Mutex::new(CliReporter)));
    ctx.ktl_commit = commit;
    ctx
}

fn load_plan(path: &PathBuf) -> Result<StackPlan> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    let plan: StackPlan = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse plan {}", path.display()))?;
    store::validate_schema_version(&plan.plan_version, ktl_stack::plan::CURRENT_PLAN_VERSION)?;
    Ok(plan)
}

fn print_review(ctx: &RuntimeContext, plan: &StackPlan) -> Result<()> {
    eprintln!("[info] computing stack diff for review...");
    let summary = build_stack_diff_summary(ctx, plan, &Default::default(), &plan.plan_hash)?;
    for (id, diff) in &summary.nodes {
        let risky = if diff.risky.is_empty() {
            String::new()
        } else {
            let kinds: Vec<String> = diff
                .risky
                .iter()
                .map(|(kind, count)| format!("{kind}×{count}"))
                .collect();
            format!("  [risky: {}]", kinds.join(", "))
        };
        eprintln!(
            "  {:<30} +{} ~{} !{} -{}{risky}",
            id.as_str(),
            diff.add,
            diff.change,
            diff.replace,
            diff.destroy
        );
    }
    Ok(())
}

fn execute(
    ctx: &RuntimeContext,
    plan: StackPlan,
    opts: &RunOptions,
    no_console: bool,
) -> Result<()> {
    let interactive = !no_console && atty::is(atty::Stream::Stdout);
    let width = terminal_width();
    let observers: Vec<Box<dyn Observer>> = vec![Box::new(ConsoleRenderer::new(
        Box::new(std::io::stdout()),
        width,
        interactive,
        interactive,
    ))];

    let report = engine::run(ctx, plan, opts, observers)?;

    match report.status {
        RunStatus::Succeeded => {
            eprintln!("[info] run {} succeeded", report.run_id);
            Ok(())
        }
        RunStatus::Failed => bail!("run {} failed; see {}", report.run_id, report.run_root.display()),
        RunStatus::Canceled => bail!("run {} was canceled", report.run_id),
    }
}

fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|cols| cols.parse().ok())
        .unwrap_or(100)
}
