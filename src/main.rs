//! taskctx - CLI

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use taskctx::runtime::scheduler::{Scheduler, SchedulerConfig};
use taskctx::scenarios::{self, Scenario, ScenarioOptions, Transcript};
use taskctx::util::config::{self, RuntimeConfig};
use taskctx::util::logger::{self, LogLevel};
use taskctx::{NAME, VERSION};

/// Upper bound for `--iterations`.
const MAX_ITERATIONS: u16 = 1000;

/// Reproduce failure propagation and context-affinity deadlocks of async tasks
#[derive(Parser, Debug)]
#[command(name = "taskctx")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.config/taskctx/config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Simulated I/O latency in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 200, global = true)]
    step_ms: u64,

    /// Number of actions (try-finally) and computations (compute)
    #[arg(
        long,
        value_name = "N",
        default_value_t = 4,
        global = true,
        value_parser = clap::value_parser!(u16).range(..=MAX_ITERATIONS as i64)
    )]
    iterations: u16,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// A task awaits a failing task and catches the error
    Captured,

    /// A fire-and-forget task fails; only the unobserved-failure sink sees it
    FireAndForget,

    /// Block on a pooled task from outside the runtime; the error comes back
    PooledWait,

    /// Block an affine "ui" worker on a task that needs that worker
    AffineDeadlock {
        /// Report the stall after this many milliseconds
        #[arg(long, value_name = "MS", default_value_t = 300)]
        stall_ms: u64,
    },

    /// Block in a cleanup path of actions running on an affine context
    TryFinally {
        /// Resume the cleanup on the captured context (deadlocks)
        #[arg(long)]
        captured_context: bool,
    },

    /// Fire-and-forget driver awaiting a chain of computations
    Compute,

    /// Run every scenario
    All,

    /// Print the effective configuration
    Config,

    /// Print version information
    Version,
}

fn load_runtime_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let mut runtime_config = match path {
        Some(path) => config::load_config(path).with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => config::load_user_config().context("Failed to load user config")?,
    };
    runtime_config
        .apply_process_env()
        .context("Invalid environment override")?;
    Ok(runtime_config)
}

fn run_scenarios(
    selected: &[Scenario],
    scheduler_config: &SchedulerConfig,
    options: &ScenarioOptions,
) -> Result<()> {
    let scheduler = Scheduler::try_with_config_and_sink(scheduler_config.clone(), Default::default())
        .context("Failed to start scheduler")?;

    let mut failed = 0;
    for &scenario in selected {
        println!("{} {}", "==>".bold(), scenario.bold());
        let label = scenario.name();
        let transcript = Transcript::with_listener(move |line| {
            println!("  {} {}", format!("[{}]", label).dimmed(), line);
        });

        match scenarios::run(scenario, &scheduler.handle(), scheduler_config, &transcript, options) {
            Ok(()) => println!("{} {}\n", "ok".green(), scenario),
            Err(err) => {
                failed += 1;
                println!("{} {}: {:#}\n", "failed".red(), scenario, err);
            },
        }
    }

    scheduler.shutdown();
    if failed > 0 {
        anyhow::bail!("{} of {} scenarios failed", failed, selected.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime_config = load_runtime_config(args.config.as_ref())?;
    let level = if args.verbose {
        LogLevel::Debug
    } else {
        runtime_config.log_level().context("Invalid log level")?
    };
    logger::init_with_level(level);

    if args.verbose {
        eprintln!("{} version: {}", NAME, VERSION);
        eprintln!("Host: {}", std::env::consts::OS);
    }

    let scheduler_config = runtime_config
        .scheduler_config()
        .context("Invalid scheduler configuration")?;
    let mut options = ScenarioOptions {
        step: Duration::from_millis(args.step_ms),
        iterations: usize::from(args.iterations),
        ..ScenarioOptions::default()
    };

    let selected = match args.command {
        Commands::Captured => vec![Scenario::Captured],
        Commands::FireAndForget => vec![Scenario::FireAndForget],
        Commands::PooledWait => vec![Scenario::PooledWait],
        Commands::AffineDeadlock { stall_ms } => {
            options.stall_timeout = Duration::from_millis(stall_ms);
            vec![Scenario::AffineDeadlock]
        },
        Commands::TryFinally { captured_context } => {
            options.finally_on_captured_context = captured_context;
            vec![Scenario::TryFinally]
        },
        Commands::Compute => vec![Scenario::Compute],
        Commands::All => Scenario::ALL.to_vec(),
        Commands::Config => {
            let rendered = toml::to_string_pretty(&runtime_config).context("Failed to render config")?;
            println!("{}", rendered);
            return Ok(());
        },
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
            return Ok(());
        },
    };

    run_scenarios(&selected, &scheduler_config, &options)
}
