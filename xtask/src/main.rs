use std::process::{exit, Command};

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the simulation kernel workspace",
    long_about = "Runs the demo scenario, the parameter sweep, kernel benchmarks\n\
                  and CI checks for the simulation kernel workspace."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SIR demo scenario
    Run,
    /// Run the SIR parameter sweep experiment
    Sweep,
    /// Run the kernel benchmarks, optionally one group only
    Bench {
        #[arg(value_enum)]
        group: Option<BenchGroup>,
    },
    /// Record a named Criterion baseline, or compare against one
    Baseline {
        /// Baseline name under target/criterion
        #[arg(default_value = "main")]
        name: String,
        /// Compare against the baseline instead of overwriting it
        #[arg(long)]
        compare: bool,
        #[arg(long, value_enum)]
        group: Option<BenchGroup>,
    },
    /// Run CI checks
    Ci {
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
}

/// Groups defined in `sim_core/benches/performance.rs`.
#[derive(Clone, Copy, ValueEnum)]
enum BenchGroup {
    PlanQueue,
    Dispatch,
    Partitions,
}

impl BenchGroup {
    fn filter(self) -> &'static str {
        match self {
            BenchGroup::PlanQueue => "plan_queue",
            BenchGroup::Dispatch => "dispatch",
            BenchGroup::Partitions => "partitions",
        }
    }
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy and tests
    Check,
    /// Run both examples
    Examples,
    /// Run the benchmarks
    Bench,
    /// All of the above
    All,
}

/// Runs `cargo` with `args`, exiting with its status on failure.
fn cargo(label: &str, args: &[&str]) {
    eprintln!("\n=== {label} ===");
    eprintln!("+ cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status().unwrap_or_else(|error| {
        eprintln!("failed to execute cargo: {error}");
        exit(1)
    });
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn run_example(package: &str, example: &str) {
    cargo(
        &format!("Run {example}"),
        &["run", "-p", package, "--example", example, "--release"],
    );
}

/// `cargo bench` on the kernel benches, with extra Criterion arguments.
fn bench(label: &str, group: Option<BenchGroup>, criterion_args: &[&str]) {
    let mut args = vec!["bench", "-p", "sim_core", "--bench", "performance", "--"];
    if let Some(group) = group {
        args.push(group.filter());
    }
    args.extend_from_slice(criterion_args);
    cargo(label, &args);
}

fn ci_check() {
    cargo("Check formatting", &["fmt", "--all", "--", "--check"]);
    cargo(
        "Clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
    );
    cargo("Test workspace", &["test", "--workspace"]);
}

fn ci_examples() {
    run_example("sim_core", "scenario_run");
    run_example("sim_experiments", "parameter_sweep");
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_example("sim_core", "scenario_run"),
        Commands::Sweep => run_example("sim_experiments", "parameter_sweep"),
        Commands::Bench { group } => bench("Benchmarks", group, &[]),
        Commands::Baseline {
            name,
            compare,
            group,
        } => {
            if compare {
                bench(&format!("Compare against {name}"), group, &["--baseline", name.as_str()]);
            } else {
                bench(&format!("Save baseline {name}"), group, &["--save-baseline", name.as_str()]);
            }
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Check => ci_check(),
                CiJob::Examples => ci_examples(),
                CiJob::Bench => bench("Benchmarks", None, &[]),
                CiJob::All => {
                    ci_check();
                    ci_examples();
                    bench("Benchmarks", None, &[]);
                }
            }
            eprintln!("\nCI job passed.");
        }
    }
}
