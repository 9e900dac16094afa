//! CLI argument parsing for the verification harness.
//!
//! The CLI only wires the library together; every policy decision lives in
//! the config file or the catalog.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vmh",
    version,
    about = "Verification harness for an external analysis engine",
    after_help = "Commands:\n  run --catalog <file> --out <dir>           Execute cases and write report.json/report.txt\n  check --catalog <file>                     Validate catalog and config without running\n  diff --baseline <file> --current <file>    Compare two run reports\n  promote --report <file> --baseline <file>  Replace a baseline with a run report\n  history --out <dir>                        List past runs from history.jsonl\n  init-config                                Write the default config file\n\nExit status:\n  0 all results PASS, 1 verification failures, 2 harness/infrastructure error, 130 interrupted\n\nExamples:\n  vmh run --catalog cases/catalog.json --out out/\n  vmh run --catalog cases/catalog.json --out out/ --case beam-bend-1 --baseline baseline.json\n  vmh diff --baseline baseline.json --current out/report.json --fail-on-regression",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Emit debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Check(CheckArgs),
    Diff(DiffArgs),
    Promote(PromoteArgs),
    History(HistoryArgs),
    InitConfig(InitConfigArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Run verification cases against the engine")]
pub struct RunArgs {
    /// Case catalog JSON
    #[arg(long, value_name = "FILE")]
    pub catalog: PathBuf,

    /// Harness config JSON (default: $VMH_CONFIG, then the user config file)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output directory for report.json, report.txt, history.jsonl, diff.json
    #[arg(long, value_name = "DIR", default_value = "vmh-out")]
    pub out: PathBuf,

    /// Run only the named case (repeatable)
    #[arg(long = "case", value_name = "ID")]
    pub cases: Vec<String>,

    /// Baseline report to diff against
    #[arg(long, value_name = "FILE")]
    pub baseline: Option<PathBuf>,

    /// Replace the baseline with this run's report
    #[arg(long, requires = "baseline")]
    pub promote: bool,

    /// Worker threads (default: pool capacity)
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Abort remaining cases after the first non-passing case
    #[arg(long)]
    pub fail_fast: bool,

    /// Print the JSON report to stdout instead of the table
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Validate the catalog and config without running anything")]
pub struct CheckArgs {
    /// Case catalog JSON
    #[arg(long, value_name = "FILE")]
    pub catalog: PathBuf,

    /// Harness config JSON
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Compare a run report against a baseline")]
pub struct DiffArgs {
    #[arg(long, value_name = "FILE")]
    pub baseline: PathBuf,

    #[arg(long, value_name = "FILE")]
    pub current: PathBuf,

    /// Also write diff.json into this directory
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Exit 1 only when regressions exist
    #[arg(long)]
    pub fail_on_regression: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Promote a run report to be the new baseline")]
pub struct PromoteArgs {
    #[arg(long, value_name = "FILE")]
    pub report: PathBuf,

    #[arg(long, value_name = "FILE")]
    pub baseline: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "List past runs recorded in an output directory")]
pub struct HistoryArgs {
    /// Output directory holding history.jsonl
    #[arg(long, value_name = "DIR", default_value = "vmh-out")]
    pub out: PathBuf,

    /// Show only the most recent N runs
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Write the default harness config")]
pub struct InitConfigArgs {
    /// Destination (default: the user config file)
    #[arg(long, value_name = "FILE")]
    pub path: Option<PathBuf>,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
