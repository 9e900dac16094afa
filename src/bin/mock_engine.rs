//! Line-protocol double of the analysis engine.
//!
//! Reads one command per stdin line and prints the reply followed by the
//! ready marker. Used by the CLI integration tests and for dry runs.
use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;
use vm_harness::engine::{MockInterpreter, MockStep};

#[derive(Parser, Debug)]
#[command(name = "vmh-mock-engine", version, about = "Mock analysis engine for harness tests")]
struct Args {
    /// Line printed after the banner and after every reply
    #[arg(long, default_value = "%%READY%%")]
    ready_marker: String,

    /// Delay applied before every reply
    #[arg(long, value_name = "MS", default_value_t = 0)]
    latency_ms: u64,

    /// Exit with status 1 before printing the banner
    #[arg(long)]
    fail_start: bool,
}

fn emit(out: &mut impl Write, lines: &[String], marker: &str) -> io::Result<()> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    writeln!(out, "{marker}")?;
    out.flush()
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.fail_start {
        eprintln!("mock engine: license unavailable");
        std::process::exit(1);
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    emit(&mut out, &MockInterpreter::banner(), &args.ready_marker).context("write banner")?;

    let mut interpreter = MockInterpreter::new();
    let latency = Duration::from_millis(args.latency_ms);
    for line in stdin.lock().lines() {
        let line = line.context("read command")?;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let lines = match interpreter.execute(&line) {
            MockStep::Reply(lines) => lines,
            MockStep::Wait(duration, lines) => {
                thread::sleep(duration);
                lines
            }
            MockStep::Exit => break,
        };
        if emit(&mut out, &lines, &args.ready_marker).is_err() {
            // Harness went away.
            break;
        }
    }
    Ok(())
}
