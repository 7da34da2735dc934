#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args, clippy::cast_possible_truncation)]

mod scan;

use crate::scan::{Options, Scanner, SHOCKWAVE_NARROW, SHOCKWAVE_WIDE};
use anyhow::{bail, Context, Result};
use argh::FromArgs;
use env_logger::Env;
use read_process_memory::Pid;
use std::io::BufRead;
use std::process::Command;
use std::time::Duration;

#[derive(FromArgs)]
/// Attach to a process and scan its memory for RC4 substitution tables.
struct Args {
    /// enable verbose logging output
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// name passed to pgrep when no pid is given
    #[argh(option)]
    process: Option<String>,

    /// restrict the scan to one entry stride, 4 or 8 (default: both)
    #[argh(option)]
    stride: Option<usize>,

    /// skip memory regions larger than this many bytes
    #[argh(option)]
    max_region_size: Option<u64>,

    /// number of scan workers (default: min of cpu count and 4)
    #[argh(option)]
    jobs: Option<usize>,

    /// give up after this many seconds, keeping tables found so far
    #[argh(option)]
    timeout: Option<u64>,

    /// process ID of the target process
    #[argh(positional)]
    pid: Option<Pid>,
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    env_logger::Builder::from_env(Env::default().default_filter_or(if args.verbose {
        "sboxscan=debug"
    } else {
        "sboxscan=info"
    }))
    .init();

    let pid = if let Some(pid) = args.pid {
        pid
    } else if let Some(process) = &args.process {
        let output = Command::new("pgrep")
            .args(["-n", process])
            .output()
            .context("failed to run pgrep")?;
        if output.status.success() {
            output
                .stdout
                .lines()
                .next()
                .expect("pgrep returned 0 with no output")
                .expect("pgrep output invalid UTF-8")
                .parse()?
        } else if output.status.code() == Some(1) {
            bail!("no {} process found", process);
        } else {
            bail!("pgrep failed with {}", output.status);
        }
    } else {
        bail!("either a pid or --process is required");
    };

    let mut options = Options::default();
    if let Some(stride) = args.stride {
        options.layouts = match stride {
            8 => vec![SHOCKWAVE_WIDE],
            4 => vec![SHOCKWAVE_NARROW],
            other => bail!("unsupported stride {}", other),
        };
    }
    options.max_region_size = args.max_region_size;
    if let Some(jobs) = args.jobs {
        options.jobs = jobs.max(1);
    }
    options.timeout = args.timeout.map(Duration::from_secs);

    let scanner = Scanner::attach(pid)?;
    for finding in scanner.scan(&options) {
        log::debug!(
            "table at {:x} in region starting {:x}",
            finding.address,
            finding.region
        );
        println!("{}", hex::encode(finding.table));
    }

    Ok(())
}
