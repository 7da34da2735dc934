//! Attaching to a target process and driving the table scan.
//!
//! The scan proper is a pipeline per region: enumerate the target's
//! readable mappings, pull one mapping at a time into a local buffer with a
//! single bulk cross-process read, then sweep the buffer once per entry
//! layout and alignment probe. Regions are independent, so a small worker
//! pool processes them concurrently; every worker fully buffers the region
//! it holds, which is why the pool is bounded well below core count.

mod detect;
mod maps;

pub(crate) use detect::{EntryLayout, SHOCKWAVE_NARROW, SHOCKWAVE_WIDE};

use crate::scan::maps::Region;
use anyhow::{Context, Result};
use debug_ignore::DebugIgnore;
use read_process_memory::{CopyAddress, Pid, ProcessHandle};
use std::time::{Duration, Instant};

/// A table recovered from the target, tagged with where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Finding {
    /// Start address of the mapping the table was found in.
    pub(crate) region: u64,
    /// Absolute address of the table's first entry unit.
    pub(crate) address: u64,
    pub(crate) table: [u8; detect::TABLE_LEN],
}

#[derive(Debug, Clone)]
pub(crate) struct Options {
    /// Entry layouts to sweep, in reporting order.
    pub(crate) layouts: Vec<EntryLayout>,
    /// Skip mappings larger than this many bytes.
    pub(crate) max_region_size: Option<u64>,
    /// Worker threads; each fully buffers one region at a time.
    pub(crate) jobs: usize,
    /// Overall deadline. Regions not yet dispatched when it passes are
    /// dropped; tables already recovered are still returned.
    pub(crate) timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            layouts: vec![SHOCKWAVE_WIDE, SHOCKWAVE_NARROW],
            max_region_size: None,
            jobs: default_jobs(),
            timeout: None,
        }
    }
}

fn default_jobs() -> usize {
    // Memory-bound, not CPU-bound: every in-flight region is held in full.
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .min(4)
}

#[derive(Debug)]
pub(crate) struct Scanner {
    pid: Pid,
    handle: DebugIgnore<ProcessHandle>,
}

impl Scanner {
    /// Attach to a running process. Failure here (no such process, no
    /// handle) is the one unrecoverable condition of a scan.
    pub(crate) fn attach(pid: Pid) -> Result<Scanner> {
        std::fs::metadata(format!("/proc/{}", pid))
            .with_context(|| format!("no process with pid {}", pid))?;
        let handle = ProcessHandle::try_from(pid)
            .with_context(|| format!("failed to get handle for pid {}", pid))?;
        log::info!("attached to pid {}", pid);
        Ok(Scanner {
            pid,
            handle: DebugIgnore(handle),
        })
    }

    /// Sweep every readable mapping of the target and collect recovered
    /// tables in mapping order. Per-region failures are absorbed; a target
    /// whose maps have vanished simply yields nothing.
    pub(crate) fn scan(&self, options: &Options) -> Vec<Finding> {
        let regions = maps::regions(self.pid, options.max_region_size);
        let total = regions.len();
        log::info!("enumerated {} regions of pid {}", total, self.pid);

        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let layouts = &options.layouts[..];
        let pid = self.pid;

        if options.jobs <= 1 {
            let mut findings = Vec::new();
            for (index, region) in regions.iter().enumerate() {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    log::warn!(
                        "scan deadline reached with {} of {} regions pending",
                        total - index,
                        total
                    );
                    break;
                }
                findings.extend(scan_region(&self.handle, region, layouts));
            }
            return findings;
        }

        let (job_tx, job_rx) = crossbeam_channel::bounded::<(usize, Region)>(options.jobs);
        let (finding_tx, finding_rx) = crossbeam_channel::unbounded();

        let mut per_region: Vec<(usize, Vec<Finding>)> = std::thread::scope(|scope| {
            for _ in 0..options.jobs {
                let job_rx = job_rx.clone();
                let finding_tx = finding_tx.clone();
                scope.spawn(move || {
                    // Each worker holds its own handle so no state is
                    // shared across regions.
                    let handle = match ProcessHandle::try_from(pid) {
                        Ok(handle) => handle,
                        Err(err) => {
                            log::warn!("worker could not reopen pid {}: {}", pid, err);
                            for (index, _) in job_rx {
                                finding_tx.send((index, Vec::new())).ok();
                            }
                            return;
                        }
                    };
                    for (index, region) in job_rx {
                        finding_tx.send((index, scan_region(&handle, &region, layouts))).ok();
                    }
                });
            }
            drop(job_rx);
            drop(finding_tx);

            for (index, region) in regions.into_iter().enumerate() {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    log::warn!(
                        "scan deadline reached with {} of {} regions pending",
                        total - index,
                        total
                    );
                    break;
                }
                if job_tx.send((index, region)).is_err() {
                    break;
                }
            }
            drop(job_tx);

            finding_rx.into_iter().collect()
        });

        // Workers finish out of order; restore mapping-list order.
        per_region.sort_by_key(|entry| entry.0);
        per_region
            .into_iter()
            .flat_map(|(_, findings)| findings)
            .collect()
    }
}

/// Acquire one region and sweep it with every configured layout and
/// alignment probe. A region that cannot be read is logged and skipped;
/// the target may have unmapped it or changed its protection since
/// enumeration, and a retry would be no less racy.
fn scan_region(handle: &ProcessHandle, region: &Region, layouts: &[EntryLayout]) -> Vec<Finding> {
    let buf = match read_region(handle, region) {
        Ok(buf) => buf,
        Err(err) => {
            log::debug!(
                "skipping region {:x}-{:x}: {:#}",
                region.start,
                region.end,
                err
            );
            return Vec::new();
        }
    };

    let mut findings = Vec::new();
    for layout in layouts {
        for offset in layout.offsets() {
            for table in detect::tables(&buf, *layout, offset) {
                findings.push(Finding {
                    region: region.start,
                    address: region.start + table.offset as u64,
                    table: table.bytes,
                });
            }
        }
    }
    findings
}

/// Point-in-time copy of one region as a single bulk transfer. Anything
/// short of a full read is a failure and the buffer is discarded.
fn read_region(handle: &ProcessHandle, region: &Region) -> Result<Vec<u8>> {
    let start = usize::try_from(region.start).context("region start out of address range")?;
    let size = usize::try_from(region.size()).context("region size out of address range")?;
    let mut buf = vec![0u8; size];
    handle
        .copy_address(start, &mut buf)
        .with_context(|| format!("read of {:x}-{:x} failed", region.start, region.end))?;
    Ok(buf)
}
