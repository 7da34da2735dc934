//! Stream every readable mapping of a process to stdout, back to back, for
//! offline analysis. Mappings that fail to read are emitted as zeros so
//! offsets within a mapping stay stable.

use read_process_memory::{CopyAddress, Pid, ProcessHandle};
use std::io::{BufRead, BufReader, Write};

fn main() {
    let pid: Pid = std::env::args()
        .nth(1)
        .expect("usage: sboxscan-dump PID")
        .parse()
        .expect("could not parse pid");
    let handle = ProcessHandle::try_from(pid).expect("could not get handle from pid");
    let maps = std::fs::File::open(format!("/proc/{}/maps", pid)).expect("could not open maps");

    let mut stdout = std::io::stdout().lock();
    for line in BufReader::new(maps).lines() {
        let line = line.expect("could not read maps");
        let Some((range, rest)) = line.split_once(' ') else {
            continue;
        };
        if !rest.starts_with('r') {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let start = usize::from_str_radix(start, 16).expect("bad start address");
        let end = usize::from_str_radix(end, 16).expect("bad end address");
        if end <= start {
            continue;
        }

        let mut buf = vec![0; end - start];
        if handle.copy_address(start, &mut buf).is_err() {
            buf.fill(0);
        }
        stdout.write_all(&buf).unwrap();
    }
}
