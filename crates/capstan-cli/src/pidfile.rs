//! The plain-text worker PID registry: one PID per line.
//!
//! `worker start` appends the PIDs it spawns, `worker stop` signals and then
//! removes the file, and `status` probes which recorded PIDs are still
//! alive. The file is advisory bookkeeping for the process manager, not
//! queue state; a stale entry costs nothing but a failed probe.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Default registry location, next to the store file.
pub const PID_FILE: &str = ".capstan.pid";

pub fn append(path: &Path, pids: &[u32]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for pid in pids {
        writeln!(file, "{pid}")?;
    }
    Ok(())
}

/// Recorded PIDs. A missing file is an empty registry; unparseable lines are
/// skipped.
pub fn read(path: &Path) -> std::io::Result<Vec<u32>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(contents
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

pub fn clear(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether `pid` names a live process (signal 0 probe).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Send SIGTERM, requesting a cooperative shutdown.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_clear_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE);

        assert!(read(&path).unwrap().is_empty());

        append(&path, &[101, 102]).unwrap();
        append(&path, &[103]).unwrap();
        assert_eq!(read(&path).unwrap(), vec![101, 102, 103]);

        clear(&path).unwrap();
        assert!(read(&path).unwrap().is_empty());
        // Clearing an absent file is fine.
        clear(&path).unwrap();
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PID_FILE);
        std::fs::write(&path, "123\nnot-a-pid\n 456 \n").unwrap();
        assert_eq!(read(&path).unwrap(), vec![123, 456]);
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
        // Far above any kernel pid_max, so the probe must miss.
        assert!(!is_alive(999_999_999));
    }
}
