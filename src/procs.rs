use std::fs;
use std::io::Read;

use libc::pid_t;

/// Enumerate the PIDs whose command name matches `command` exactly, the way
/// `ps -C <command> -o pid` would. Processes that vanish mid-scan are
/// skipped; an unreadable process table just yields an empty set, which the
/// reconciler treats as "target not up yet".
pub fn pids_for_command(command: &str) -> Vec<pid_t> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read the process table: {}", e);
            return Vec::new();
        }
    };

    let mut pids = Vec::new();

    for entry in entries.filter_map(|e| e.ok()) {
        let pid: pid_t = match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let mut comm = String::new();
        let path = format!("/proc/{}/comm", pid);
        match fs::File::open(&path).and_then(|mut f| f.read_to_string(&mut comm)) {
            Ok(_) => {
                if comm.trim_right() == command {
                    pids.push(pid);
                }
            }
            Err(_) => continue,
        }
    }

    pids.sort();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_ourselves_by_comm() {
        let mut comm = String::new();
        ::std::fs::File::open("/proc/self/comm")
            .and_then(|mut f| f.read_to_string(&mut comm))
            .unwrap();
        let pids = pids_for_command(comm.trim_right());
        assert!(pids.contains(&(::std::process::id() as pid_t)));
    }

    #[test]
    fn unmatched_command_is_empty() {
        assert_eq!(
            pids_for_command("surely-not-a-real-command-name"),
            Vec::<pid_t>::new()
        );
    }
}
