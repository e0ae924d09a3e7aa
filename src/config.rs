use std::time::Duration;

use libc;

use error::{Error, Result};

/// How often the reconciler re-reads the target's thread set.
pub const DEFAULT_INTERVAL_MS: u64 = 250;

/// How many reconciler-spaced attempts to find the target before giving up.
pub const DEFAULT_RETRIES: u32 = 10;

/// Everything the agent needs for one run:
/// `agent <threshold> <label> <command>`.
#[derive(Clone, Debug, Serialize)]
pub struct AgentConfig {
    /// Sampling period for the group leader, in counter units.
    pub threshold: u64,
    /// Names this run towards the collector; part of every socket path.
    pub label: String,
    /// Command name the target is found by in the process table.
    pub command: String,
    /// CPUs to cover; one counter group and one socket per CPU.
    pub cores: usize,
    pub interval_ms: u64,
    pub retries: u32,
}

impl AgentConfig {
    pub fn from_args<I: Iterator<Item = String>>(mut args: I) -> Result<Self> {
        let threshold = args
            .next()
            .ok_or_else(|| usage("missing threshold"))?
            .parse()
            .map_err(|_| usage("threshold must be an unsigned integer"))?;

        let label = args.next().ok_or_else(|| usage("missing label"))?;
        if label.is_empty() {
            return Err(usage("label must not be empty"));
        }

        let command = args.next().ok_or_else(|| usage("missing command"))?;
        if command.is_empty() {
            return Err(usage("command must not be empty"));
        }

        if args.next().is_some() {
            return Err(usage("too many arguments"));
        }

        Ok(AgentConfig {
            threshold,
            label,
            command,
            cores: online_cores(),
            interval_ms: DEFAULT_INTERVAL_MS,
            retries: DEFAULT_RETRIES,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn usage(reason: &str) -> Error {
    Error::Usage {
        reason: reason.to_string(),
    }
}

fn online_cores() -> usize {
    // NOTE(unsafe) a plain sysconf query
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_the_three_positionals() {
        let config =
            AgentConfig::from_args(args(&["1000000", "run-1", "stress"]).into_iter()).unwrap();
        assert_eq!(config.threshold, 1_000_000);
        assert_eq!(config.label, "run-1");
        assert_eq!(config.command, "stress");
        assert_eq!(config.interval_ms, 250);
        assert_eq!(config.retries, 10);
        assert!(config.cores >= 1);
    }

    #[test]
    fn rejects_missing_and_extra_arguments() {
        assert!(AgentConfig::from_args(args(&[]).into_iter()).is_err());
        assert!(AgentConfig::from_args(args(&["1000"]).into_iter()).is_err());
        assert!(AgentConfig::from_args(args(&["1000", "l"]).into_iter()).is_err());
        assert!(AgentConfig::from_args(args(&["1000", "l", "c", "extra"]).into_iter()).is_err());
    }

    #[test]
    fn rejects_a_malformed_threshold() {
        assert!(AgentConfig::from_args(args(&["1e6", "l", "c"]).into_iter()).is_err());
        assert!(AgentConfig::from_args(args(&["-5", "l", "c"]).into_iter()).is_err());
    }
}
