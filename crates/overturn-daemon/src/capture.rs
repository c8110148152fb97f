//! Capture rules.
//!
//! Locally originated traffic towards a member address is marked in the
//! mangle table so policy routing sends it into the tunnel link:
//!
//! ```text
//! OUTPUT ──▶ OVERTURN_CAPTURE
//!              ! dst in ipset  ──▶ RETURN
//!              -p icmp         ──▶ RETURN
//!              MARK --set-mark 0x66
//!              RETURN
//! ```

use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::CaptureConfig;

/// Comment attached to the OUTPUT jump
const OUTPUT_COMMENT: &str = "Overturn mark traffics";

/// Capture-rule errors
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The tool could not be executed
    #[error("cannot run {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and reported failure
    #[error("`{command}` failed ({status}): {stderr}")]
    Failed {
        /// Full command line
        command: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },
}

impl CaptureError {
    /// Whether the failure only reports an object that is already gone
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::Failed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                ["does not exist", "no chain", "no such file", "bad rule", "doesn't exist"]
                    .iter()
                    .any(|pattern| stderr.contains(pattern))
            }
        }
    }
}

/// Programs OS packet-marking rules for the member set
pub trait CaptureRules: Send + Sync {
    /// Install rules capturing traffic to `member_ips`, replacing any
    /// previous set
    ///
    /// # Errors
    ///
    /// Returns the first failing rule command.
    fn install(&self, member_ips: &[Ipv4Addr]) -> Result<(), CaptureError>;

    /// Remove every installed rule
    ///
    /// # Errors
    ///
    /// Returns the first failure that is not about an absent object.
    fn clear(&self) -> Result<(), CaptureError>;
}

/// Capture disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapture;

impl CaptureRules for NoCapture {
    fn install(&self, _member_ips: &[Ipv4Addr]) -> Result<(), CaptureError> {
        Ok(())
    }

    fn clear(&self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Runs one external command
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, failing on non-zero exit
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Spawn` or `CaptureError::Failed`.
    fn run(&self, program: &str, args: &[String]) -> Result<(), CaptureError>;
}

/// Runs commands with `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<(), CaptureError> {
        debug!(program, args = %args.join(" "), "Running capture command");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| CaptureError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::Failed {
                command: format!("{program} {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// iptables + ipset capture rules, with optional policy routing
pub struct IptablesCapture {
    runner: Arc<dyn CommandRunner>,
    chain: String,
    ipset: String,
    mark: u32,
    route_table: Option<u32>,
    link: String,
}

impl IptablesCapture {
    /// Capture rules for traffic leaving through `link`
    pub fn new(config: &CaptureConfig, link: &str) -> Self {
        Self::with_runner(config, link, Arc::new(SystemRunner))
    }

    /// Same as [`IptablesCapture::new`] with a custom command runner
    pub fn with_runner(config: &CaptureConfig, link: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            chain: config.chain.clone(),
            ipset: config.ipset.clone(),
            mark: config.mark,
            route_table: config.route_table,
            link: link.to_string(),
        }
    }

    fn mark_arg(&self) -> String {
        format!("0x{:x}", self.mark)
    }

    fn output_rule(&self) -> Vec<String> {
        args(&["-m", "comment", "--comment", OUTPUT_COMMENT, "-j", &self.chain])
    }

    fn iptables(&self, command: &[&str], rule: &[String]) -> Result<(), CaptureError> {
        let mut full = args(&["-t", "mangle"]);
        full.extend(args(command));
        full.extend_from_slice(rule);
        self.runner.run("iptables", &full)
    }

    fn ipset(&self, command: &[&str]) -> Result<(), CaptureError> {
        self.runner.run("ipset", &args(command))
    }

    fn ip(&self, command: &[&str]) -> Result<(), CaptureError> {
        self.runner.run("ip", &args(command))
    }

    fn try_install(&self, member_ips: &[Ipv4Addr]) -> Result<(), CaptureError> {
        self.ipset(&["create", &self.ipset, "hash:ip", "-exist"])?;
        self.ipset(&["flush", &self.ipset])?;
        for ip in member_ips {
            self.ipset(&["add", &self.ipset, &ip.to_string(), "-exist"])?;
        }

        match self.iptables(&["-F", &self.chain], &[]) {
            Ok(()) => {}
            Err(e) if e.is_absent() => self.iptables(&["-N", &self.chain], &[])?,
            Err(e) => return Err(e),
        }
        let chain = self.chain.as_str();
        self.iptables(
            &["-A", chain],
            &args(&["-m", "set", "!", "--match-set", &self.ipset, "dst", "-j", "RETURN"]),
        )?;
        self.iptables(&["-A", chain], &args(&["-p", "icmp", "-j", "RETURN"]))?;
        self.iptables(
            &["-A", chain],
            &args(&["-j", "MARK", "--set-mark", &self.mark_arg()]),
        )?;
        self.iptables(&["-A", chain], &args(&["-j", "RETURN"]))?;

        let output_rule = self.output_rule();
        match self.iptables(&["-C", "OUTPUT"], &output_rule) {
            Ok(()) => {}
            Err(CaptureError::Failed { .. }) => {
                self.iptables(&["-I", "OUTPUT", "1"], &output_rule)?;
            }
            Err(e) => return Err(e),
        }

        if let Some(table) = self.route_table {
            let table = table.to_string();
            let mark = self.mark_arg();
            // Drop a rule left by a previous install so it is not duplicated
            match self.ip(&["rule", "del", "fwmark", &mark, "table", &table]) {
                Ok(()) => {}
                Err(e) if e.is_absent() => {}
                Err(e) => return Err(e),
            }
            self.ip(&["rule", "add", "fwmark", &mark, "table", &table])?;
            self.ip(&["route", "replace", "default", "dev", &self.link, "table", &table])?;
        }
        Ok(())
    }
}

impl CaptureRules for IptablesCapture {
    fn install(&self, member_ips: &[Ipv4Addr]) -> Result<(), CaptureError> {
        match self.try_install(member_ips) {
            Ok(()) => {
                info!(
                    chain = %self.chain,
                    ipset = %self.ipset,
                    members = member_ips.len(),
                    "Capture rules installed"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Cannot apply capture rules");
                if let Err(cleanup) = self.clear() {
                    error!(error = %cleanup, "Capture rule cleanup failed");
                }
                Err(e)
            }
        }
    }

    fn clear(&self) -> Result<(), CaptureError> {
        let mut first = None;
        let mut keep = |result: Result<(), CaptureError>| match result {
            Err(e) if !e.is_absent() => {
                error!(error = %e, "Capture rule removal failed");
                first.get_or_insert(e);
            }
            _ => {}
        };

        keep(self.iptables(&["-D", "OUTPUT"], &self.output_rule()));
        keep(self.iptables(&["-F", &self.chain], &[]));
        keep(self.iptables(&["-X", &self.chain], &[]));
        if let Some(table) = self.route_table {
            let table = table.to_string();
            keep(self.ip(&["rule", "del", "fwmark", &self.mark_arg(), "table", &table]));
            keep(self.ip(&["route", "flush", "table", &table]));
        }
        keep(self.ipset(&["destroy", &self.ipset]));

        match first {
            Some(e) => Err(e),
            None => {
                debug!(chain = %self.chain, "Capture rules cleared");
                Ok(())
            }
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records command lines; commands starting with a listed prefix fail
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        failures: Vec<(&'static str, &'static str)>,
    }

    impl RecordingRunner {
        fn failing(failures: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<(), CaptureError> {
            let line = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            match self.failures.iter().find(|(prefix, _)| line.starts_with(prefix)) {
                Some((_, stderr)) => Err(CaptureError::Failed {
                    command: line,
                    status: "exit status: 1".to_string(),
                    stderr: (*stderr).to_string(),
                }),
                None => Ok(()),
            }
        }
    }

    fn capture(runner: &Arc<RecordingRunner>, route_table: Option<u32>) -> IptablesCapture {
        let config = CaptureConfig {
            route_table,
            ..Default::default()
        };
        IptablesCapture::with_runner(&config, "ovt0", Arc::clone(runner) as Arc<dyn CommandRunner>)
    }

    #[test]
    fn test_install_sequence() {
        let runner = Arc::new(RecordingRunner::failing(vec![(
            "iptables -t mangle -C OUTPUT",
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        )]));
        let ips = [Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 4)];
        capture(&runner, None).install(&ips).unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "ipset create overturned hash:ip -exist",
                "ipset flush overturned",
                "ipset add overturned 10.0.0.3 -exist",
                "ipset add overturned 10.0.0.4 -exist",
                "iptables -t mangle -F OVERTURN_CAPTURE",
                "iptables -t mangle -A OVERTURN_CAPTURE -m set ! --match-set overturned dst -j RETURN",
                "iptables -t mangle -A OVERTURN_CAPTURE -p icmp -j RETURN",
                "iptables -t mangle -A OVERTURN_CAPTURE -j MARK --set-mark 0x66",
                "iptables -t mangle -A OVERTURN_CAPTURE -j RETURN",
                "iptables -t mangle -C OUTPUT -m comment --comment Overturn mark traffics -j OVERTURN_CAPTURE",
                "iptables -t mangle -I OUTPUT 1 -m comment --comment Overturn mark traffics -j OVERTURN_CAPTURE",
            ]
        );
    }

    #[test]
    fn test_install_creates_missing_chain_once() {
        let runner = Arc::new(RecordingRunner::failing(vec![(
            "iptables -t mangle -F",
            "iptables: No chain/target/match by that name.",
        )]));
        capture(&runner, None).install(&[]).unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"iptables -t mangle -N OVERTURN_CAPTURE".to_string()));
        // The OUTPUT jump already exists
        assert!(!calls.iter().any(|c| c.contains("-I OUTPUT")));
    }

    #[test]
    fn test_install_with_route_table() {
        let runner = Arc::new(RecordingRunner::failing(vec![(
            "ip rule del",
            "RTNETLINK answers: No such file or directory",
        )]));
        capture(&runner, Some(94)).install(&[Ipv4Addr::new(10, 0, 0, 3)]).unwrap();

        let calls = runner.calls();
        let tail = &calls[calls.len() - 3..];
        assert_eq!(
            tail,
            [
                "ip rule del fwmark 0x66 table 94",
                "ip rule add fwmark 0x66 table 94",
                "ip route replace default dev ovt0 table 94",
            ]
        );
    }

    #[test]
    fn test_install_failure_clears() {
        let runner = Arc::new(RecordingRunner::failing(vec![(
            "iptables -t mangle -A OVERTURN_CAPTURE -p icmp",
            "iptables: Permission denied",
        )]));
        let err = capture(&runner, None).install(&[]).unwrap_err();
        assert!(!err.is_absent());

        let calls = runner.calls();
        assert!(calls.contains(&"iptables -t mangle -X OVERTURN_CAPTURE".to_string()));
        assert_eq!(calls.last().unwrap(), "ipset destroy overturned");
    }

    #[test]
    fn test_clear_ignores_absent_objects() {
        let runner = Arc::new(RecordingRunner::failing(vec![
            ("iptables -t mangle -D OUTPUT", "iptables: Bad rule (does a matching rule exist in that chain?)."),
            ("iptables -t mangle -F", "iptables: No chain/target/match by that name."),
            ("iptables -t mangle -X", "iptables: No chain/target/match by that name."),
            ("ipset destroy", "ipset v7.15: The set with the given name does not exist"),
        ]));
        capture(&runner, None).clear().unwrap();
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn test_clear_continues_after_failure() {
        let runner = Arc::new(RecordingRunner::failing(vec![(
            "iptables -t mangle -D OUTPUT",
            "iptables: Permission denied",
        )]));
        let err = capture(&runner, Some(7)).clear().unwrap_err();
        assert!(matches!(err, CaptureError::Failed { .. }));
        assert_eq!(runner.calls().len(), 6);
    }

    #[test]
    fn test_no_capture() {
        assert!(NoCapture.install(&[Ipv4Addr::LOCALHOST]).is_ok());
        assert!(NoCapture.clear().is_ok());
    }
}
