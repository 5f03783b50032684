//! Bring the relay device into a known state and launch the collaborators
//!
//! Steps, in order:
//! 1. kill stray readers of the serial device and old collaborator
//!    instances, remove stale capture and log files
//! 2. upload the capture program
//! 3. start the capture program detached, let it settle
//! 4. start the link-establishment program detached, let it settle
//! 5. list matching processes (report only)
//! 6. sample the tail of the link log
//!
//! Only connection-level failures stop provisioning. A command that exits
//! non-zero is logged as a warning and the next step runs anyway.

use super::logger::EventLog;
use super::transport::{shell_quote, CommandOutput, RemoteError, RemoteShell};
use crate::config::TestConfiguration;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Longest process line echoed to the event log
const PROCESS_LINE_WIDTH: usize = 100;

/// Lines of the link log sampled after startup
const LINK_LOG_TAIL_LINES: usize = 10;

/// Text of the capture program uploaded to the relay.
///
/// Opens `device` without claiming it exclusively so the link program can
/// open it too, reads small chunks with a short timeout and appends the
/// decoded text to `capture_file`, flushing after every chunk.
pub fn capture_script(device: &str, baud_rate: u32, capture_file: &str) -> String {
    let device = python_string(device);
    let capture_file = python_string(capture_file);
    format!(
        r#"import serial
import sys
import time

try:
    ser = serial.Serial({device}, {baud_rate}, timeout=0.5, exclusive=False)
    sys.stderr.write("Monitor opened port\n")
    sys.stderr.flush()

    with open({capture_file}, 'a') as f:
        while True:
            data = ser.read(100)
            if data:
                text = data.decode('utf-8', errors='ignore')
                f.write(text)
                f.flush()
                sys.stdout.write(text)
                sys.stdout.flush()
            time.sleep(0.01)
except Exception as e:
    sys.stderr.write(str(e) + "\n")
    sys.exit(1)
"#
    )
}

/// Double-quoted Python literal for `text`. JSON string escapes are a
/// subset of Python's, so control characters and quotes survive intact.
fn python_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

/// Extended regex matching `text` literally whose own spelling does not
/// match, so `pkill -f` never hits the shell that runs it.
fn process_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 4);
    for (i, c) in text.chars().enumerate() {
        match c {
            '\\' | ']' | '^' | '[' => {
                pattern.push('\\');
                pattern.push(c);
            }
            _ if i == 0 => {
                pattern.push('[');
                pattern.push(c);
                pattern.push(']');
            }
            '.' | '$' | '*' | '+' | '?' | '(' | ')' | '{' | '}' | '|' => {
                pattern.push('\\');
                pattern.push(c);
            }
            _ => pattern.push(c),
        }
    }
    pattern
}

/// What provisioning observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Warnings raised along the way
    pub warnings: Vec<String>,
    /// Matching process lines, truncated
    pub processes: Vec<String>,
    /// Initial tail of the link log
    pub link_log_tail: Vec<String>,
}

impl ProvisionReport {
    /// Whether verification saw any collaborator process
    pub fn processes_running(&self) -> bool {
        !self.processes.is_empty()
    }
}

/// Builds and runs the provisioning command sequence
pub struct Provisioner<'a> {
    config: &'a TestConfiguration,
    log: &'a EventLog,
    sleep: fn(Duration),
}

impl<'a> Provisioner<'a> {
    /// Provisioner for one test run
    pub fn new(config: &'a TestConfiguration, log: &'a EventLog) -> Self {
        Self {
            config,
            log,
            sleep: thread::sleep,
        }
    }

    /// Replace the settle delay function
    #[must_use]
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Cleanup command for step 1. The `pkill` patterns are bracketed so
    /// they cannot match the cleanup shell's own command line.
    pub fn cleanup_command(&self) -> String {
        let remote = &self.config.remote;
        format!(
            "sudo pkill -9 -f {script}; sudo pkill -9 -f {link}; sudo fuser -k {device} 2>/dev/null; rm -f {capture} {log}",
            script = shell_quote(&process_pattern(&remote.capture_script)),
            link = shell_quote(&process_pattern(&remote.link_program)),
            device = shell_quote(&self.config.serial_device_path),
            capture = shell_quote(&remote.capture_file),
            log = shell_quote(&remote.link_log),
        )
    }

    /// Detached launch of the capture program
    pub fn capture_launch_command(&self) -> String {
        let remote = &self.config.remote;
        format!(
            "nohup {} {} < /dev/null > /dev/null 2>&1 &",
            shell_quote(&remote.interpreter),
            shell_quote(&remote.capture_script)
        )
    }

    /// Detached launch of the link-establishment program
    pub fn link_launch_command(&self) -> String {
        let remote = &self.config.remote;
        format!(
            "cd {dir} && nohup {interp} {program} com={device} baud={baud} game={game} matching={matching} < /dev/null > {log} 2>&1 &",
            dir = shell_quote(&remote.link_dir),
            interp = shell_quote(&remote.interpreter),
            program = shell_quote(&remote.link_program),
            device = shell_quote(&self.config.serial_device_path),
            baud = self.config.baud_rate,
            game = remote.game_id,
            matching = remote.matching,
            log = shell_quote(&remote.link_log),
        )
    }

    /// Process listing for step 5
    pub fn verify_command(&self) -> String {
        let remote = &self.config.remote;
        let script = remote
            .capture_script
            .rsplit('/')
            .next()
            .unwrap_or(&remote.capture_script);
        let link = remote.link_program.trim_end_matches(".py");
        format!(
            "ps aux | grep -E {} | grep -v grep",
            shell_quote(&format!("({}|{})", script.replace('.', "\\."), link))
        )
    }

    /// Link log sample for step 6
    pub fn tail_command(&self) -> String {
        format!(
            "tail -{} {} 2>/dev/null",
            LINK_LOG_TAIL_LINES,
            shell_quote(&self.config.remote.link_log)
        )
    }

    /// Run the whole sequence
    pub fn setup(&self, shell: &mut dyn RemoteShell) -> Result<ProvisionReport, RemoteError> {
        let timing = &self.config.timing;
        let remote = &self.config.remote;
        let mut report = ProvisionReport::default();

        self.log.info("Cleaning up...");
        self.run_step(shell, &self.cleanup_command(), "Cleanup", &mut report)?;
        (self.sleep)(timing.cleanup_settle);

        self.log.info("Creating non-exclusive serial monitor...");
        let script = capture_script(
            &self.config.serial_device_path,
            self.config.baud_rate,
            &remote.capture_file,
        );
        match shell.upload(&remote.capture_script, &script) {
            Ok(()) => debug!(path = %remote.capture_script, bytes = script.len(), "Capture program uploaded"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => self.warn(&mut report, format!("Uploading capture program failed: {}", e)),
        }

        self.log.info("Starting non-exclusive monitor...");
        self.run_step(shell, &self.capture_launch_command(), "Capture launch", &mut report)?;
        (self.sleep)(timing.capture_settle);

        self.log.info(format!("Starting {}...", remote.link_program));
        self.run_step(shell, &self.link_launch_command(), "Link launch", &mut report)?;
        (self.sleep)(timing.link_settle);

        if let Some(output) = self.try_execute(shell, &self.verify_command(), &mut report)? {
            report.processes = output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| l.chars().take(PROCESS_LINE_WIDTH).collect())
                .collect();
        }
        if report.processes_running() {
            self.log.success("Running processes:");
            for line in &report.processes {
                self.log.info(format!("  {}", line));
            }
        } else {
            self.warn(
                &mut report,
                "Warning: No processes detected, but continuing anyway...".to_string(),
            );
        }

        (self.sleep)(timing.diagnostic_delay);
        if let Some(output) = self.try_execute(shell, &self.tail_command(), &mut report)? {
            report.link_log_tail = output
                .stdout
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect();
        }
        if !report.link_log_tail.is_empty() {
            self.log.info("Link script output:");
            for line in &report.link_log_tail {
                self.log.info(format!("  {}", line));
            }
        }

        Ok(report)
    }

    fn warn(&self, report: &mut ProvisionReport, message: String) {
        self.log.warning(message.clone());
        report.warnings.push(message);
    }

    fn try_execute(
        &self,
        shell: &mut dyn RemoteShell,
        command: &str,
        report: &mut ProvisionReport,
    ) -> Result<Option<CommandOutput>, RemoteError> {
        match shell.execute(command) {
            Ok(output) => Ok(Some(output)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.warn(report, e.to_string());
                Ok(None)
            }
        }
    }

    fn run_step(
        &self,
        shell: &mut dyn RemoteShell,
        command: &str,
        step: &str,
        report: &mut ProvisionReport,
    ) -> Result<(), RemoteError> {
        if let Some(output) = self.try_execute(shell, command, report)? {
            if !output.success() {
                let detail = output.stderr.trim();
                let message = if detail.is_empty() {
                    format!("{} exited with status {}", step, output.exit_status)
                } else {
                    format!("{} exited with status {}: {}", step, output.exit_status, detail)
                };
                self.warn(report, message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::Severity;
    use crate::core::transport::{ConnectionError, MockRemoteShell};
    use mockall::Sequence;

    fn no_sleep(_: Duration) {}

    fn config() -> TestConfiguration {
        TestConfiguration::new("10.0.0.7").serial("/dev/ttyUSB1", 260_416)
    }

    #[test]
    fn test_capture_script_is_non_exclusive() {
        let script = capture_script("/dev/ttyUSB0", 260_416, "/tmp/serial_data.txt");
        assert!(script.contains("serial.Serial(\"/dev/ttyUSB0\", 260416, timeout=0.5, exclusive=False)"));
        assert!(script.contains("open(\"/tmp/serial_data.txt\", 'a')"));
        assert!(script.contains("f.flush()"));
        assert!(script.contains("ser.read(100)"));
    }

    #[test]
    fn test_capture_script_escapes_paths() {
        let script = capture_script("/dev/tty\u{1b}X", 9600, "/tmp/o'dd \"file\\.txt");
        assert!(script.contains(r#"serial.Serial("/dev/tty\u001bX", 9600,"#));
        assert!(script.contains(r#"open("/tmp/o'dd \"file\\.txt", 'a')"#));
        assert!(!script.contains("\u{1b}"));
    }

    #[test]
    fn test_process_patterns_exclude_themselves() {
        assert_eq!(process_pattern("/tmp/monitor.py"), r"[/]tmp/monitor\.py");
        assert_eq!(process_pattern("link_cable.py"), r"[l]ink_cable\.py");
        assert_eq!(process_pattern("a[1](x)"), r"[a]\[1\]\(x\)");

        let config = config();
        let log = EventLog::new();
        let cleanup = Provisioner::new(&config, &log).cleanup_command();
        assert!(cleanup.contains(r"sudo pkill -9 -f '[/]tmp/monitor\.py';"));
        assert!(cleanup.contains(r"sudo pkill -9 -f '[l]ink_cable\.py';"));
        assert!(!cleanup.contains("/tmp/monitor.py"));
        assert!(!cleanup.contains("link_cable.py"));
    }

    /// Runs the cleanup line in a local shell, with `sudo` as a pass-through,
    /// and checks it lives long enough to remove the stale files.
    #[cfg(unix)]
    #[test]
    fn test_cleanup_survives_its_own_pkill() {
        use std::os::unix::fs::PermissionsExt;
        use std::process::Command;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let sudo = bin.join("sudo");
        std::fs::write(&sudo, "#!/bin/sh\nexec \"$@\"\n").unwrap();
        std::fs::set_permissions(&sudo, std::fs::Permissions::from_mode(0o755)).unwrap();

        let capture = dir.path().join("serial_data.txt");
        let link_log = dir.path().join("link_output.log");
        std::fs::write(&capture, "SCIXB START\n").unwrap();
        std::fs::write(&link_log, "Connection established\n").unwrap();

        let mut config = config().serial(&dir.path().join("ttyNONE").to_string_lossy(), 9600);
        config.remote.capture_file = capture.to_string_lossy().into_owned();
        config.remote.link_log = link_log.to_string_lossy().into_owned();
        config.remote.capture_script = dir.path().join("monitor.py").to_string_lossy().into_owned();

        let log = EventLog::new();
        let cleanup = Provisioner::new(&config, &log).cleanup_command();
        let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
        let status = Command::new("sh")
            .arg("-c")
            .arg(&cleanup)
            .env("PATH", path)
            .status()
            .unwrap();

        assert!(status.code().is_some(), "cleanup shell was killed: {:?}", status);
        assert!(!capture.exists());
        assert!(!link_log.exists());
    }

    #[test]
    fn test_commands_carry_parameters() {
        let config = config();
        let log = EventLog::new();
        let p = Provisioner::new(&config, &log);

        let cleanup = p.cleanup_command();
        assert!(cleanup.starts_with("sudo pkill -9 -f"));
        assert!(cleanup.contains("fuser -k /dev/ttyUSB1"));
        assert!(cleanup.contains("rm -f /tmp/serial_data.txt /tmp/link_output.log"));

        let link = p.link_launch_command();
        assert!(link.starts_with("cd /opt/dreampi-linkcable && nohup python3 link_cable.py"));
        assert!(link.contains("com=/dev/ttyUSB1 baud=260416 game=5 matching=1"));
        assert!(link.contains("> /tmp/link_output.log 2>&1 &"));

        assert!(p.capture_launch_command().ends_with("&"));
        assert_eq!(p.tail_command(), "tail -10 /tmp/link_output.log 2>/dev/null");
        assert!(p.verify_command().contains("monitor\\.py|link_cable"));
    }

    #[test]
    fn test_full_sequence_in_order() {
        let config = config();
        let log = EventLog::new();
        let p = Provisioner::new(&config, &log).with_sleep(no_sleep);
        let mut seq = Sequence::new();
        let mut shell = MockRemoteShell::new();

        let cleanup = p.cleanup_command();
        shell
            .expect_execute()
            .withf(move |c| c == cleanup)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok("")));
        shell
            .expect_upload()
            .withf(|path, content| path == "/tmp/monitor.py" && content.contains("exclusive=False"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        shell
            .expect_execute()
            .withf(|c| c.contains("monitor.py") && c.starts_with("nohup"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok("")));
        shell
            .expect_execute()
            .withf(|c| c.contains("link_cable.py"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok("")));
        shell
            .expect_execute()
            .withf(|c| c.starts_with("ps aux"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok("pi 101 python3 /tmp/monitor.py\npi 102 python3 link_cable.py com=/dev/ttyUSB1\n")));
        shell
            .expect_execute()
            .withf(|c| c.starts_with("tail -10"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::ok("Opening /dev/ttyUSB1\nWaiting for console\n")));

        let report = p.setup(&mut shell).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.processes.len(), 2);
        assert_eq!(report.link_log_tail, vec!["Opening /dev/ttyUSB1", "Waiting for console"]);
        assert!(log.contains("Running processes:"));
        assert!(log.contains("Link script output:"));
    }

    #[test]
    fn test_command_failures_are_warnings() {
        let config = config();
        let log = EventLog::new();
        let p = Provisioner::new(&config, &log).with_sleep(no_sleep);
        let mut shell = MockRemoteShell::new();

        shell.expect_execute().returning(|c| {
            if c.starts_with("sudo pkill") {
                Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "pkill: no process found".to_string(),
                    exit_status: 1,
                })
            } else if c.starts_with("tail") {
                Err(RemoteError::command(c, "channel failure"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        shell
            .expect_upload()
            .returning(|p, _| Err(RemoteError::command(p, "exit status 1")));

        let report = p.setup(&mut shell).unwrap();
        assert!(!report.processes_running());
        // cleanup, upload, process check, tail
        assert_eq!(report.warnings.len(), 4);
        assert_eq!(log.with_severity(Severity::Warning).len(), 4);
        assert!(log.contains("No processes detected"));
    }

    #[test]
    fn test_connection_loss_aborts() {
        let config = config();
        let log = EventLog::new();
        let p = Provisioner::new(&config, &log).with_sleep(no_sleep);
        let mut shell = MockRemoteShell::new();

        shell.expect_execute().times(1).returning(|_| {
            Err(RemoteError::Connection(ConnectionError::Network(
                "connection reset".to_string(),
            )))
        });
        shell.expect_upload().never();

        let err = p.setup(&mut shell).unwrap_err();
        assert!(err.is_fatal());
    }
}
