//! Event types delivered by the supervisor.

use std::fmt;

/// Which pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one `start` call. Events from an earlier run can still be in
/// flight after a restart, so consumers compare run ids before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw bytes exactly as the OS delivered them. No line alignment is implied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub run: RunId,
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub run: RunId,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
    /// True when the exit followed a `terminate`, `kill` or forced recovery.
    pub requested: bool,
    /// Set when waiting on the child itself failed.
    pub error: Option<String>,
}

impl ExitReport {
    /// An exit nobody asked for.
    pub fn is_abnormal(&self) -> bool {
        !self.requested
    }

    pub fn describe(&self) -> String {
        let cause = match (&self.error, self.code, self.signal) {
            (Some(error), _, _) => format!("wait failed: {}", error),
            (None, Some(code), _) => format!("exit code {}", code),
            (None, None, Some(signal)) => format!("signal {}", signal),
            (None, None, None) => "unknown status".to_string(),
        };
        if self.requested {
            format!("run {} stopped on request ({})", self.run, cause)
        } else {
            format!("run {} exited unexpectedly ({})", self.run, cause)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(OutputChunk),
    /// Always the last event of a run; sent after both pipes were drained.
    Exited(ExitReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_distinguishes_requested_exits() {
        let report = ExitReport {
            run: RunId(3),
            code: Some(1),
            signal: None,
            requested: false,
            error: None,
        };
        assert!(report.is_abnormal());
        assert_eq!(report.describe(), "run #3 exited unexpectedly (exit code 1)");

        let stopped = ExitReport {
            requested: true,
            code: None,
            signal: Some(15),
            ..report
        };
        assert!(!stopped.is_abnormal());
        assert_eq!(stopped.describe(), "run #3 stopped on request (signal 15)");
    }
}
