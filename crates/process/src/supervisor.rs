use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::kill::{kill_all_matching, KillOutput};
use crate::output::{ExitReport, OutputChunk, ProcessEvent, RunId, StreamKind};
use crate::ProcessError;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Upper bound on draining pipes after the child itself exited. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct LiveProcess {
    run: RunId,
    pid: Option<u32>,
    termination_requested: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Owns at most one engine process at a time.
///
/// Cloning yields another handle to the same slot. Output and exit reports
/// are delivered on the unbounded receiver returned by [`ProcessSupervisor::new`],
/// so a slow consumer never backs up the OS pipes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    live: Arc<Mutex<Option<LiveProcess>>>,
    next_run: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl ProcessSupervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            live: Arc::new(Mutex::new(None)),
            next_run: Arc::new(AtomicU64::new(1)),
            events,
        };
        (supervisor, rx)
    }

    fn slot(&self) -> MutexGuard<'_, Option<LiveProcess>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `executable` through the platform shell inside `working_directory`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        working_directory: &Path,
        executable: &str,
        args: &[String],
    ) -> Result<RunId, ProcessError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(ProcessError::AlreadyRunning);
        }

        let mut command = shell_command(executable, args);
        command
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(ProcessError::SpawnFailed)?;
        let run = RunId(self.next_run.fetch_add(1, Ordering::SeqCst));
        let pid = child.id();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, run, StreamKind::Stdout, self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, run, StreamKind::Stderr, self.events.clone()));
        }

        let termination_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();

        *slot = Some(LiveProcess {
            run,
            pid,
            termination_requested: termination_requested.clone(),
            kill_tx: Some(kill_tx),
        });
        drop(slot);

        info!(
            "Started engine run {} (pid {:?}) in {}",
            run,
            pid,
            working_directory.display()
        );

        tokio::spawn(supervise(
            child,
            run,
            readers,
            kill_rx,
            termination_requested,
            self.live.clone(),
            self.events.clone(),
        ));

        Ok(run)
    }

    /// Requests graceful shutdown of the owned process group.
    ///
    /// Returns as soon as the signal is delivered. The exit itself arrives
    /// later as [`ProcessEvent::Exited`] with `requested == true`.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        let mut slot = self.slot();
        let live = slot.as_mut().ok_or(ProcessError::NotRunning)?;
        live.termination_requested.store(true, Ordering::SeqCst);
        debug!("Requesting termination of engine run {}", live.run);

        #[cfg(unix)]
        {
            if let Some(pid) = live.pid {
                signal_group(pid, libc::SIGTERM).map_err(ProcessError::SignalFailed)?;
            }
        }
        #[cfg(not(unix))]
        {
            if let Some(kill_tx) = live.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
        Ok(())
    }

    /// Hard-kills the owned process group.
    pub fn kill(&self) -> Result<(), ProcessError> {
        let mut slot = self.slot();
        let live = slot.as_mut().ok_or(ProcessError::NotRunning)?;
        hard_kill(live);
        Ok(())
    }

    /// Forced recovery: kills the owned process, then every process on the
    /// system whose command line matches `process_class`.
    ///
    /// This reaches beyond the owned handle and is only run when explicitly
    /// asked for.
    pub async fn kill_all_matching_process_class(
        &self,
        process_class: &str,
    ) -> Result<KillOutput, ProcessError> {
        if process_class.trim().is_empty() {
            return Err(ProcessError::EmptyProcessClass);
        }
        if let Some(live) = self.slot().as_mut() {
            hard_kill(live);
        }
        kill_all_matching(process_class).await
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.slot().as_ref().map(|live| live.run)
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot().as_ref().and_then(|live| live.pid)
    }
}

fn hard_kill(live: &mut LiveProcess) {
    live.termination_requested.store(true, Ordering::SeqCst);
    warn!("Killing engine run {}", live.run);
    #[cfg(unix)]
    if let Some(pid) = live.pid {
        if let Err(e) = signal_group(pid, libc::SIGKILL) {
            warn!("Failed to kill process group {}: {}", pid, e);
        }
    }
    if let Some(kill_tx) = live.kill_tx.take() {
        let _ = kill_tx.send(());
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
    }
    // SAFETY: kill(2) with a negative pid signals the process group we created.
    let result = unsafe { libc::kill(-pgid, signal) };
    if result == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(error)
}

#[cfg(unix)]
fn shell_command(executable: &str, args: &[String]) -> Command {
    let mut line = String::from("exec ");
    line.push_str(&shell_quote(executable));
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell_command(executable: &str, args: &[String]) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(executable).args(args);
    command
}

#[cfg(unix)]
fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn spawn_reader<R>(
    mut reader: R,
    run: RunId,
    stream: StreamKind,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        run,
                        stream,
                        bytes: buffer[..n].to_vec(),
                    };
                    if events.send(ProcessEvent::Output(chunk)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Error reading engine {} for run {}: {}", stream, run, e);
                    break;
                }
            }
        }
        debug!("Engine {} closed for run {}", stream, run);
    })
}

async fn supervise(
    mut child: Child,
    run: RunId,
    readers: Vec<JoinHandle<()>>,
    mut kill_rx: oneshot::Receiver<()>,
    termination_requested: Arc<AtomicBool>,
    live: Arc<Mutex<Option<LiveProcess>>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!("start_kill for run {} failed: {}", run, e);
            }
            child.wait().await
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!("Abandoning pipe reader for run {} after drain timeout", run);
            reader.abort();
        }
    }

    {
        let mut slot = live.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|l| l.run) == Some(run) {
            *slot = None;
        }
    }

    let requested = termination_requested.load(Ordering::SeqCst);
    let report = match status {
        Ok(status) => ExitReport {
            run,
            code: status.code(),
            signal: exit_signal(&status),
            requested,
            error: None,
        },
        Err(e) => ExitReport {
            run,
            code: None,
            signal: None,
            requested,
            error: Some(e.to_string()),
        },
    };

    if report.is_abnormal() {
        warn!("Engine {}", report.describe());
    } else {
        info!("Engine {}", report.describe());
    }
    let _ = events.send(ProcessEvent::Exited(report));
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> (Vec<OutputChunk>, ExitReport) {
        let mut chunks = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for process event")
                .expect("event channel closed");
            match event {
                ProcessEvent::Output(chunk) => chunks.push(chunk),
                ProcessEvent::Exited(report) => return (chunks, report),
            }
        }
    }

    fn joined(chunks: &[OutputChunk], stream: StreamKind) -> String {
        let bytes: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == stream)
            .flat_map(|c| c.bytes.clone())
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_streams_are_tagged_and_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        script(&dir, "engine.sh", "echo out-line\necho err-line >&2\nexit 3");
        let (supervisor, mut rx) = ProcessSupervisor::new();

        let run = supervisor.start(dir.path(), "./engine.sh", &[]).unwrap();
        let (chunks, report) = collect_until_exit(&mut rx).await;

        assert_eq!(joined(&chunks, StreamKind::Stdout), "out-line\n");
        assert_eq!(joined(&chunks, StreamKind::Stderr), "err-line\n");
        assert!(chunks.iter().all(|c| c.run == run));
        assert_eq!(report.run, run);
        assert_eq!(report.code, Some(3));
        assert!(report.is_abnormal());
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_arguments_reach_the_script() {
        let dir = TempDir::new().unwrap();
        script(&dir, "engine.sh", "echo \"$1|$2\"");
        let (supervisor, mut rx) = ProcessSupervisor::new();

        supervisor
            .start(
                dir.path(),
                "./engine.sh",
                &["--ckpt-dir".to_string(), "/models/with space".to_string()],
            )
            .unwrap();
        let (chunks, _) = collect_until_exit(&mut rx).await;

        assert_eq!(
            joined(&chunks, StreamKind::Stdout),
            "--ckpt-dir|/models/with space\n"
        );
    }

    #[tokio::test]
    async fn test_start_while_running_fails() {
        let dir = TempDir::new().unwrap();
        script(&dir, "engine.sh", "sleep 30");
        let (supervisor, mut rx) = ProcessSupervisor::new();

        supervisor.start(dir.path(), "./engine.sh", &[]).unwrap();
        let second = supervisor.start(dir.path(), "./engine.sh", &[]);
        assert!(matches!(second, Err(ProcessError::AlreadyRunning)));

        supervisor.kill().unwrap();
        let (_, report) = collect_until_exit(&mut rx).await;
        assert!(report.requested);
    }

    #[tokio::test]
    async fn test_terminate_is_reported_as_requested() {
        let dir = TempDir::new().unwrap();
        script(&dir, "engine.sh", "echo ready\nsleep 30");
        let (supervisor, mut rx) = ProcessSupervisor::new();

        supervisor.start(dir.path(), "./engine.sh", &[]).unwrap();
        // Wait for the script to be up before signalling it.
        match rx.recv().await {
            Some(ProcessEvent::Output(_)) => {}
            other => panic!("unexpected event {:?}", other),
        }
        supervisor.terminate().unwrap();
        let (_, report) = collect_until_exit(&mut rx).await;

        assert!(report.requested);
        assert!(!report.is_abnormal());
        assert_eq!(report.signal, Some(libc::SIGTERM));
        assert!(supervisor.current_run().is_none());
    }

    #[tokio::test]
    async fn test_terminate_without_process_fails() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        assert!(matches!(supervisor.terminate(), Err(ProcessError::NotRunning)));
        assert!(matches!(supervisor.kill(), Err(ProcessError::NotRunning)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let missing = Path::new("/definitely/not/a/real/directory");
        let result = supervisor.start(missing, "./engine.sh", &[]);
        assert!(matches!(result, Err(ProcessError::SpawnFailed(_))));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_restart_gets_a_new_run_id() {
        let dir = TempDir::new().unwrap();
        script(&dir, "engine.sh", "exit 0");
        let (supervisor, mut rx) = ProcessSupervisor::new();

        let first = supervisor.start(dir.path(), "./engine.sh", &[]).unwrap();
        let (_, report) = collect_until_exit(&mut rx).await;
        assert_eq!(report.run, first);

        let second = supervisor.start(dir.path(), "./engine.sh", &[]).unwrap();
        assert!(second > first);
        let (_, report) = collect_until_exit(&mut rx).await;
        assert_eq!(report.run, second);
    }

    #[tokio::test]
    async fn test_empty_process_class_is_refused() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let result = supervisor.kill_all_matching_process_class("  ").await;
        assert!(matches!(result, Err(ProcessError::EmptyProcessClass)));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("./webui.sh"), "./webui.sh");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
