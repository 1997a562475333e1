use std::sync::Arc;
use std::time::Duration;

use easel_process::{
    ExitReport, KillOutput, OutputChunk, ProcessError, ProcessEvent, ProcessSupervisor, RunId,
    StreamKind,
};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::EngineConfig;
use crate::events::Event;
use crate::parser::{OutputParser, ParsedOutput};
use crate::state::SharedState;

use super::commands::EngineCommand;
use super::error::EngineError;
use super::events::ConsoleOutput;
use super::observer::EngineObserver;
use super::state_manager::{
    EngineAction, EngineEvent, EngineState, EngineStateMachine, TransitionRejection,
    TransitionResult,
};

/// How long to wait for the exit report after a forced kill at shutdown.
const FORCED_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Owns the engine process and is the only writer of engine lifecycle state.
///
/// Process output and user commands arrive on separate channels and are
/// handled one at a time, output first, so a command never observes a
/// half-parsed chunk.
pub struct EngineController {
    command_rx: mpsc::Receiver<EngineCommand>,
    process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    supervisor: ProcessSupervisor,
    machine: EngineStateMachine,
    state: SharedState,
    config: EngineConfig,
    parser: OutputParser,
    current_run: Option<RunId>,
    /// Armed by terminate; forced recovery runs when it passes.
    terminate_deadline: Option<Instant>,
    observers: Vec<Arc<dyn EngineObserver>>,
    shutdown: CancellationToken,
}

impl EngineController {
    pub fn new(
        command_rx: mpsc::Receiver<EngineCommand>,
        supervisor: ProcessSupervisor,
        process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
        state: SharedState,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        EngineController {
            command_rx,
            process_rx,
            supervisor,
            machine: EngineStateMachine::new(state.clone()),
            state,
            parser: OutputParser::new(config.url_patterns()),
            config,
            current_run: None,
            terminate_deadline: None,
            observers: Vec::new(),
            shutdown,
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn EngineObserver>) {
        self.observers.push(observer);
    }

    /// Main control loop - consumes self, runs until shutdown is requested
    /// or every handle is dropped. A running engine is stopped on the way out.
    pub async fn run(mut self) {
        loop {
            let deadline = self.terminate_deadline;
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(event) = self.process_rx.recv() => self.handle_process_event(event),

                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.terminate_deadline = None;
                    self.on_terminate_timeout().await;
                }
            }
        }

        self.stop_for_shutdown().await;
        info!("Engine controller stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        debug!("Engine command: {:?}", command.event());
        match command {
            EngineCommand::Start { reply } => {
                let _ = reply.send(self.handle_start());
            }
            EngineCommand::Terminate { reply } => {
                let _ = reply.send(self.handle_terminate());
            }
            EngineCommand::ForceKill { reply } => {
                let result = self.handle_force_kill().await;
                let _ = reply.send(result);
            }
            EngineCommand::Configure { config, reply } => {
                self.parser.set_patterns(config.url_patterns());
                self.config = *config;
                for observer in &self.observers {
                    observer.engine_reconfigured(&self.config);
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Runs a transition plus the side effects that follow from the states
    /// involved. Returns the action the caller still has to perform.
    fn apply(&mut self, event: EngineEvent) -> Result<Option<EngineAction>, TransitionRejection> {
        match self.machine.transition(event) {
            Ok(TransitionResult::Changed { from, to, action }) => {
                info!("Engine state {} -> {}", from, to);
                if from.is_running() && !to.is_running() {
                    self.state.end_engine_session();
                    self.notify_stopped();
                }
                Ok(action)
            }
            Ok(TransitionResult::Unchanged) => Ok(None),
            Err(rejection) => {
                warn!("{}", rejection);
                Err(rejection)
            }
        }
    }

    fn handle_start(&mut self) -> Result<(), EngineError> {
        if self.supervisor.is_running() {
            // Still waiting for the previous run to exit.
            return Err(ProcessError::AlreadyRunning.into());
        }

        let target = match self.config.launch_target() {
            Ok(target) => target,
            Err(e) => {
                warn!("Cannot launch engine: {}", e);
                self.apply(EngineEvent::LaunchInputsInvalid(e.to_string()))?;
                return Err(e.into());
            }
        };

        if self.apply(EngineEvent::Start)? != Some(EngineAction::SpawnProcess) {
            return Ok(());
        }

        match self
            .supervisor
            .start(&target.working_directory, &target.executable, &target.args)
        {
            Ok(run) => {
                self.current_run = Some(run);
                self.parser.reset();
                self.state.reset_progress();
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn engine: {}", e);
                let _ = self.apply(EngineEvent::SpawnFailed(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn handle_terminate(&mut self) -> Result<(), EngineError> {
        if self.apply(EngineEvent::Terminate)? != Some(EngineAction::StopProcess) {
            return Ok(());
        }

        match self.supervisor.terminate() {
            Ok(()) => {
                self.terminate_deadline = Some(Instant::now() + self.config.terminate_timeout());
                Ok(())
            }
            Err(ProcessError::NotRunning) => {
                debug!("Engine process already exited");
                Ok(())
            }
            Err(e) => {
                error!("Failed to signal engine, forcing: {}", e);
                self.terminate_deadline = Some(Instant::now());
                Err(e.into())
            }
        }
    }

    async fn handle_force_kill(&mut self) -> Result<KillOutput, EngineError> {
        // ForceKill is accepted in every state.
        let _ = self.apply(EngineEvent::ForceKill);
        self.terminate_deadline = None;
        self.force_stop().await
    }

    async fn force_stop(&mut self) -> Result<KillOutput, EngineError> {
        if let Err(e) = self.supervisor.kill() {
            debug!("No owned engine process to kill: {}", e);
        }
        let output = self
            .supervisor
            .kill_all_matching_process_class(&self.config.process_class)
            .await?;
        Ok(output)
    }

    async fn on_terminate_timeout(&mut self) {
        let Some(run) = self.current_run else {
            return;
        };
        if self.supervisor.current_run() != Some(run) {
            return;
        }
        warn!(
            "Engine run {} did not exit within {:?}, forcing",
            run,
            self.config.terminate_timeout()
        );
        if let Err(e) = self.force_stop().await {
            error!("Forced engine recovery failed: {}", e);
        }
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output(chunk) => self.handle_output(chunk),
            ProcessEvent::Exited(report) => self.handle_exit(report),
        }
    }

    fn handle_output(&mut self, chunk: OutputChunk) {
        if self.current_run != Some(chunk.run) {
            debug!(
                "Dropping {} bytes of output from stale run {}",
                chunk.bytes.len(),
                chunk.run
            );
            return;
        }
        let parsed = self.parser.feed(chunk.stream, &chunk.bytes);
        self.publish_output(chunk.stream, parsed, true);
    }

    fn handle_exit(&mut self, report: ExitReport) {
        if self.current_run != Some(report.run) {
            debug!("Ignoring exit of stale run {}", report.run);
            return;
        }
        if report.is_abnormal() {
            warn!("{}", report.describe());
        } else {
            info!("{}", report.describe());
        }

        // The process is gone, so a URL in its last words is not reachable.
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let parsed = self.parser.flush(stream);
            self.publish_output(stream, parsed, false);
        }

        self.current_run = None;
        self.terminate_deadline = None;
        self.parser.reset();
        let _ = self.apply(EngineEvent::ProcessExited {
            abnormal: report.is_abnormal(),
        });
    }

    fn publish_output(&mut self, stream: StreamKind, parsed: ParsedOutput, may_activate: bool) {
        for line in parsed.lines {
            debug!("[engine:{}] {}", stream, line);
            let _ = ConsoleOutput {
                stream: stream.to_string(),
                text: line,
            }
            .emit(self.state.bus());
        }

        if let Some(progress) = parsed.progress {
            self.state.observe_progress(progress);
        }
        if let Some(outcome) = parsed.load_outcome {
            self.state.apply_load_marker(outcome);
        }
        if let Some(url) = parsed.service_url.filter(|_| may_activate) {
            if self.machine.current() == EngineState::Launching {
                if let Ok(Some(EngineAction::BeginSync)) =
                    self.apply(EngineEvent::ServiceDiscovered(url.clone()))
                {
                    self.notify_activated(&url);
                }
            }
        }
    }

    fn notify_activated(&self, url: &Url) {
        for observer in &self.observers {
            let observer = observer.clone();
            let url = url.clone();
            tokio::spawn(async move {
                observer.engine_activated(&url).await;
            });
        }
    }

    fn notify_stopped(&self) {
        for observer in &self.observers {
            let observer = observer.clone();
            tokio::spawn(async move {
                observer.engine_stopped().await;
            });
        }
    }

    async fn stop_for_shutdown(&mut self) {
        let Some(run) = self.current_run else {
            return;
        };
        info!("Stopping engine run {} before exit", run);

        if self.machine.current().is_running() {
            if let Err(e) = self.handle_terminate() {
                warn!("Graceful engine stop failed: {}", e);
            }
        }

        let graceful = Instant::now() + self.config.terminate_timeout();
        if self.drain_until_exit(graceful).await {
            return;
        }

        warn!("Engine did not exit in time, forcing");
        if let Err(e) = self.force_stop().await {
            error!("Forced engine recovery failed: {}", e);
        }
        if !self.drain_until_exit(Instant::now() + FORCED_EXIT_GRACE).await {
            warn!("Engine run {} still had not exited at shutdown", run);
        }
    }

    /// Keeps handling process events until the current run exits or
    /// `deadline` passes. Returns true when the run exited.
    async fn drain_until_exit(&mut self, deadline: Instant) -> bool {
        while self.current_run.is_some() {
            match timeout_at(deadline, self.process_rx.recv()).await {
                Ok(Some(event)) => self.handle_process_event(event),
                Ok(None) => return false,
                Err(_) => return false,
            }
        }
        true
    }
}
