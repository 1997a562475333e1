use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use easel_lib::engine::events::EngineStateChanged;
use easel_lib::events::CoreEvent;
use easel_lib::{logging, setup_core, Core, CoreOptions};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

/// Runs the image-generation engine headless and keeps its checkpoints in sync.
#[derive(Parser)]
#[command(name = "easel", version)]
struct Cli {
    /// Config file, created on first write
    #[arg(long, env = "EASEL_CONFIG", default_value = "easel.json")]
    config: PathBuf,
    /// Engine launch script
    #[arg(long)]
    script: Option<PathBuf>,
    /// Checkpoint directory passed to the engine and watched for changes
    #[arg(long)]
    models_dir: Option<PathBuf>,
    /// Checkpoint to load once the engine is up
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Kill every running engine process and exit
    #[arg(long)]
    kill_orphans: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let cache_path = cli.config.with_extension("checkpoints.json");
    let core = match setup_core(CoreOptions {
        config_path: Some(cli.config),
        cache_path: Some(cache_path),
        script_path: cli.script,
        model_directory: cli.models_dir,
        checkpoint: cli.checkpoint,
    })
    .await
    {
        Ok(core) => core,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = if cli.kill_orphans {
        kill_orphans(&core).await
    } else {
        run_engine(&core).await
    };
    core.shutdown().await;
    code
}

async fn kill_orphans(core: &Core) -> ExitCode {
    match core.engine.force_kill().await {
        Ok(output) if output.matched_nothing() => {
            info!("No engine processes were running");
            ExitCode::SUCCESS
        }
        Ok(output) if output.success => {
            info!("Killed running engine processes");
            ExitCode::SUCCESS
        }
        Ok(output) => {
            error!("Kill command failed: {}", output.stderr.trim());
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

/// Starts the engine and logs events until it stops or Ctrl-C arrives.
async fn run_engine(core: &Core) -> ExitCode {
    let mut events = core.bus().subscribe();

    if let Err(e) = core.engine.start().await {
        error!("{}", e.user_message());
        return ExitCode::FAILURE;
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Could not listen for Ctrl-C: {}", e);
                }
                info!("Interrupted, stopping the engine");
                return ExitCode::SUCCESS;
            }
            event = events.recv() => match event {
                Ok(CoreEvent::ConsoleOutput(_)) => {}
                Ok(CoreEvent::EngineStateChanged(state)) => {
                    info!("Engine: {:?}", state);
                    match state {
                        EngineStateChanged::Terminated { abnormal: true } => {
                            error!("The engine exited unexpectedly. Run with --kill-orphans to clean up leftover processes.");
                            return ExitCode::FAILURE;
                        }
                        EngineStateChanged::Terminated { .. } => return ExitCode::SUCCESS,
                        EngineStateChanged::Failed { .. }
                        | EngineStateChanged::UnableToLocate { .. } => return ExitCode::FAILURE,
                        _ => {}
                    }
                }
                Ok(other) => info!("{:?}", other),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => return ExitCode::SUCCESS,
            },
        }
    }
}
