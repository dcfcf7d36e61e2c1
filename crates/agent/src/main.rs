mod cli;
mod logging;
mod shutdown;

use clap::Parser;

use crate::cli::Cli;
use crate::shutdown::StopSignal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.clone();
    if let Err(err) = logging::init_logging(&log_level, cli.log_file.as_deref()) {
        logging::init_logging_stderr(&log_level);
        tracing::warn!(error = %err, "file logging unavailable, using stderr");
    }

    let config = cli.into_config();

    if config.bearer_token.is_empty() {
        tracing::error!("BK_BEARER_TOKEN not set");
        std::process::exit(1);
    }
    if let Err(err) = bk_agent_engine::verify_transcoder(&config.ffmpeg_path).await {
        tracing::error!(error = %err, "transcoder check failed");
        std::process::exit(1);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_id = %config.worker_id,
        "bk-agent starting (stealth idle + active gear)"
    );

    let mut agent = bk_agent_engine::start_agent(config);
    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel::<StopSignal>();
    shutdown::spawn_signal_listeners(stop_tx);

    loop {
        tokio::select! {
            res = agent.wait() => {
                tracing::info!("bk-agent stopped");
                return res;
            }
            sig = stop_rx.recv() => match sig {
                Some(StopSignal::Drain) => {
                    tracing::info!(
                        "stop requested — finishing current work before exiting \
                         (signal again to exit immediately)"
                    );
                    agent.request_stop();
                }
                Some(StopSignal::ExitNow) => {
                    tracing::warn!("second stop signal — exiting immediately");
                    std::process::exit(130);
                }
                None => {}
            }
        }
    }
}
