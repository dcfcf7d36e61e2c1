//! Public API for the in-process `bk-agent` engine.

use std::sync::Arc;

use bk_agent_core::AgentConfig;

use crate::state::AgentShared;

/// Handle to a running agent instance.
pub struct AgentHandle {
    pub(crate) inner: Arc<AgentShared>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start the agent: wakeup endpoint, worker pool, watchdogs, background
/// reporting loops and the polling main loop.
pub fn start_agent(config: AgentConfig) -> AgentHandle {
    let inner = Arc::new(AgentShared::new());
    let join = tokio::spawn(crate::engine::run_agent(inner.clone(), config));
    AgentHandle { inner, join }
}

impl AgentHandle {
    /// Request a graceful stop: no new claims, workers drain their current
    /// job, background loops exit at their next tick.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the agent to stop, returning the main-loop result. Takes
    /// `&mut self` so callers can race it against signal events and still
    /// issue [`AgentHandle::request_stop`].
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        match (&mut self.join).await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("agent task join error: {err}")),
        }
    }
}

/// Startup check that the configured transcoder binary is runnable.
pub async fn verify_transcoder(ffmpeg_path: &str) -> anyhow::Result<()> {
    crate::transcode::verify_binary(ffmpeg_path).await
}
