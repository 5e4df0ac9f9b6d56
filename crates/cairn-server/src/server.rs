use std::sync::Arc;

use anyhow::Context;
use libcairn::{SessionManager, TaskProcessor, Timer, TokioTimer};
use tracing::info;

use crate::config::ServerConfig;

/// The long-lived services shared by request handlers.
pub struct ControlPlane {
    pub timer: Arc<TokioTimer>,
    pub tasks: Arc<TaskProcessor>,
    pub sessions: Arc<SessionManager>,
}

impl ControlPlane {
    /// Must be called from within a tokio runtime; the timer runs on it.
    pub fn start(config: &ServerConfig) -> anyhow::Result<Self> {
        let timer = Arc::new(TokioTimer::current().context("starting timer")?);

        let tasks = Arc::new(TaskProcessor::new());
        tasks.init().context("starting task processor")?;

        let shared_timer: Arc<dyn Timer> = timer.clone();
        let sessions = Arc::new(SessionManager::new(
            config.ui.accounts.clone(),
            shared_timer,
            config.ui.session_manager_config(),
        ));

        Ok(Self {
            timer,
            tasks,
            sessions,
        })
    }

    /// Stop the worker, then the timer. Blocks until the worker thread exits.
    pub fn shutdown(&self) {
        self.tasks.shutdown();
        self.timer.shutdown();
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let plane = ControlPlane::start(&config)?;
    info!(
        accounts = config.ui.accounts.len(),
        session_timeout_secs = config.ui.session_timeout().as_secs(),
        session_check_interval_secs = config.ui.session_check_interval_secs,
        pid = std::process::id(),
        "cairn control plane started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!(
        sessions = plane.sessions.session_count(),
        queued_tasks = plane.tasks.get_tasklist().len(),
        "shutting down..."
    );

    tokio::task::spawn_blocking(move || plane.shutdown())
        .await
        .context("joining control plane threads")?;
    info!("control plane stopped");
    Ok(())
}
