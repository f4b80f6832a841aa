//! Long-running daemon: one gateway per account plus the automation
//! scheduler, proactive nudge, and optional media relay, each under a
//! restart-with-backoff supervisor. Ctrl-C shuts everything down.

use crate::agent::AgentRuntime;
use crate::automation::AutomationScheduler;
use crate::config::Config;
use crate::gateway::start_account;
use crate::proactive::{ProactiveNudge, ProactiveSettings};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub async fn run(config: Config, runtime: Arc<dyn AgentRuntime>) -> Result<()> {
    if config.accounts.is_empty() {
        anyhow::bail!("no accounts configured");
    }
    let initial_backoff = config.reliability.component_initial_backoff_secs.max(1);
    let max_backoff = config
        .reliability
        .component_max_backoff_secs
        .max(initial_backoff);

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut automation_started = false;

    for account in config.accounts.clone() {
        let account_id = account.account_id.clone();
        let (gateway, socket_task, events) =
            start_account(&config, account.clone(), runtime.clone());
        handles.push(socket_task_into_unit(socket_task, account_id.clone()));
        {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway.pump(events).await;
            }));
        }

        if account.proactive_dm.enabled {
            let nudge = Arc::new(ProactiveNudge::new(
                ProactiveSettings::from(&account.proactive_dm),
                gateway.store.clone(),
                gateway.policy.clone(),
                gateway.trace.clone(),
                gateway.deliverer.clone(),
            ));
            handles.push(spawn_component_supervisor(
                "proactive",
                initial_backoff,
                max_backoff,
                move || {
                    let nudge = nudge.clone();
                    async move { nudge.run().await }
                },
            ));
        }

        if account.media_relay.proxy_enabled {
            let relay_config = account.media_relay.clone();
            let roots = gateway.path_policy.roots().to_vec();
            handles.push(spawn_component_supervisor(
                "media-relay",
                initial_backoff,
                max_backoff,
                move || {
                    let relay_config = relay_config.clone();
                    let roots = roots.clone();
                    async move { crate::media::relay::run_relay(&relay_config, roots).await }
                },
            ));
        }

        // Automation runs against the first account's engine; targets are
        // routes on that account.
        if config.automation.enabled && !automation_started {
            automation_started = true;
            let scheduler = Arc::new(AutomationScheduler::new(
                config.automation.clone(),
                gateway.engine.clone(),
                gateway.policy.clone(),
                gateway.store.clone(),
            ));
            handles.push(spawn_component_supervisor(
                "automation",
                initial_backoff,
                max_backoff,
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.run().await }
                },
            ));
        }

        tracing::info!(account = %account.account_id, "gateway account started");
    }

    tracing::info!("qqbridge daemon running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn socket_task_into_unit(
    task: JoinHandle<Result<()>>,
    account_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => tracing::warn!(account = %account_id, "socket loop exited"),
            Ok(Err(e)) => tracing::error!(account = %account_id, "socket loop failed: {e:#}"),
            Err(_) => {}
        }
    })
}

/// Restart a component with exponential backoff whenever it exits.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);
        loop {
            match run_component().await {
                Ok(()) => {
                    tracing::warn!("daemon component '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("daemon component '{name}' failed: {e:#}");
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double after sleeping so the first failure waits the initial
            // backoff.
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_failed_component_with_backoff() {
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in = runs.clone();
        let handle = spawn_component_supervisor("test-fail", 1, 4, move || {
            let runs = runs_in.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("boom")
            }
        });

        // Paused clock: advance past several backoff sleeps (1+2+4 seconds).
        tokio::time::sleep(Duration::from_secs(8)).await;
        handle.abort();
        let _ = handle.await;
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn daemon_rejects_empty_account_list() {
        let config = Config::default();
        let err = run(config, Arc::new(crate::agent::EchoAgent))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no accounts configured"));
    }
}
