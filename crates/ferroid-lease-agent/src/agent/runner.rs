use ferroid_lease::{Connector, Error, LeaseMonitor, SessionManager, SlotAllocator};
use tokio::time::{sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use super::config::AgentConfig;

/// Claims machine ids until `shutdown` fires, re-claiming whenever the held
/// claim expires. With `once` set, returns after the first claim expires.
///
/// Returns the number of claims held.
pub async fn run<C: Connector>(
    connector: C,
    config: AgentConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<usize> {
    let manager = SessionManager::new(connector, config.session);
    manager.configure(config.address.clone());

    let monitor = LeaseMonitor::spawn();
    monitor.attach(&manager);
    let allocator = SlotAllocator::with_cancellation(monitor.clone(), shutdown.child_token());

    let outcome = hold_claims(&manager, &allocator, &config, &shutdown).await;

    // Outstanding claims are abandoned rather than released.
    monitor.shutdown();
    manager.shutdown().await;

    if let Ok(held) = &outcome {
        tracing::info!(held, "Agent stopped");
    }
    outcome
}

async fn hold_claims<C: Connector>(
    manager: &SessionManager<C>,
    allocator: &SlotAllocator<C::Session>,
    config: &AgentConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<usize> {
    let mut held = 0;

    while !shutdown.is_cancelled() {
        let claimed = match manager.get().await {
            Ok(session) => {
                allocator
                    .claim_expiring(&session, config.pool_size, &config.base_path, config.ttl)
                    .await
            }
            Err(e) => Err(e),
        };

        match claimed {
            Ok(claim) => {
                held += 1;
                let machine_id = claim.get()?;
                tracing::info!(
                    machine_id,
                    ttl_ms = u64::try_from(config.ttl.as_millis()).unwrap_or(u64::MAX),
                    "Holding machine id"
                );

                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = sleep_until(claim.deadline()) => {}
                }
                tracing::info!(machine_id, "Claim on machine id expired");

                if config.once {
                    break;
                }
            }
            Err(Error::Aborted) => break,
            Err(e) if is_retryable(&e) => {
                tracing::warn!("Claim failed, retrying in {:?}: {e}", config.retry_backoff);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = sleep(config.retry_backoff) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(held)
}

/// Failures that may clear up on their own.
fn is_retryable(error: &Error) -> bool {
    error.is_transient() || matches!(error, Error::ResourceExhausted { .. })
}
