use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bencher::Bencher;
use crate::invoker::ExecError;
use crate::rate::Completion;
use crate::workload::Phase;

/// Run one phase to completion.
///
/// Termination reconciles three triggers into one clean shutdown: the
/// rate's completion signal, the phase timeout, and (in strict mode) the
/// first worker error. Whichever fires first releases the wait; the runner
/// then cancels the phase, closes the rate, and joins every worker, so no
/// trace can reach the collector after this function returns.
pub(crate) async fn run_phase(
    phase: &Phase,
    bencher: &Bencher,
    parent: &CancellationToken,
) -> Result<()> {
    if let Some(hook) = &phase.pre_run {
        info!("run pre-phase {}", phase.name);
        if let Err(err) = hook() {
            error!("failed to perform pre run in phase {}: {err:#}", phase.name);
        }
    }

    let cancel = parent.child_token();
    let rate = phase.hatch_rate.clone();

    let signal = rate
        .setup(cancel.clone(), phase)
        .await
        .with_context(|| format!("failed to setup hatch rate for phase {}", phase.name))?;

    if let Err(err) = phase.invoker.setup(phase, bencher).await {
        // the rate may already hold a producer task or ticket pool
        rate.close();
        return Err(err)
            .with_context(|| format!("failed to setup invoker for phase {}", phase.name));
    }

    let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(1);
    let mut workers = Vec::with_capacity(phase.threads);
    for _ in 0..phase.threads {
        let rate = rate.clone();
        let invoker = phase.invoker.clone();
        let cancel = cancel.clone();
        let error_tx = error_tx.clone();
        let strict = bencher.is_strict();
        workers.push(tokio::spawn(async move {
            while !cancel.is_cancelled() {
                match invoker.exec(rate.as_ref()).await {
                    Ok(()) => {}
                    Err(ExecError::Closed(_)) => break,
                    Err(ExecError::Invocation(err)) => {
                        if strict {
                            let _ = error_tx.try_send(err);
                            break;
                        }
                        debug!("invocation failed: {err:#}");
                    }
                }
            }
        }));
    }
    drop(error_tx);

    let strict_error = wait_on(signal.as_ref(), phase.timeout, &mut error_rx).await;

    cancel.cancel();
    rate.close();
    for worker in workers {
        let _ = worker.await;
    }

    if let Some(hook) = &phase.post_run {
        info!("run post-phase {}", phase.name);
        if let Err(err) = hook() {
            error!("failed to perform post run in phase {}: {err:#}", phase.name);
        }
    }

    match strict_error {
        Some(err) => Err(err.context(format!("invocation failed in phase {}", phase.name))),
        None => Ok(()),
    }
}

/// Block until the completion signal fires, the timeout elapses, or a
/// strict-mode worker error arrives; with neither signal nor timeout this
/// is a degenerate no-op. Spurious early releases are tolerated by the
/// closing sequence that follows.
async fn wait_on(
    signal: Option<&Completion>,
    timeout: Option<Duration>,
    errors: &mut mpsc::Receiver<anyhow::Error>,
) -> Option<anyhow::Error> {
    if signal.is_none() && timeout.is_none() {
        return None;
    }

    let signal_released = async {
        match signal {
            Some(signal) => signal.wait().await,
            None => std::future::pending().await,
        }
    };
    let deadline_reached = async {
        match timeout {
            Some(timeout) => sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = signal_released => None,
        _ = deadline_reached => None,
        // recv also yields when every worker already exited
        maybe_error = errors.recv() => maybe_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wait_on_nothing_returns_immediately() {
        let (_tx, mut rx) = mpsc::channel(1);
        let started = Instant::now();
        assert!(wait_on(None, None, &mut rx).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_on_timeout_releases() {
        let (_tx, mut rx) = mpsc::channel(1);
        let started = Instant::now();
        let result = wait_on(None, Some(Duration::from_millis(100)), &mut rx).await;
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wait_on_signal_beats_timeout() {
        let (_tx, mut rx) = mpsc::channel(1);
        let signal = Completion::new();
        let notifier = signal.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            notifier.notify();
        });

        let started = Instant::now();
        wait_on(Some(&signal), Some(Duration::from_secs(10)), &mut rx).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn wait_on_surfaces_worker_errors() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(anyhow::anyhow!("boom")).unwrap();

        let error = wait_on(None, Some(Duration::from_secs(10)), &mut rx).await;
        assert_eq!(error.unwrap().to_string(), "boom");
    }
}
