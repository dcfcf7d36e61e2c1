//! Process signal handling. SIGTERM and SIGINT are equivalent: the first
//! signal asks the agent to drain in-flight work, a repeat demands an
//! immediate exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

/// What a received signal asks the main loop to do.
#[derive(Debug, Clone, Copy)]
pub enum StopSignal {
    /// Stop claiming, let workers finish their current job, then exit.
    Drain,
    /// Exit without waiting for in-flight work.
    ExitNow,
}

/// Translate one received signal into a [`StopSignal`], escalating on
/// repeats. Returns false once the listener should stop (exit demanded).
fn signal_received(seen: &AtomicU8, tx: &mpsc::UnboundedSender<StopSignal>) -> bool {
    let prior = seen.fetch_add(1, Ordering::SeqCst);
    if prior == 0 {
        let _ = tx.send(StopSignal::Drain);
        true
    } else {
        let _ = tx.send(StopSignal::ExitNow);
        false
    }
}

/// Spawn listeners for SIGINT and SIGTERM feeding the stop channel. Both
/// listeners share one signal count, so ctrl-c followed by SIGTERM (or vice
/// versa) escalates just like a repeated ctrl-c.
pub fn spawn_signal_listeners(tx: mpsc::UnboundedSender<StopSignal>) {
    let seen = Arc::new(AtomicU8::new(0));

    {
        let seen = seen.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !signal_received(&seen, &tx) {
                    return;
                }
            }
        });
    }

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let Ok(mut term) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };
            while term.recv().await.is_some() {
                if !signal_received(&seen, &tx) {
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_signal_drains_then_escalates() {
        let seen = AtomicU8::new(0);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(signal_received(&seen, &tx));
        assert!(matches!(rx.try_recv(), Ok(StopSignal::Drain)));

        assert!(!signal_received(&seen, &tx));
        assert!(matches!(rx.try_recv(), Ok(StopSignal::ExitNow)));

        assert!(!signal_received(&seen, &tx));
        assert!(matches!(rx.try_recv(), Ok(StopSignal::ExitNow)));
    }
}
