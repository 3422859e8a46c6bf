//! Per-session timeout guard.
//!
//! Armed once the controller is ready. One-shot escalation: when the budget
//! elapses, ask the controller to abandon the in-flight step, give it a fixed
//! grace period to comply, then kill the process. Disarmed on normal
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::channel::StepChannel;
use crate::supervisor::ControllerProcess;

/// Grace between the abandon request and the forcible kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(15);

/// One-shot session watchdog.
#[derive(Debug)]
pub struct TimeoutGuard {
    disarm: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// Start the countdown.
    pub fn arm(
        channel: StepChannel,
        process: Arc<Mutex<ControllerProcess>>,
        budget: Duration,
        grace: Duration,
    ) -> Self {
        let disarm = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));

        let token = disarm.clone();
        let flag = Arc::clone(&fired);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(budget) => {}
            }
            flag.store(true, Ordering::SeqCst);
            warn!(budget_secs = budget.as_secs(), "session timeout elapsed, escalating");

            // Best effort: the controller may already be wedged or gone.
            if channel.abandon().await.is_err() {
                warn!("abandon request failed; proceeding to kill");
            }

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(grace) => {}
            }
            process.lock().await.kill().await;
        });

        Self { disarm, fired }
    }

    /// True once the budget has elapsed and escalation began.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Cancel the countdown. Safe to call more than once.
    pub fn disarm(&self) {
        self.disarm.cancel();
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.disarm.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::token::Token;
    use std::process::Stdio;

    fn sleeper() -> Arc<Mutex<ControllerProcess>> {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        Arc::new(Mutex::new(ControllerProcess::from_child(
            child,
            "guard-test".to_string(),
            None,
        )))
    }

    fn dead_channel() -> StepChannel {
        // Points at a port nothing listens on; abandon is best-effort.
        StepChannel::new(
            "http://127.0.0.1:9".to_string(),
            Token::from_string("t"),
            None,
            String::new(),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn fires_and_kills_after_budget_plus_grace() {
        let process = sleeper();
        let guard = TimeoutGuard::arm(
            dead_channel(),
            Arc::clone(&process),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(guard.fired());
        assert!(!process.lock().await.is_alive());
    }

    #[tokio::test]
    async fn disarm_prevents_escalation() {
        let process = sleeper();
        let guard = TimeoutGuard::arm(
            dead_channel(),
            Arc::clone(&process),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        guard.disarm();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!guard.fired());
        assert!(process.lock().await.is_alive());
        process.lock().await.kill().await;
    }
}
