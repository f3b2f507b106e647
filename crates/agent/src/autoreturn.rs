//! Per-reservation auto-return timer (§4.5, §9 Open Question): fires
//! `auto_return_time` after the last `attach` or `edit`, forcing a
//! return. `reset` restarts the clock instead of stacking timers.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::reservation::Command;

pub struct AutoReturn {
    reset_tx: mpsc::UnboundedSender<Duration>,
    task: JoinHandle<()>,
}

impl AutoReturn {
    pub fn new(duration: Duration, name: String, actor: mpsc::UnboundedSender<Command>) -> Self {
        let (reset_tx, mut reset_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut deadline = tokio::time::Instant::now() + duration;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let (reply, _rx) = tokio::sync::oneshot::channel();
                        let _ = actor.send(Command::Return { name: name.clone(), reply });
                        break;
                    }
                    next = reset_rx.recv() => {
                        match next {
                            Some(d) => deadline = tokio::time::Instant::now() + d,
                            None => break,
                        }
                    }
                }
            }
        });
        Self { reset_tx, task }
    }

    pub fn reset(&self, duration: Duration) {
        let _ = self.reset_tx.send(duration);
    }
}

impl Drop for AutoReturn {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_return_after_duration_elapses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = AutoReturn::new(Duration::from_secs(5), "r1".to_string(), tx);

        tokio::time::advance(Duration::from_secs(6)).await;
        let cmd = rx.recv().await.expect("timer should have fired");
        match cmd {
            Command::Return { name, .. } => assert_eq!(name, "r1"),
            _ => panic!("expected Return command"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_postpones_the_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = AutoReturn::new(Duration::from_secs(5), "r1".to_string(), tx);

        tokio::time::advance(Duration::from_secs(3)).await;
        timer.reset(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err(), "reset should have pushed the deadline out");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(rx.recv().await.is_some());
    }
}
