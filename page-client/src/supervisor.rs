//! Reconnect policy around relay sessions.

use crate::config::ClientConfig;
use crate::notify::Notifier;
use crate::session::{Session, SessionConfig, SessionOutcome};
use rand::Rng;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Giving up on relay {addr} after {attempts} retries")]
    GaveUp { addr: String, attempts: u32 },
}

/// Exponential backoff: `initial`, doubling up to `max`, for at most
/// `max_retries` consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    delay: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            max_retries,
            delay: initial,
            attempts: 0,
        }
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.delay = self.initial;
        self.attempts = 0;
    }

    /// Records a failure and returns the wait before the next attempt, or
    /// `None` once the retry budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_retries {
            return None;
        }
        self.attempts += 1;

        let delay = self.delay;
        self.delay = std::cmp::min(self.delay * 2, self.max);
        Some(delay)
    }
}

/// Adds up to 10% random jitter
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

pub struct Supervisor {
    config: ClientConfig,
    notifier: Arc<dyn Notifier>,
    backoff: Backoff,
}

impl Supervisor {
    pub fn new(config: ClientConfig, notifier: Arc<dyn Notifier>) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect.initial_backoff_ms),
            Duration::from_millis(config.reconnect.max_backoff_ms),
            config.reconnect.max_retries,
        );

        Self {
            config,
            notifier,
            backoff,
        }
    }

    /// Connects, runs sessions and reconnects until shutdown or until the
    /// retry budget is spent
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let addr = self.config.relay_addr();
        let connect_timeout = Duration::from_secs(self.config.reconnect.connect_timeout_secs);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            info!("Connecting to relay at {}...", addr);
            match timeout(connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    info!("Connected to {}", addr);
                    self.notifier.notify(&format!("Connected to relay {}", addr));

                    let mut session = Session::new(
                        stream,
                        SessionConfig::from(&self.config),
                        self.notifier.clone(),
                    );
                    let outcome = session.run(shutdown.clone()).await;
                    debug!(
                        "Session ended in state {:?} (relay version {:?}, last heartbeat ack {:?})",
                        session.state(),
                        session.remote_version(),
                        session.last_heartbeat_ack()
                    );

                    if session.reached_synced() {
                        self.backoff.reset();
                    }

                    match outcome {
                        SessionOutcome::Shutdown => {
                            info!("Session closed on shutdown");
                            return Ok(());
                        }
                        SessionOutcome::Lost(reason) => {
                            warn!("Connection to {} lost: {}", addr, reason);
                            self.notifier
                                .notify(&format!("Lost relay connection ({}), retrying", reason));
                        }
                        SessionOutcome::Failed(e) => {
                            error!("Session with {} failed: {}", addr, e);
                            self.notifier
                                .notify(&format!("Relay session failed ({}), retrying", e));
                        }
                    }
                }
                Ok(Err(e)) => warn!("Failed to connect to {}: {}", addr, e),
                Err(_) => warn!("Connection to {} timed out", addr),
            }

            let Some(delay) = self.backoff.next_delay() else {
                let err = SupervisorError::GaveUp {
                    addr: addr.clone(),
                    attempts: self.backoff.attempts(),
                };
                error!("{}", err);
                self.notifier.notify(&err.to_string());
                return Err(err);
            };

            let delay = jittered(delay);
            info!(
                "Retrying in {:?} (attempt {}/{})",
                delay,
                self.backoff.attempts(),
                self.config.reconnect.max_retries
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::buffers;
    use crate::notify::testing::RecordingNotifier;
    use page_proto::encode_message;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn config(port: u16, max_retries: u32) -> ClientConfig {
        let mut config = ClientConfig::from_toml_str(&format!(
            r#"
            [relay]
            host = "127.0.0.1"
            port = {}
            password = "secret"

            [heartbeat]
            enabled = false

            [reconnect]
            initial_backoff_ms = 1
            max_backoff_ms = 4
            max_retries = {}
            connect_timeout_secs = 1
            "#,
            port, max_retries
        ))
        .unwrap();
        config.diagnostics.crash_dir = std::env::temp_dir();
        config
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 5);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
        assert_eq!(backoff.attempts(), 5);
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 3);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(1100));
        }
        assert_eq!(jittered(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_gives_up_when_relay_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let notifier = RecordingNotifier::default();
        let mut supervisor = Supervisor::new(config(port, 2), Arc::new(notifier.clone()));
        let (_tx, rx) = watch::channel(false);

        let result = supervisor.run(rx).await;

        assert!(matches!(result, Err(SupervisorError::GaveUp { attempts: 2, .. })));
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Giving up"));
    }

    #[tokio::test]
    async fn test_reports_lost_connections_and_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // accept and hang up immediately, twice
        let relay = tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }
        });

        let notifier = RecordingNotifier::default();
        let mut supervisor = Supervisor::new(config(port, 1), Arc::new(notifier.clone()));
        let (_tx, rx) = watch::channel(false);

        let result = supervisor.run(rx).await;
        relay.await.unwrap();

        assert!(matches!(result, Err(SupervisorError::GaveUp { .. })));
        let messages = notifier.messages();
        assert_eq!(
            messages.iter().filter(|m| m.starts_with("Connected to relay")).count(),
            2
        );
        assert_eq!(messages.iter().filter(|m| m.starts_with("Lost relay connection")).count(), 2);
        assert!(messages.last().unwrap().starts_with("Giving up"));
    }

    #[tokio::test]
    async fn test_synced_sessions_reset_retry_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // answer the handshake with a buffer list then hang up, three times;
        // the listener closes afterwards
        let relay = tokio::spawn(async move {
            for _ in 0..3 {
                let (stream, _) = listener.accept().await.unwrap();
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Some(line) = lines.next_line().await.unwrap() {
                    if line == "info version" {
                        break;
                    }
                }
                let reply = buffers("buffer_list", &[("0x1", Some("weechat"))]);
                write.write_all(&encode_message(&reply)).await.unwrap();
            }
        });

        let notifier = RecordingNotifier::default();
        let mut supervisor = Supervisor::new(config(port, 1), Arc::new(notifier.clone()));
        let (_tx, rx) = watch::channel(false);

        let result = supervisor.run(rx).await;
        relay.await.unwrap();

        // one retry allowed, yet three sessions ran because each one synced
        assert!(matches!(result, Err(SupervisorError::GaveUp { attempts: 1, .. })));
        let messages = notifier.messages();
        assert_eq!(
            messages.iter().filter(|m| m.starts_with("Connected to relay")).count(),
            3
        );
        assert_eq!(messages.iter().filter(|m| m.starts_with("Lost relay connection")).count(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retrying() {
        let notifier = RecordingNotifier::default();
        let mut supervisor = Supervisor::new(config(1, 5), Arc::new(notifier));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(supervisor.run(rx).await.is_ok());
    }
}
