use crate::config::ClientConfig;
use crate::crash::write_crash_report;
use crate::handler::MessageHandler;
use crate::notify::Notifier;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use page_proto::{decode_message, Command, DecodeError, ProtocolError, RelayCodec};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Upper bound on the goodbye sequence
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Smallest heartbeat period, `interval` rejects zero
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Synced,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Undecodable message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Write timeout")]
    WriteTimeout,
}

#[derive(Debug)]
pub enum LossReason {
    /// The relay closed the connection
    Closed,
    /// No heartbeat reply within the timeout
    HeartbeatTimeout,
    Transport(SessionError),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Closed => f.write_str("closed by relay"),
            LossReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            LossReason::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Shutdown was requested locally
    Shutdown,
    /// The connection went away and may be retried
    Lost(LossReason),
    /// The stream could not be decoded
    Failed(SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub password: String,
    pub heartbeat: bool,
    pub timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: Option<u32>,
    pub crash_dir: PathBuf,
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            password: config.relay.password.clone(),
            heartbeat: config.heartbeat.enabled,
            timeout: config.heartbeat_timeout(),
            write_timeout: Duration::from_secs(config.limits.write_timeout_secs),
            max_frame_bytes: config.limits.max_frame_bytes,
            crash_dir: config.diagnostics.crash_dir.clone(),
        }
    }
}

/// One relay connection from handshake to close
pub struct Session<S> {
    framed: Framed<S, RelayCodec>,
    config: SessionConfig,
    handler: MessageHandler,
    state: SessionState,
    reached_synced: bool,
    last_heartbeat_ack: Option<Instant>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: SessionConfig, notifier: Arc<dyn Notifier>) -> Self {
        let codec = match config.max_frame_bytes {
            Some(max) => RelayCodec::with_max_frame_size(max),
            None => RelayCodec::new(),
        };

        Self {
            framed: Framed::new(stream, codec),
            config,
            handler: MessageHandler::new(notifier),
            state: SessionState::Connecting,
            reached_synced: false,
            last_heartbeat_ack: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the relay answered the initial buffer list
    pub fn reached_synced(&self) -> bool {
        self.reached_synced
    }

    pub fn last_heartbeat_ack(&self) -> Option<Instant> {
        self.last_heartbeat_ack
    }

    pub fn remote_version(&self) -> Option<&str> {
        self.handler.version().map(|v| v.version.as_str())
    }

    /// Runs the session until the connection ends or shutdown is signalled.
    /// `quit` is attempted on every exit path.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> SessionOutcome {
        if *shutdown.borrow() {
            self.state = SessionState::Closed;
            return SessionOutcome::Shutdown;
        }

        self.state = SessionState::Handshaking;
        let outcome = match self.handshake().await {
            Ok(()) => self.event_loop(&mut shutdown).await,
            Err(e) => SessionOutcome::Lost(LossReason::Transport(e)),
        };

        self.close().await;
        outcome
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        info!("Starting relay handshake");
        let password = self.config.password.clone();
        self.send(Command::Init { password }).await?;
        self.send(Command::BufferList).await?;
        self.send(Command::Sync).await?;
        self.send(Command::InfoVersion).await?;
        Ok(())
    }

    async fn event_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionOutcome {
        let heartbeat_enabled = self.config.heartbeat;
        let watchdog_timeout = self.config.timeout;
        let period = (watchdog_timeout / 3).max(MIN_HEARTBEAT_PERIOD);

        // both timers belong to this session and are dropped with it
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watchdog = sleep(watchdog_timeout);
        tokio::pin!(watchdog);

        if heartbeat_enabled {
            debug!("Heartbeat every {:?}, timeout {:?}", period, watchdog_timeout);
        }

        loop {
            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => match self.process_frame(&frame).await {
                        Ok(true) => watchdog.as_mut().reset(Instant::now() + watchdog_timeout),
                        Ok(false) => {}
                        Err(e @ SessionError::Decode(_)) => return SessionOutcome::Failed(e),
                        Err(e) => return SessionOutcome::Lost(LossReason::Transport(e)),
                    },
                    Some(Err(ProtocolError::Io(e))) => {
                        return SessionOutcome::Lost(LossReason::Transport(ProtocolError::Io(e).into()));
                    }
                    Some(Err(e)) => {
                        error!("Unrecoverable framing error: {}", e);
                        self.report_undecodable(&self.framed.read_buffer()[..], &e).await;
                        return SessionOutcome::Failed(e.into());
                    }
                    None => {
                        info!("Relay closed the connection");
                        return SessionOutcome::Lost(LossReason::Closed);
                    }
                },
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let probe = self.handler.heartbeat_probe();
                    if let Err(e) = self.send(probe).await {
                        return SessionOutcome::Lost(LossReason::Transport(e));
                    }
                }
                _ = &mut watchdog, if heartbeat_enabled => {
                    warn!("No heartbeat reply within {:?}", watchdog_timeout);
                    return SessionOutcome::Lost(LossReason::HeartbeatTimeout);
                }
                _ = shutdown.changed() => {
                    info!("Shutdown requested");
                    return SessionOutcome::Shutdown;
                }
            }
        }
    }

    /// Decodes and dispatches one frame. Returns whether it acknowledged a
    /// heartbeat.
    async fn process_frame(&mut self, frame: &Bytes) -> Result<bool, SessionError> {
        let message = match decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                self.report_undecodable(frame, &e).await;
                return Err(e.into());
            }
        };

        let effects = match self.handler.handle(&message) {
            Ok(effects) => effects,
            Err(e) => {
                error!("Failed to handle {} message: {}", message.id, e);
                return Ok(false);
            }
        };

        if effects.synced && self.state == SessionState::Handshaking {
            info!("Session synced");
            self.state = SessionState::Synced;
            self.reached_synced = true;
        }

        for command in effects.commands {
            self.send(command).await?;
        }

        if effects.heartbeat_acked {
            self.last_heartbeat_ack = Some(Instant::now());
        }
        Ok(effects.heartbeat_acked)
    }

    /// Persists bytes that could not be decoded before the error surfaces
    async fn report_undecodable(&self, bytes: &[u8], error: &dyn fmt::Display) {
        if let Err(io) = write_crash_report(&self.config.crash_dir, bytes, error).await {
            error!("Failed to write crash report: {}", io);
        }
    }

    async fn send(&mut self, command: Command) -> Result<(), SessionError> {
        timeout(self.config.write_timeout, self.framed.send(command))
            .await
            .map_err(|_| SessionError::WriteTimeout)??;
        Ok(())
    }

    /// Best-effort `quit` followed by transport shutdown
    async fn close(&mut self) {
        self.state = SessionState::Closing;

        let goodbye = async {
            self.framed.send(Command::Quit).await?;
            self.framed.get_mut().shutdown().await?;
            Ok::<(), ProtocolError>(())
        };
        match timeout(QUIT_TIMEOUT, goodbye).await {
            Ok(Ok(())) => debug!("Sent quit"),
            Ok(Err(e)) => debug!("Could not send quit: {}", e),
            Err(_) => debug!("Relay unresponsive while quitting"),
        }

        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::{RAW_REPORT, TEXT_REPORT};
    use crate::handler::testing::*;
    use crate::notify::testing::RecordingNotifier;
    use page_proto::{encode_message, Message};
    use tempdir::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn expect(&mut self, line: &str) {
            assert_eq!(self.lines.next_line().await.unwrap().unwrap(), line);
        }

        async fn expect_handshake(&mut self) {
            self.expect("init password=secret,compression=off").await;
            self.expect("(buffer_list) hdata buffer:gui_buffers(*) name").await;
            self.expect("sync").await;
            self.expect("info version").await;
        }

        async fn send(&mut self, message: &Message) {
            self.writer.write_all(&encode_message(message)).await.unwrap();
        }
    }

    fn config(heartbeat: bool, crash_dir: PathBuf) -> SessionConfig {
        SessionConfig {
            password: "secret".to_string(),
            heartbeat,
            timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(5),
            max_frame_bytes: None,
            crash_dir,
        }
    }

    fn setup(heartbeat: bool, crash_dir: &TempDir) -> (Session<DuplexStream>, Peer, RecordingNotifier) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, writer) = tokio::io::split(server);
        let notifier = RecordingNotifier::default();
        let config = config(heartbeat, crash_dir.path().to_path_buf());
        let session = Session::new(client, config, Arc::new(notifier.clone()));
        let peer = Peer {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (session, peer, notifier)
    }

    #[tokio::test]
    async fn test_session_tracks_buffers_and_notifies() {
        let dir = TempDir::new("page-session").unwrap();
        let (mut session, mut peer, notifier) = setup(false, &dir);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = async move {
            peer.expect_handshake().await;
            peer.send(&buffers("buffer_list", &[("0x1", Some("weechat"))])).await;

            peer.send(&buffers("_buffer_opened", &[("0xabc", Some("#rust"))])).await;
            peer.expect("sync 0xabc *").await;

            let line = line("0xabc", true, true, &["irc_privmsg"], "alice", "page me");
            peer.send(&lines(vec![line])).await;

            peer.send(&buffers("_buffer_closing", &[("0xabc", None)])).await;
            peer.expect("desync 0xabc *").await;

            shutdown_tx.send(true).unwrap();
            peer.expect("quit").await;
        };

        let (outcome, ()) = tokio::join!(session.run(shutdown_rx), relay);

        assert!(matches!(outcome, SessionOutcome::Shutdown));
        assert!(session.reached_synced());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(notifier.messages(), vec!["#rust: alice page me"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_heartbeat_reply_drops_session() {
        let dir = TempDir::new("page-session").unwrap();
        let (mut session, mut peer, _) = setup(true, &dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = Instant::now();

        // read everything, answer nothing
        let relay = tokio::spawn(async move {
            while let Ok(Some(_)) = peer.lines.next_line().await {}
        });

        let outcome = session.run(shutdown_rx).await;
        assert!(matches!(outcome, SessionOutcome::Lost(LossReason::HeartbeatTimeout)));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(session.last_heartbeat_ack().is_none());
        relay.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reply_resets_watchdog() {
        let dir = TempDir::new("page-session").unwrap();
        let (mut session, mut peer, _) = setup(true, &dir);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = async move {
            peer.expect_handshake().await;
            let mut probes = 0;
            loop {
                tokio::select! {
                    line = peer.lines.next_line() => match line.unwrap().as_deref() {
                        Some("test") | Some("ping") => {
                            probes += 1;
                            peer.send(&Message::new("_pong", vec![])).await;
                        }
                        Some("quit") | None => break,
                        Some(other) => panic!("unexpected command {}", other),
                    },
                    _ = sleep(Duration::from_secs(10)), if probes == 0 => panic!("no probe sent"),
                }
                if probes == 10 {
                    shutdown_tx.send(true).unwrap();
                }
            }
            probes
        };

        let (outcome, probes) = tokio::join!(session.run(shutdown_rx), relay);

        // ten probes at one second intervals outlive the three second timeout
        assert!(matches!(outcome, SessionOutcome::Shutdown));
        assert!(probes >= 10);
        assert!(session.last_heartbeat_ack().is_some());
    }

    #[tokio::test]
    async fn test_undecodable_frame_fails_session_with_report() {
        let dir = TempDir::new("page-session").unwrap();
        let (mut session, mut peer, _) = setup(false, &dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let bad = b"\x00\x00\x00\x0c\x00\xff\xff\xff\xffxyz";
        let relay = async move {
            peer.expect_handshake().await;
            peer.writer.write_all(bad).await.unwrap();
            peer.expect("quit").await;
        };

        let (outcome, ()) = tokio::join!(session.run(shutdown_rx), relay);

        assert!(matches!(
            outcome,
            SessionOutcome::Failed(SessionError::Decode(DecodeError::UnknownType(_)))
        ));
        assert_eq!(std::fs::read(dir.path().join(RAW_REPORT)).unwrap(), bad);
    }

    #[tokio::test]
    async fn test_relay_hangup_is_a_loss() {
        let dir = TempDir::new("page-session").unwrap();
        let (mut session, mut peer, _) = setup(false, &dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = async move {
            peer.expect_handshake().await;
            drop(peer);
        };

        let (outcome, ()) = tokio::join!(session.run(shutdown_rx), relay);

        assert!(matches!(outcome, SessionOutcome::Lost(LossReason::Closed)));
        assert!(!session.reached_synced());
    }

    #[tokio::test]
    async fn test_impossible_frame_length_fails_session_with_report() {
        let dir = TempDir::new("page-session").unwrap();
        let (mut session, mut peer, _) = setup(false, &dir);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let bad = b"\x00\x00\x00\x03\x00garbage";
        let relay = async move {
            peer.expect_handshake().await;
            peer.writer.write_all(bad).await.unwrap();
            peer.expect("quit").await;
        };

        let (outcome, ()) = tokio::join!(session.run(shutdown_rx), relay);

        assert!(matches!(
            outcome,
            SessionOutcome::Failed(SessionError::Protocol(ProtocolError::Decode(DecodeError::InvalidLength(3))))
        ));
        let raw = std::fs::read(dir.path().join(RAW_REPORT)).unwrap();
        assert!(raw.starts_with(b"\x00\x00\x00\x03"));
        let text = std::fs::read_to_string(dir.path().join(TEXT_REPORT)).unwrap();
        assert!(text.contains("Invalid length field: 3"), "{}", text);
    }
}
