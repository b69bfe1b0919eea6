//! The agent: dials a hub and executes its commands
//!
//! An [`Agent`] maintains one outbound transport to a hub and runs the
//! user-supplied [`Handler`] for every command the hub dispatches. Output
//! written to the handler's [`OutputStream`]s flows back to the hub as the
//! command's stdout/stderr; the handler's return code travels back as the
//! exit status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::server;
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::CONTROL_SUBSYSTEM;
use crate::errors::Error;
use crate::keymaster::KeyMaster;
use crate::keys::{fingerprint, KeyPair};

/// Default bound on the dial and handshake.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a handler produced for one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    code: i32,
    shutdown: bool,
}

impl Outcome {
    /// Report this return code and keep serving commands.
    pub fn exit(code: i32) -> Self {
        Self {
            code,
            shutdown: false,
        }
    }

    /// Report this return code, then disconnect from the hub. The
    /// surrounding [`Agent::connect`] returns `Ok(())`; this is a
    /// voluntary shutdown, not a failure.
    pub fn shutdown(code: i32) -> Self {
        Self {
            code,
            shutdown: true,
        }
    }

    /// The return code reported to the hub.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Whether the agent disconnects after reporting.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }
}

/// Executes one command on behalf of the hub.
///
/// Implemented automatically for async closures:
///
/// ```ignore
/// agent.connect(&addr, |payload, mut out, _err| async move {
///     out.write_line("done").await.ok();
///     Outcome::exit(0)
/// }).await?;
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Run one command. `payload` is the opaque bytes the hub's client
    /// supplied, verbatim.
    async fn handle(&self, payload: Vec<u8>, stdout: OutputStream, stderr: OutputStream)
        -> Outcome;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Vec<u8>, OutputStream, OutputStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Outcome> + Send + 'static,
{
    async fn handle(
        &self,
        payload: Vec<u8>,
        stdout: OutputStream,
        stderr: OutputStream,
    ) -> Outcome {
        (self)(payload, stdout, stderr).await
    }
}

/// One of a command's output streams (stdout or stderr), writing straight
/// through to the hub.
pub struct OutputStream {
    handle: server::Handle,
    id: ChannelId,
    ext: Option<u32>,
}

impl OutputStream {
    fn stdout(handle: server::Handle, id: ChannelId) -> Self {
        Self {
            handle,
            id,
            ext: None,
        }
    }

    fn stderr(handle: server::Handle, id: ChannelId) -> Self {
        Self {
            handle,
            id,
            ext: Some(1),
        }
    }

    /// Write raw bytes. The hub splits them into lines on its side.
    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        let buf = CryptoVec::from_slice(data.as_ref());
        let sent = match self.ext {
            None => self.handle.data(self.id, buf).await,
            Some(code) => self.handle.extended_data(self.id, code, buf).await,
        };
        sent.map_err(|_| Error::PrematureDisconnect)
    }

    /// Write a line, newline-terminated.
    pub async fn write_line(&mut self, line: impl AsRef<str>) -> Result<(), Error> {
        self.write(format!("{}\n", line.as_ref())).await
    }
}

/// Configuration for an [`Agent`].
pub struct AgentConfig {
    /// Name this agent registers under; doubles as the subject its key
    /// must be authorized for on the hub
    pub identity: String,
    /// The agent's keypair; required before [`Agent::connect`]
    pub key: Option<KeyPair>,
    /// Bound on the dial and handshake; zero means [`DEFAULT_TIMEOUT`]
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A process that dials out to a hub and awaits instructions.
pub struct Agent {
    identity: String,
    key: Option<KeyPair>,
    timeout: Duration,
    keymaster: KeyMaster,
    accept_any: bool,
}

impl Agent {
    /// Create an agent from its configuration.
    pub fn new(config: AgentConfig) -> Self {
        let timeout = if config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            config.timeout
        };
        Self {
            identity: config.identity,
            key: config.key,
            timeout,
            keymaster: KeyMaster::new(false),
            accept_any: false,
        }
    }

    /// Trust whatever key the hub presents. Development convenience; use
    /// [`Agent::authorize_key`] in production.
    pub fn accept_any_host_key(&mut self) {
        self.accept_any = true;
    }

    /// Trust `key` when dialing `subject` — a hostname, a host:port
    /// address, or the wildcard `*`.
    pub fn authorize_key(&mut self, subject: &str, key: &PublicKey) {
        self.keymaster.authorize(key, &[subject]);
    }

    /// Dial the hub at `addr`, authenticate, and serve commands with
    /// `handler` until the hub hangs up or the handler asks to shut down.
    ///
    /// Returns `Ok(())` on voluntary shutdown, an error if the dial,
    /// handshake, or key verification fails, or if the transport dies
    /// under us.
    pub async fn connect(&self, addr: &str, handler: impl Handler) -> Result<(), Error> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| Error::configuration("missing private key"))?;
        if self.identity.is_empty() {
            return Err(Error::configuration("missing identity"));
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "dial timed out",
                ))
            })??;
        let peer = stream.peer_addr()?;
        debug!(identity = %self.identity, %peer, "dialed hub");

        // Subjects the hub's key may be authorized under: the address as
        // dialed, the bare host, and the resolved peer address.
        let mut candidates = vec![addr.to_string(), peer.to_string()];
        if let Some((host, _)) = addr.rsplit_once(':') {
            candidates.push(host.to_string());
        }

        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![key.private().clone()],
            ..Default::default()
        });

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let rejected = Arc::new(AtomicBool::new(false));
        let session_handler = AgentSession {
            identity: self.identity.clone(),
            keymaster: self.keymaster.clone(),
            accept_any: self.accept_any,
            candidates,
            handler: Arc::new(handler),
            busy: Arc::new(AtomicBool::new(false)),
            pending_shutdown: Arc::new(AtomicBool::new(false)),
            shutdown: shutdown_tx,
            rejected: rejected.clone(),
        };

        let session = server::run_stream(config, stream, session_handler).await?;

        let outcome = tokio::select! {
            result = session => Some(result),
            _ = shutdown_rx.recv() => None,
        };

        if rejected.load(Ordering::Relaxed) {
            return Err(Error::HubNotAuthorized(addr.to_string()));
        }
        match outcome {
            Some(result) => {
                result?;
                Ok(())
            }
            None => {
                info!(identity = %self.identity, "agent shut down at handler's request");
                Ok(())
            }
        }
    }
}

/// SSH event handler for the agent's side of the transport.
struct AgentSession {
    identity: String,
    keymaster: KeyMaster,
    accept_any: bool,
    candidates: Vec<String>,
    handler: Arc<dyn Handler>,
    busy: Arc<AtomicBool>,
    pending_shutdown: Arc<AtomicBool>,
    shutdown: mpsc::Sender<()>,
    rejected: Arc<AtomicBool>,
}

impl server::Handler for AgentSession {
    type Error = Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<server::Auth, Self::Error> {
        let candidates: Vec<&str> = self.candidates.iter().map(String::as_str).collect();
        if self.accept_any || self.keymaster.host_authorized(key, &candidates) {
            debug!(user, "hub key accepted");
            Ok(server::Auth::Accept)
        } else {
            warn!(
                fingerprint = %fingerprint(key),
                "hub key not authorized; refusing"
            );
            self.rejected.store(true, Ordering::Relaxed);
            Ok(server::Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<server::Msg>,
        _session: &mut server::Session,
    ) -> Result<bool, Self::Error> {
        debug!(id = ?channel.id(), "session channel opened by hub");
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        if name != CONTROL_SUBSYSTEM {
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        session.channel_success(channel_id)?;
        let handle = session.handle();
        let hello = format!("{}\n", self.identity);
        let identity = self.identity.clone();
        tokio::spawn(async move {
            if handle
                .data(channel_id, CryptoVec::from_slice(hello.as_bytes()))
                .await
                .is_ok()
            {
                debug!(identity = %identity, "announced identity on control channel");
            }
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        if self.busy.swap(true, Ordering::AcqRel) {
            warn!("refusing exec while another command is in flight");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        session.channel_success(channel_id)?;

        let handle = session.handle();
        let payload = data.to_vec();
        let handler = self.handler.clone();
        let busy = self.busy.clone();
        let pending_shutdown = self.pending_shutdown.clone();
        tokio::spawn(async move {
            let stdout = OutputStream::stdout(handle.clone(), channel_id);
            let stderr = OutputStream::stderr(handle.clone(), channel_id);
            let outcome = handler.handle(payload, stdout, stderr).await;

            let _ = handle
                .exit_status_request(channel_id, outcome.code() as u32)
                .await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
            busy.store(false, Ordering::Release);

            if outcome.is_shutdown() {
                // Disconnect only once the hub acknowledges the channel
                // close, so the exit status is not lost in the teardown.
                pending_shutdown.store(true, Ordering::Release);
            }
        });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        debug!(id = ?channel_id, "channel closed by hub");
        if self.pending_shutdown.load(Ordering::Acquire) {
            let _ = self.shutdown.try_send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_accessors() {
        let ok = Outcome::exit(0);
        assert_eq!(ok.code(), 0);
        assert!(!ok.is_shutdown());

        let last = Outcome::shutdown(3);
        assert_eq!(last.code(), 3);
        assert!(last.is_shutdown());
    }

    #[test]
    fn test_zero_timeout_takes_default() {
        let agent = Agent::new(AgentConfig {
            identity: "bob@postgres.ql".to_string(),
            timeout: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(agent.timeout, DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_requires_a_private_key() {
        let agent = Agent::new(AgentConfig {
            identity: "bob@postgres.ql".to_string(),
            ..Default::default()
        });
        let err = agent
            .connect("127.0.0.1:4771", |_: Vec<u8>, _: OutputStream, _: OutputStream| async {
                Outcome::exit(0)
            })
            .await
            .expect_err("no key");
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_an_identity() {
        let agent = Agent::new(AgentConfig {
            key: Some(KeyPair::generate().expect("generate")),
            ..Default::default()
        });
        let err = agent
            .connect("127.0.0.1:4771", |_: Vec<u8>, _: OutputStream, _: OutputStream| async {
                Outcome::exit(0)
            })
            .await
            .expect_err("no identity");
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_connect_fails_when_nobody_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let mut agent = Agent::new(AgentConfig {
            identity: "bob@postgres.ql".to_string(),
            key: Some(KeyPair::generate().expect("generate")),
            ..Default::default()
        });
        agent.accept_any_host_key();

        let err = agent
            .connect(&addr, |_: Vec<u8>, _: OutputStream, _: OutputStream| async {
                Outcome::exit(0)
            })
            .await
            .expect_err("connection refused");
        assert!(matches!(err, Error::Io(_) | Error::Transport(_)));
    }
}
