//! The hub: accepts agents, keeps the directory, dispatches commands
//!
//! A [`Hub`] binds a TCP listener and serves long-lived transports from
//! remote agents. Agents dial in; the hub runs the SSH handshake over each
//! accepted socket, verifies the agent's key against its
//! [`KeyMaster`](crate::KeyMaster), learns the agent's identity from the
//! control-channel hello, and registers the connection in its directory.
//! Clients then dispatch opaque payloads by identity with [`Hub::send`]
//! and consume the streamed [`Response`]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, HubHandler, Unregister, CONTROL_SUBSYSTEM, HUB_USERNAME};
use crate::errors::Error;
use crate::keymaster::{Authorization, KeyMaster};
use crate::keys::{fingerprint, KeyPair};
use crate::response::{Message, Response, RESPONSE_BUFFER};
use crate::session::LineBuffer;

/// Default keepalive interval between the hub and each agent.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// How long a freshly-handshaken agent gets to announce its identity.
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Which IP protocol the hub binds its listener on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IpProto {
    /// IPv4 only
    #[default]
    Tcp4,
    /// IPv6 only
    Tcp6,
}

/// Callback invoked when an agent registers or deregisters, with the
/// agent's identity and the public key it authenticated with.
pub type LifecycleHook = Arc<dyn Fn(&str, &PublicKey) + Send + Sync>;

/// Configuration for a [`Hub`].
pub struct HubConfig {
    /// Address to bind and listen on for agent transports
    pub bind: String,
    /// IP protocol to bind with
    pub ip_proto: IpProto,
    /// Host key presented to agents; required before [`Hub::listen`]
    pub host_key: Option<KeyPair>,
    /// Keepalive interval; zero means [`DEFAULT_KEEP_ALIVE`]
    pub keep_alive: Duration,
    /// Admit agents whose keys have no authorized record. They register
    /// but [`Hub::send`] refuses them until an operator approves the key.
    pub allow_unauthorized_agents: bool,
    /// Invoked after an agent registers
    pub on_connect: Option<LifecycleHook>,
    /// Invoked after an agent deregisters
    pub on_disconnect: Option<LifecycleHook>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4771".to_string(),
            ip_proto: IpProto::default(),
            host_key: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            allow_unauthorized_agents: false,
            on_connect: None,
            on_disconnect: None,
        }
    }
}

/// Directory entry for one registered agent.
struct AgentEntry {
    mailbox: mpsc::Sender<Message>,
    key: PublicKey,
    conn_id: u64,
}

#[derive(Default)]
struct Directory {
    agents: HashMap<String, AgentEntry>,
    awaits: HashMap<String, watch::Sender<bool>>,
}

struct HubInner {
    bind: String,
    ip_proto: IpProto,
    host_key: Option<KeyPair>,
    keep_alive: Duration,
    allow_unauthorized: bool,
    on_connect: Option<LifecycleHook>,
    on_disconnect: Option<LifecycleHook>,
    keymaster: KeyMaster,
    directory: Mutex<Directory>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    next_conn_id: AtomicU64,
}

/// A server from whence commands are dispatched. Agents connect *to* a
/// hub and await instructions.
///
/// Cheap to clone; clones share the same directory and listener.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub from its configuration. Strictness of the key
    /// directory follows `allow_unauthorized_agents`.
    pub fn new(config: HubConfig) -> Self {
        let keep_alive = if config.keep_alive.is_zero() {
            DEFAULT_KEEP_ALIVE
        } else {
            config.keep_alive
        };
        Self {
            inner: Arc::new(HubInner {
                bind: config.bind,
                ip_proto: config.ip_proto,
                host_key: config.host_key,
                keep_alive,
                allow_unauthorized: config.allow_unauthorized_agents,
                on_connect: config.on_connect,
                on_disconnect: config.on_disconnect,
                keymaster: KeyMaster::new(!config.allow_unauthorized_agents),
                directory: Mutex::new(Directory::default()),
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind the listener. Must be called before [`Hub::serve`]; fails if
    /// no host key is configured.
    pub async fn listen(&self) -> Result<(), Error> {
        if self.inner.host_key.is_none() {
            return Err(Error::configuration("missing host key"));
        }

        let mut candidates = tokio::net::lookup_host(&self.inner.bind).await?;
        let addr = candidates
            .find(|a| match self.inner.ip_proto {
                IpProto::Tcp4 => a.is_ipv4(),
                IpProto::Tcp6 => a.is_ipv6(),
            })
            .ok_or_else(|| {
                Error::configuration(format!(
                    "bind address {} does not resolve for {:?}",
                    self.inner.bind, self.inner.ip_proto
                ))
            })?;

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "hub listening");

        *self.inner.local_addr.lock().expect("local addr lock") = Some(local);
        *self.inner.listener.lock().expect("listener lock") = Some(listener);
        Ok(())
    }

    /// The address the listener actually bound, once [`Hub::listen`] has
    /// run. Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("local addr lock")
    }

    /// Accept and serve agent transports until the listener fails.
    /// Handshake failures are logged and skipped, never fatal.
    pub async fn serve(&self) -> Result<(), Error> {
        let listener = self
            .inner
            .listener
            .lock()
            .expect("listener lock")
            .take()
            .ok_or_else(|| Error::configuration("listen() must be called before serve()"))?;

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(self.inner.keep_alive),
            keepalive_max: 3,
            ..Default::default()
        });

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    warn!(error = %e, "accept failed; continuing");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            debug!(%peer, "inbound connection accepted");
            let hub = self.clone();
            let config = ssh_config.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(config, socket, peer).await {
                    debug!(%peer, error = %e, "agent connection ended with error");
                }
            });
        }
    }

    /// [`Hub::listen`] followed by [`Hub::serve`].
    pub async fn listen_and_serve(&self) -> Result<(), Error> {
        self.listen().await?;
        self.serve().await
    }

    /// Authorize `key` for dispatches under `identity`. Safe at any time;
    /// an already-connected agent becomes dispatchable immediately.
    pub fn authorize_key(&self, identity: &str, key: &PublicKey) {
        self.inner.keymaster.authorize(key, &[identity]);
    }

    /// Withdraw authorization of `key` for `identity`. Affects future
    /// handshakes (strict mode) and future sends; live transports stay up.
    pub fn deauthorize_key(&self, identity: &str, key: &PublicKey) {
        self.inner.keymaster.deauthorize(key, &[identity]);
    }

    /// Bootstrap authorizations from an OpenSSH `authorized_keys` file,
    /// binding each entry's comment column as the identity its key is
    /// authorized for. Returns the number of keys loaded.
    pub fn authorize_keys_file(&self, path: impl AsRef<std::path::Path>) -> Result<usize, Error> {
        let keymaster = self.inner.keymaster.clone();
        let n = crate::keys::read_authorized_keys(path, |identity, key| {
            keymaster.authorize(key, &[identity]);
        })?;
        info!(keys = n, "authorized keys loaded");
        Ok(n)
    }

    /// Snapshot of every key/subject pair the hub has seen or ruled on.
    pub fn authorizations(&self) -> Vec<Authorization> {
        self.inner.keymaster.authorizations()
    }

    /// Whether an agent with this identity is currently registered.
    pub fn knows_agent(&self, identity: &str) -> bool {
        self.inner
            .directory
            .lock()
            .expect("directory lock")
            .agents
            .contains_key(identity)
    }

    /// Identities of all currently registered agents, sorted.
    pub fn agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .directory
            .lock()
            .expect("directory lock")
            .agents
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve once an agent with this identity registers. Returns
    /// immediately if one already has. After the agent deregisters, a new
    /// call waits for the next registration.
    pub async fn await_agent(&self, identity: &str) {
        loop {
            let mut ready = {
                let mut dir = self.inner.directory.lock().expect("directory lock");
                if dir.agents.contains_key(identity) {
                    return;
                }
                dir.awaits
                    .entry(identity.to_string())
                    .or_insert_with(|| watch::channel(false).0)
                    .subscribe()
            };
            if ready.wait_for(|registered| *registered).await.is_ok() {
                return;
            }
            // Sender dropped without firing (lost a race with
            // deregistration); look again.
        }
    }

    /// Dispatch `payload` to the named agent.
    ///
    /// Fails synchronously if the agent is unknown, its key is not
    /// currently authorized, or its mailbox does not accept the message
    /// within `timeout`. On success the command is queued and the caller
    /// owns the response stream: zero or more output lines, then exactly
    /// one [`Response::Exit`] or [`Response::Error`]. Consume it, or hand
    /// it to [`Hub::ignore_replies`] so the session is not backpressured.
    pub async fn send(
        &self,
        identity: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Response>, Error> {
        let (mailbox, key) = {
            let dir = self.inner.directory.lock().expect("directory lock");
            let entry = dir
                .agents
                .get(identity)
                .ok_or_else(|| Error::AgentNotFound(identity.to_string()))?;
            (entry.mailbox.clone(), entry.key.clone())
        };

        if !self.inner.keymaster.authorized(identity, &key) {
            return Err(Error::AgentNotAuthorized(identity.to_string()));
        }

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let message = Message {
            payload: payload.into(),
            responses: tx,
        };

        // The enqueue blocks outside the directory lock; the dispatch
        // loop takes no locks while running a session.
        match tokio::time::timeout(timeout, mailbox.send(message)).await {
            Err(_) => Err(Error::DispatchTimeout(timeout)),
            Ok(Err(_)) => Err(Error::AgentNotFound(identity.to_string())),
            Ok(Ok(())) => {
                debug!(identity, "message queued");
                Ok(rx)
            }
        }
    }

    /// Drain a response stream without looking at it, so a caller that
    /// only cares about dispatch can fire and forget.
    pub async fn ignore_replies(mut responses: mpsc::Receiver<Response>) {
        while responses.recv().await.is_some() {}
    }

    /// Run one accepted socket: SSH handshake, identity hello,
    /// authorization, registration, then serve its mailbox until hangup.
    async fn handle_connection(
        &self,
        config: Arc<client::Config>,
        socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Error> {
        let host_key = self
            .inner
            .host_key
            .clone()
            .ok_or_else(|| Error::configuration("missing host key"))?;

        let (handler, seen_key) =
            HubHandler::new(self.inner.keymaster.clone(), self.inner.allow_unauthorized);
        let mut handle = client::connect_stream(config, socket, handler).await?;

        let auth = handle
            .authenticate_publickey(
                HUB_USERNAME,
                PrivateKeyWithHashAlg::new(Arc::new(host_key.private().clone()), None),
            )
            .await?;
        if !matches!(auth, AuthResult::Success) {
            return Err(Error::HubNotAuthorized(peer.to_string()));
        }

        let mut control = handle.channel_open_session().await?;
        control.request_subsystem(true, CONTROL_SUBSYSTEM).await?;
        let identity = read_hello(&mut control, HELLO_TIMEOUT).await?;

        let key = seen_key
            .lock()
            .expect("seen key lock")
            .take()
            .ok_or_else(|| Error::Protocol("handshake finished without a peer key".to_string()))?;

        if self.inner.keymaster.is_strict() {
            if !self.inner.keymaster.authorized(&identity, &key) {
                info!(
                    identity = %identity,
                    fingerprint = %fingerprint(&key),
                    "key not authorized for claimed identity; dropping"
                );
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "not authorized", "en")
                    .await;
                return Ok(());
            }
        } else {
            self.inner.keymaster.observe(&identity, &key);
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(1);
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut dir = self.inner.directory.lock().expect("directory lock");
            if dir.agents.contains_key(&identity) {
                drop(dir);
                info!(identity = %identity, "duplicate registration refused");
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "already registered", "en")
                    .await;
                return Ok(());
            }
            dir.agents.insert(
                identity.clone(),
                AgentEntry {
                    mailbox: mailbox_tx,
                    key: key.clone(),
                    conn_id,
                },
            );
            if let Some(ready) = dir.awaits.get(&identity) {
                let _ = ready.send(true);
            }
        }

        info!(
            identity = %identity,
            %peer,
            fingerprint = %fingerprint(&key),
            "agent registered"
        );
        if let Some(hook) = &self.inner.on_connect {
            hook(&identity, &key);
        }

        let connection = Connection {
            identity,
            conn_id,
            handle,
            control,
            mailbox: mailbox_rx,
            closed: CancellationToken::new(),
            registry: Arc::new(self.clone()),
        };
        connection.serve().await;
        Ok(())
    }
}

impl Unregister for Hub {
    fn unregister(&self, identity: &str, conn_id: u64) {
        let removed = {
            let mut dir = self.inner.directory.lock().expect("directory lock");
            match dir.agents.get(identity) {
                Some(entry) if entry.conn_id == conn_id => {
                    let entry = dir.agents.remove(identity).expect("entry present");
                    dir.awaits.remove(identity);
                    Some(entry.key)
                }
                _ => None,
            }
        };
        if let Some(key) = removed {
            info!(identity = %identity, "agent unregistered");
            if let Some(hook) = &self.inner.on_disconnect {
                hook(identity, &key);
            }
        }
    }
}

/// Read the agent's identity line from the freshly-opened control
/// channel.
async fn read_hello(control: &mut Channel<client::Msg>, deadline: Duration) -> Result<String, Error> {
    let hello = async {
        let mut buf = LineBuffer::default();
        loop {
            match control.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(line) = buf.push(&data).into_iter().next() {
                        if line.is_empty() {
                            return Err(Error::Protocol("agent announced an empty identity".to_string()));
                        }
                        return Ok(line);
                    }
                }
                Some(ChannelMsg::Failure) => {
                    return Err(Error::Protocol("agent refused the control subsystem".to_string()))
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(Error::PrematureDisconnect)
                }
                Some(_) => {}
            }
        }
    };
    tokio::time::timeout(deadline, hello)
        .await
        .map_err(|_| Error::Protocol("agent did not announce an identity in time".to_string()))?
}
