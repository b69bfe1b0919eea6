//! Per-agent connection machinery
//!
//! One [`Connection`] owns one authenticated agent's transport: the
//! mailbox commands are queued on, the control channel that doubles as a
//! liveness monitor, and the teardown path that deregisters the agent and
//! reaps any in-flight session.
//!
//! Commands are served strictly one at a time; the mailbox enforces FIFO
//! across commands to the same agent.

use std::sync::{Arc, Mutex};

use russh::client;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::keymaster::KeyMaster;
use crate::keys::fingerprint;
use crate::response::{Message, Response};
use crate::session;

/// Name of the control subsystem the hub requests right after the
/// handshake; the agent answers with its identity and the channel then
/// stays open for the life of the connection.
pub(crate) const CONTROL_SUBSYSTEM: &str = "sfab";

/// The username the hub authenticates with. Agents ignore it; the key is
/// what they verify.
pub(crate) const HUB_USERNAME: &str = "sfab-hub";

/// Deregistration capability handed to each connection, so teardown can
/// remove the agent from the directory without the connection holding a
/// full hub reference.
pub(crate) trait Unregister: Send + Sync {
    fn unregister(&self, identity: &str, conn_id: u64);
}

/// SSH event handler for the hub's side of one agent transport.
///
/// Captures the agent's public key during the handshake so the connection
/// layer can authorize (and later re-check) the exact key used.
pub(crate) struct HubHandler {
    keymaster: KeyMaster,
    allow_unauthorized: bool,
    seen_key: Arc<Mutex<Option<PublicKey>>>,
}

impl HubHandler {
    pub(crate) fn new(
        keymaster: KeyMaster,
        allow_unauthorized: bool,
    ) -> (Self, Arc<Mutex<Option<PublicKey>>>) {
        let seen_key = Arc::new(Mutex::new(None));
        let handler = Self {
            keymaster,
            allow_unauthorized,
            seen_key: seen_key.clone(),
        };
        (handler, seen_key)
    }
}

impl client::Handler for HubHandler {
    type Error = Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        *self.seen_key.lock().expect("seen key lock") = Some(key.clone());
        if self.allow_unauthorized {
            return Ok(true);
        }
        let ok = self.keymaster.any_authorized(key);
        if !ok {
            debug!(
                fingerprint = %fingerprint(key),
                "rejecting agent key with no authorized subject"
            );
        }
        Ok(ok)
    }
}

/// One registered agent's live transport.
pub(crate) struct Connection {
    pub identity: String,
    pub conn_id: u64,
    pub handle: client::Handle<HubHandler>,
    pub control: Channel<client::Msg>,
    pub mailbox: mpsc::Receiver<Message>,
    pub closed: CancellationToken,
    pub registry: Arc<dyn Unregister>,
}

impl Connection {
    /// Serve this connection until it hangs up: dispatch mailbox messages
    /// one at a time, watch the control channel for transport death, then
    /// tear everything down. Runs as the connection's own task.
    pub(crate) async fn serve(mut self) {
        let monitor = tokio::spawn(monitor(
            self.control,
            self.closed.clone(),
            self.identity.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                msg = self.mailbox.recv() => match msg {
                    None => break,
                    Some(msg) => {
                        if !dispatch(&mut self.handle, msg, &self.closed).await {
                            break;
                        }
                    }
                }
            }
        }

        // Teardown: deregister first so no new sends target this
        // connection, then fail whatever was still queued.
        self.closed.cancel();
        self.registry.unregister(&self.identity, self.conn_id);

        self.mailbox.close();
        while let Ok(msg) = self.mailbox.try_recv() {
            let _ = msg
                .responses
                .send(Response::Error("agent disconnected".to_string()))
                .await;
        }

        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "hangup", "en")
            .await;
        monitor.abort();

        info!(identity = %self.identity, "agent connection closed");
    }
}

/// Run one mailbox message to completion. Returns false when the
/// transport is beyond use and the connection should hang up.
async fn dispatch(
    handle: &mut client::Handle<HubHandler>,
    msg: Message,
    closed: &CancellationToken,
) -> bool {
    match handle.channel_open_session().await {
        Ok(channel) => {
            let reaper = closed.child_token();
            session::run(channel, msg.payload, msg.responses, reaper).await;
            true
        }
        Err(e) => {
            // The agent auto-accepts session opens, so a failed open means
            // the transport underneath is gone.
            warn!(error = %e, "could not open session channel; hanging up");
            let _ = msg
                .responses
                .send(Response::Error(format!("cannot open session: {e}")))
                .await;
            closed.cancel();
            false
        }
    }
}

/// Watch the control channel. It carries no payload after the identity
/// hello; its EOF or close is how we learn the transport died (keepalive
/// failure, peer disconnect, broken pipe).
async fn monitor(mut control: Channel<client::Msg>, closed: CancellationToken, identity: String) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            msg = control.wait() => match msg {
                None | Some(ChannelMsg::Close) | Some(ChannelMsg::Eof) => {
                    debug!(identity = %identity, "control channel closed; hanging up");
                    closed.cancel();
                    break;
                }
                Some(_) => {}
            }
        }
    }
}
