//! sFAB - an SSH-based orchestration fabric in a hub-and-spoke topology
//!
//! A central [`Hub`] binds a listener and accepts long-lived SSH
//! transports from remote [`Agent`]s. Clients dispatch opaque byte
//! payloads by agent name; the hub relays each command to the
//! authenticated agent and streams its stdout, stderr, and exit code back
//! as a sequence of [`Response`]s.
//!
//! # Architecture
//!
//! The fabric inverts the usual SSH shell: agents dial *out* to the hub,
//! and the hub decides when sessions are opened and commands run. Each
//! command travels as an `exec` request on its own session channel; the
//! agent's [`Handler`] executes it and the results stream back. Key trust
//! is explicit on both sides: the hub authorizes agent keys by identity
//! through its [`KeyMaster`], and agents authorize hub keys by hostname,
//! address, or wildcard.
//!
//! # Modules
//!
//! - [`hub`] - the listener, agent directory, and dispatch API
//! - [`agent`] - the outbound transport and command handler
//! - [`keymaster`] - the `(subject, key)` authorization directory
//! - [`keys`] - key generation, parsing, and fingerprints
//! - [`response`] - the response stream vocabulary
//! - [`errors`] - the fabric's error taxonomy
//!
//! # Example
//!
//! ```ignore
//! let hub = Hub::new(HubConfig {
//!     bind: "127.0.0.1:4771".into(),
//!     host_key: Some(KeyPair::generate()?),
//!     ..Default::default()
//! });
//! hub.authorize_key("bob@postgres.ql", &agent_key.public_key());
//! hub.listen().await?;
//! tokio::spawn({ let hub = hub.clone(); async move { hub.serve().await } });
//!
//! hub.await_agent("bob@postgres.ql").await;
//! let mut responses = hub.send("bob@postgres.ql", "hi", Duration::from_secs(5)).await?;
//! while let Some(response) = responses.recv().await {
//!     match response {
//!         Response::Stdout(line) => println!("out | {line}"),
//!         Response::Stderr(line) => println!("err | {line}"),
//!         Response::Exit(code) => println!("exit {code}"),
//!         Response::Error(e) => println!("failed: {e}"),
//!     }
//! }
//! ```

#![deny(missing_docs)]

pub mod agent;
mod connection;
pub mod errors;
pub mod hub;
pub mod keymaster;
pub mod keys;
pub mod response;
mod session;

pub use agent::{Agent, AgentConfig, Handler, Outcome, OutputStream, DEFAULT_TIMEOUT};
pub use errors::Error;
pub use hub::{Hub, HubConfig, IpProto, LifecycleHook, DEFAULT_KEEP_ALIVE};
pub use keymaster::{Authorization, Disposition, KeyMaster};
pub use keys::{encode_public_key, fingerprint, parse_public_key, read_authorized_keys, KeyPair};
pub use response::Response;

/// The public key type agents and hubs authenticate with, re-exported
/// from `russh`.
pub use russh::keys::PublicKey;

/// Result type alias using the fabric's [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;
