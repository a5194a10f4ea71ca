//! Shared fixtures for this crate's tests.

use crate::connector::DialTarget;
use rssh_core::memory::{AllowAll, MemoryNetwork};
use rssh_core::{
    AuthMethods, Credentials, Endpoint, NewChannel, PeerMetadata, RejectReason,
    ServerConnection, ACK_SENTINEL, INFO_CHANNEL,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub const HOME: &str = "home:7000";

pub fn credentials() -> Credentials {
    Credentials::new(rssh_core::keys::generate_ed25519().unwrap(), "pw")
}

pub fn auth() -> AuthMethods {
    credentials().auth_methods().unwrap()
}

pub fn target() -> DialTarget {
    DialTarget {
        home_host: "home".into(),
        home_port: 7000,
        user: "rssh".into(),
        bind_port: 0,
        credentials: credentials(),
    }
}

/// Minimal rendezvous host: acknowledges announcements and records them.
pub struct Home {
    pub announced: Arc<Mutex<Vec<PeerMetadata>>>,
    task: JoinHandle<()>,
}

impl Home {
    pub fn announced(&self) -> Vec<PeerMetadata> {
        self.announced.lock().unwrap().clone()
    }
}

impl Drop for Home {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_home(net: &MemoryNetwork) -> Home {
    let endpoint = net.bind(HOME, Arc::new(AllowAll)).unwrap();
    let announced = Arc::new(Mutex::new(Vec::new()));
    let log = announced.clone();
    let task = tokio::spawn(async move {
        while let Ok(Some(conn)) = endpoint.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                while let Some(ch) = conn.next_channel().await {
                    if ch.channel_type() == INFO_CHANNEL {
                        if let Ok(meta) = PeerMetadata::decode(ch.extra_data()) {
                            log.lock().unwrap().push(meta);
                        }
                        let _ = ch
                            .reject(RejectReason::AdministrativelyProhibited, ACK_SENTINEL)
                            .await;
                    } else {
                        let _ = ch.reject(RejectReason::UnknownChannelType, "unknown").await;
                    }
                }
            });
        }
    });
    Home { announced, task }
}

/// Handler that drops every forwarded connection.
pub struct Discard;

impl crate::reverse::ConnectionHandler<tokio::io::DuplexStream> for Discard {
    async fn handle(&self, _stream: tokio::io::DuplexStream, _origin: String) {}
}
