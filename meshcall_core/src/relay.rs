//! In-process signaling relay
//!
//! Every message a client publishes is rebroadcast to all other connected
//! clients. `action` messages additionally maintain the per-client in-call
//! flag behind [`RelayHub::active_count`]. The hub is shared between any
//! number of [`RelayConnection`]s, one per participant.

use crate::channel::SignalingChannel;
use crate::config::MeshConfig;
use crate::error::ChannelError;
use crate::protocol::{CallAction, SignalingEnvelope, WireMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay-local client handle
pub type ClientId = u64;

/// Connected client with its outbound queue
#[derive(Debug)]
struct ClientState {
    tx: mpsc::UnboundedSender<String>,
    in_call: bool,
}

#[derive(Debug, Default)]
struct HubState {
    /// Map of client ID -> client state
    clients: HashMap<ClientId, ClientState>,
    /// Clients whose last action was `call_started`
    active: usize,
    next_id: ClientId,
    login: Option<String>,
}

impl HubState {
    fn apply_action(&mut self, from: ClientId, action: CallAction) {
        let Some(client) = self.clients.get_mut(&from) else {
            return;
        };
        match action {
            CallAction::CallStarted if !client.in_call => {
                client.in_call = true;
                self.active += 1;
            }
            CallAction::CallEnded if client.in_call => {
                client.in_call = false;
                self.active -= 1;
            }
            _ => {}
        }
    }

    fn drop_client(&mut self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some(client) => {
                if client.in_call {
                    self.active -= 1;
                }
                true
            }
            None => false,
        }
    }
}

/// Shared relay state
#[derive(Debug, Default, Clone)]
pub struct RelayHub {
    inner: Arc<Mutex<HubState>>,
}

impl RelayHub {
    /// Relay without a login gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay that only admits clients presenting `pin`
    pub fn with_login(pin: impl Into<String>) -> Self {
        let hub = Self::new();
        hub.inner.lock().login = Some(pin.into());
        hub
    }

    /// Relay gated by [`MeshConfig::login`] when it is set
    pub fn from_config(config: &MeshConfig) -> Self {
        match &config.login {
            Some(pin) => Self::with_login(pin.clone()),
            None => Self::new(),
        }
    }

    /// Whether `pin` passes the login gate
    pub fn check_user(&self, pin: &str) -> bool {
        match &self.inner.lock().login {
            Some(expected) => expected == pin,
            None => true,
        }
    }

    /// Open a connection, bypassing the login gate
    pub fn connect(&self) -> RelayConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.clients.insert(id, ClientState { tx, in_call: false });
            id
        };
        info!("Relay client {} connected", id);
        RelayConnection {
            id,
            hub: self.clone(),
            rx,
        }
    }

    /// Open a connection after checking `pin` against the login gate
    pub fn connect_with_login(&self, pin: Option<&str>) -> Result<RelayConnection, ChannelError> {
        let admitted = {
            let state = self.inner.lock();
            match (&state.login, pin) {
                (None, _) => true,
                (Some(expected), Some(pin)) => expected == pin,
                (Some(_), None) => false,
            }
        };
        if admitted {
            Ok(self.connect())
        } else {
            warn!("Relay login rejected");
            Err(ChannelError::Unauthorized)
        }
    }

    /// Connected clients
    pub fn online_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Connected clients currently in a call
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    /// Disconnect every client. Their channels report `Close`.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.clients.clear();
        state.active = 0;
        info!("Relay shut down");
    }

    /// Rebroadcast `text` from client `from` to every other client
    pub fn publish(&self, from: ClientId, text: String) -> Result<(), ChannelError> {
        let mut state = self.inner.lock();
        if !state.clients.contains_key(&from) {
            return Err(ChannelError::Close);
        }

        match serde_json::from_str::<WireMessage>(&text) {
            Ok(WireMessage {
                action: Some(action),
                ..
            }) => state.apply_action(from, action),
            Ok(_) => {}
            Err(e) => debug!("Relaying unparsed message from client {}: {}", from, e),
        }

        let mut gone = Vec::new();
        for (id, client) in state.clients.iter() {
            if *id == from {
                continue;
            }
            if client.tx.send(text.clone()).is_err() {
                gone.push(*id);
            }
        }
        for id in gone {
            warn!("Dropping relay client {}: queue closed", id);
            state.drop_client(id);
        }
        Ok(())
    }

    fn disconnect(&self, id: ClientId) {
        if self.inner.lock().drop_client(id) {
            info!("Relay client {} disconnected", id);
        }
    }
}

/// One client's connection to a [`RelayHub`]
pub struct RelayConnection {
    id: ClientId,
    hub: RelayHub,
    rx: mpsc::UnboundedReceiver<String>,
}

impl RelayConnection {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }
}

#[async_trait]
impl SignalingChannel for RelayConnection {
    async fn send(&mut self, envelope: &SignalingEnvelope) -> Result<(), ChannelError> {
        let text = envelope.to_json()?;
        self.hub.publish(self.id, text)
    }

    async fn recv(&mut self) -> Result<SignalingEnvelope, ChannelError> {
        match self.rx.recv().await {
            Some(text) => text.parse(),
            None => Err(ChannelError::Close),
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}
