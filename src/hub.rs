//! Per-tenant fan-out of live monitor events to WebSocket clients.
//!
//! One event-loop task owns the client map; register, unregister and
//! broadcast arrive as commands on a single channel, so every mutation
//! and fan-out observes a consistent view without locks. Each client has
//! a bounded outbound queue; a full queue evicts that client rather than
//! stalling delivery to the rest of the account.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Outbound queue capacity per client.
const CLIENT_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 256;

/// One event delivered to every client of an account.
#[derive(Debug, Clone, Serialize)]
pub struct WsMessage {
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

enum Command {
    Register {
        account_id: String,
        id: u64,
        sender: mpsc::Sender<String>,
        is_share: bool,
    },
    Unregister {
        account_id: String,
        id: u64,
    },
    Broadcast(WsMessage),
}

struct ClientSlot {
    sender: mpsc::Sender<String>,
    is_share: bool,
}

/// Handle to the hub's event loop.
pub struct Hub {
    commands: mpsc::Sender<Command>,
    next_id: AtomicU64,
}

/// A registered client: its id plus the outbound frame queue. Dropped or
/// closed queues end the client's writer.
pub struct Registration {
    pub id: u64,
    pub outbound: mpsc::Receiver<String>,
}

impl Hub {
    /// Create the hub and spawn its event loop.
    pub fn new() -> Arc<Self> {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(run(rx));
        Arc::new(Self {
            commands,
            next_id: AtomicU64::new(1),
        })
    }

    /// Attach a client to an account's fan-out set.
    pub async fn register(&self, account_id: &str, is_share: bool) -> Registration {
        let (sender, outbound) = mpsc::channel(CLIENT_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .commands
            .send(Command::Register {
                account_id: account_id.to_string(),
                id,
                sender,
                is_share,
            })
            .await;
        Registration { id, outbound }
    }

    /// Detach a client. Safe to call for an already-evicted client.
    pub async fn unregister(&self, account_id: &str, id: u64) {
        let _ = self
            .commands
            .send(Command::Unregister {
                account_id: account_id.to_string(),
                id,
            })
            .await;
    }

    /// Queue one event for every client of the account.
    pub async fn broadcast(&self, account_id: &str, kind: &str, payload: Value) {
        let _ = self
            .commands
            .send(Command::Broadcast(WsMessage {
                account_id: account_id.to_string(),
                kind: kind.to_string(),
                payload,
            }))
            .await;
    }
}

async fn run(mut commands: mpsc::Receiver<Command>) {
    let mut clients: HashMap<String, HashMap<u64, ClientSlot>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                account_id,
                id,
                sender,
                is_share,
            } => {
                tracing::debug!(account = %account_id, id, is_share, "ws client registered");
                clients
                    .entry(account_id)
                    .or_default()
                    .insert(id, ClientSlot { sender, is_share });
            }
            Command::Unregister { account_id, id } => {
                remove_client(&mut clients, &account_id, id);
            }
            Command::Broadcast(message) => {
                let Some(account_clients) = clients.get(&message.account_id) else {
                    continue;
                };
                let data = match serde_json::to_string(&message) {
                    Ok(data) => data,
                    Err(err) => {
                        tracing::error!("ws payload encode failed: {err}");
                        continue;
                    }
                };

                let mut evicted = Vec::new();
                for (id, slot) in account_clients {
                    if slot.sender.try_send(data.clone()).is_err() {
                        tracing::debug!(
                            account = %message.account_id,
                            id,
                            is_share = slot.is_share,
                            "evicting slow ws client"
                        );
                        evicted.push(*id);
                    }
                }
                for id in evicted {
                    remove_client(&mut clients, &message.account_id, id);
                }
            }
        }
    }
}

fn remove_client(clients: &mut HashMap<String, HashMap<u64, ClientSlot>>, account_id: &str, id: u64) {
    if let Some(account_clients) = clients.get_mut(account_id) {
        account_clients.remove(&id);
        if account_clients.is_empty() {
            clients.remove(account_id);
        }
    }
}
