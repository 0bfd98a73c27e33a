//! Headless monitor: consumes `MONITOR_MESSAGE` broadcasts and keeps a
//! table of every server's last reported state. Observability only; nothing
//! here talks back to the protocol.

use std::{collections::BTreeMap, net::SocketAddr};

use tracing::info;
use uuid::Uuid;

use crate::{
    context::{Receivers, TimerId},
    message::{Message, MonitorUpdate},
};

#[derive(Debug, Default, Clone, PartialEq)]
struct Row {
    clients: usize,
    entries: Option<u64>,
    election: Option<bool>,
    byzantine: Option<bool>,
    state: Option<String>,
}

#[derive(Default)]
pub struct Monitor {
    rows: BTreeMap<Uuid, Row>,
    halted: bool,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, update: MonitorUpdate) {
        if let Some(group_view) = &update.group_view {
            // the leader's view is authoritative for who exists at all
            self.rows.retain(|uuid, _| group_view.contains_key(uuid));
            for &uuid in group_view.keys() {
                self.rows.entry(uuid).or_default();
            }
        } else if update.leaving {
            self.rows.remove(&update.uuid);
        } else {
            let row = self.rows.entry(update.uuid).or_default();
            if let Some(clients) = &update.clients {
                row.clients = clients.len();
            }
            if update.entries.is_some() {
                row.entries = update.entries;
            }
            if update.election.is_some() {
                row.election = update.election;
            }
            if update.byzantine.is_some() {
                row.byzantine = update.byzantine;
            }
            if update.state.is_some() {
                row.state = update.state.clone();
            }
        }
        self.render()
    }

    fn render(&self) {
        info!("{} server(s)", self.rows.len());
        for (uuid, row) in &self.rows {
            info!(
                "  {uuid}  state={state}  entries={entries}  clients={clients}  election={election}  byzantine={byzantine}",
                state = row.state.as_deref().unwrap_or("?"),
                entries = row.entries.map_or("?".into(), |e| e.to_string()),
                clients = row.clients,
                election = row.election.unwrap_or(false),
                byzantine = row.byzantine.unwrap_or(false),
            )
        }
    }
}

impl Receivers for Monitor {
    fn handle_tcp(&mut self, _remote: SocketAddr, _message: Message) {}

    fn handle_broadcast(&mut self, _remote: SocketAddr, message: Message) {
        match message {
            Message::MonitorMessage(update) => self.apply(update),
            Message::ShutdownSystem => self.halted = true,
            _ => {}
        }
    }

    fn on_timer(&mut self, _id: TimerId) {}

    fn stopped(&self) -> bool {
        self.halted
    }
}
