//! The thin admission client: discovers a server over broadcast, then asks
//! it for entries and releases. Interactive input arrives as stdin lines
//! through the dispatcher (`+` request entry, `-` someone leaving, `q`
//! quit).

use std::{net::SocketAddr, sync::Arc};

use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    common::Timer,
    config::Config,
    context::{Context, Receivers, TimerId},
    message::{Message, PeerAddr},
};

pub struct Client {
    context: Context,
    config: Arc<Config>,
    uuid: Uuid,
    addr: PeerAddr,
    number: u32,
    server: Option<(Uuid, PeerAddr)>,
    entries: u64,
    awaiting: bool,
    discover_timer: Timer,
    halted: bool,
}

impl Client {
    pub fn new(context: Context, config: Arc<Config>, advertised: SocketAddr) -> Self {
        Self {
            context,
            config,
            uuid: Uuid::new_v4(),
            addr: advertised.into(),
            number: rand::thread_rng().gen_range(1..=100),
            server: None,
            entries: 0,
            awaiting: false,
            discover_timer: Timer::default(),
            halted: false,
        }
    }

    pub fn start(&mut self) {
        info!(uuid = %self.uuid, number = self.number, "client starting");
        self.discover()
    }

    fn discover(&mut self) {
        self.server = None;
        self.awaiting = false;
        self.context.broadcast(Message::IdentClient {
            uuid: self.uuid,
            address: self.addr.0,
            port: self.addr.1,
        });
        let wait = self.config.join_wait;
        self.discover_timer.reset(wait, &mut self.context);
    }

    /// First server to answer wins.
    fn handle_server_offer(&mut self, uuid: Uuid, addr: PeerAddr) {
        if self.server.is_some() {
            return;
        }
        info!(server = %uuid, ?addr, "choosing server");
        self.server = Some((uuid, addr));
        self.discover_timer.unset(&mut self.context);
        let choose = Message::ChooseServer {
            uuid: self.uuid,
            address: self.addr.0,
            port: self.addr.1,
        };
        if !self.context.send_tcp(addr.socket(), &choose) {
            warn!("chosen server vanished, rediscovering");
            self.discover()
        }
    }

    fn request(&mut self, increase: bool) {
        let Some((_, addr)) = self.server else {
            info!("not connected to a server yet");
            return;
        };
        if self.awaiting {
            info!("still waiting for the previous request");
            return;
        }
        let request = Message::RequestAction {
            uuid: self.uuid,
            address: self.addr.0,
            port: self.addr.1,
            number: self.number,
            increase,
        };
        if !self.context.send_tcp(addr.socket(), &request) {
            warn!("server unreachable, rediscovering");
            self.discover();
            return;
        }
        // releases get no per-request answer, only the count update
        self.awaiting = increase;
    }

    fn farewell(&mut self) {
        if let Some((_, addr)) = self.server.take() {
            let goodbye = Message::ShutdownClient { uuid: self.uuid };
            self.context.send_tcp(addr.socket(), &goodbye);
        }
    }
}

impl Receivers for Client {
    fn handle_tcp(&mut self, remote: SocketAddr, message: Message) {
        match message {
            Message::IdentServer {
                uuid,
                address,
                port,
            } => self.handle_server_offer(uuid, PeerAddr(address, port)),
            Message::AcceptClient { entries } => {
                self.entries = entries;
                info!(
                    entries,
                    max = self.config.max_entries,
                    "connected, current count"
                );
            }
            Message::AcceptEntry => {
                self.awaiting = false;
                info!("access granted");
            }
            Message::DenyEntry => {
                self.awaiting = false;
                info!("access denied, venue full");
            }
            Message::UpdateEntries { entries } => {
                self.entries = entries;
                info!(entries, max = self.config.max_entries, "count changed");
            }
            other => debug!(from = %remote, ?other, "unexpected tcp message"),
        }
    }

    fn handle_broadcast(&mut self, _remote: SocketAddr, message: Message) {
        match message {
            Message::ShutdownServer { uuid } => {
                if self.server.map_or(false, |(server, _)| server == uuid) {
                    warn!("our server shut down, rediscovering");
                    self.discover()
                }
            }
            Message::ShutdownSystem => {
                info!("system shutdown requested");
                self.halted = true
            }
            _ => {}
        }
    }

    fn handle_line(&mut self, line: String) {
        match line.trim() {
            "+" => self.request(true),
            "-" => self.request(false),
            "q" | "quit" => {
                self.farewell();
                self.halted = true
            }
            "" => {}
            other => info!("unknown command {other:?}; use +, - or q"),
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        if self.discover_timer.fired(id) && self.server.is_none() {
            debug!("no server answered, broadcasting again");
            self.context.broadcast(Message::IdentClient {
                uuid: self.uuid,
                address: self.addr.0,
                port: self.addr.1,
            })
        }
    }

    fn stopped(&self) -> bool {
        self.halted
    }

    fn on_stop(&mut self) {
        self.farewell()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn client() -> Client {
        Client::new(
            Context::recording(),
            Arc::new(Config::default()),
            "10.2.0.1:50001".parse().unwrap(),
        )
    }

    fn server_addr() -> SocketAddr {
        "10.1.0.1:40001".parse().unwrap()
    }

    #[test]
    fn first_offer_wins() {
        let mut c = client();
        c.start();
        assert!(matches!(
            c.context.recorded().broadcasts[0],
            Message::IdentClient { .. }
        ));

        let first = Uuid::from_u128(1);
        c.handle_tcp(
            server_addr(),
            Message::IdentServer {
                uuid: first,
                address: server_addr().ip(),
                port: server_addr().port(),
            },
        );
        c.handle_tcp(
            "10.1.0.2:40002".parse().unwrap(),
            Message::IdentServer {
                uuid: Uuid::from_u128(2),
                address: "10.1.0.2".parse().unwrap(),
                port: 40002,
            },
        );
        assert_eq!(c.server.map(|(uuid, _)| uuid), Some(first));
        let tcp = c.context.recorded().take_tcp();
        assert_eq!(tcp.len(), 1);
        assert!(matches!(tcp[0].1, Message::ChooseServer { .. }));
        assert_eq!(tcp[0].0, server_addr());
    }

    #[test]
    fn entry_request_round_trip() {
        let mut c = client();
        c.start();
        c.handle_tcp(
            server_addr(),
            Message::IdentServer {
                uuid: Uuid::from_u128(1),
                address: server_addr().ip(),
                port: server_addr().port(),
            },
        );
        c.context.recorded().take_tcp();

        c.handle_line("+".to_owned());
        let tcp = c.context.recorded().take_tcp();
        assert!(
            matches!(tcp[0].1, Message::RequestAction { increase: true, .. })
        );
        assert!(c.awaiting);
        // a second request is held back until the verdict arrives
        c.handle_line("+".to_owned());
        assert!(c.context.recorded().take_tcp().is_empty());

        c.handle_tcp(server_addr(), Message::AcceptEntry);
        assert!(!c.awaiting);
        c.handle_tcp(server_addr(), Message::UpdateEntries { entries: 1 });
        assert_eq!(c.entries, 1);
    }

    #[test]
    fn server_loss_triggers_rediscovery() {
        let mut c = client();
        c.start();
        let server = Uuid::from_u128(1);
        c.handle_tcp(
            server_addr(),
            Message::IdentServer {
                uuid: server,
                address: server_addr().ip(),
                port: server_addr().port(),
            },
        );
        c.context.recorded().broadcasts.clear();

        c.handle_broadcast(
            "10.1.0.9:1".parse().unwrap(),
            Message::ShutdownServer { uuid: server },
        );
        assert!(c.server.is_none());
        assert!(matches!(
            c.context.recorded().broadcasts[0],
            Message::IdentClient { .. }
        ));
    }

    #[test]
    fn quit_says_goodbye_and_halts() {
        let mut c = client();
        c.start();
        c.handle_tcp(
            server_addr(),
            Message::IdentServer {
                uuid: Uuid::from_u128(1),
                address: server_addr().ip(),
                port: server_addr().port(),
            },
        );
        c.context.recorded().take_tcp();
        c.handle_line("q".to_owned());
        assert!(c.stopped());
        let tcp = c.context.recorded().take_tcp();
        assert!(matches!(tcp[0].1, Message::ShutdownClient { .. }));
    }
}
