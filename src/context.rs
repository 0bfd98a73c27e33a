//! Seam between the I/O tasks and the protocol code. Protocol state machines
//! implement [`Receivers`] and stay synchronous; everything they observe
//! arrives as a typed [`Event`] on one queue, and everything they emit goes
//! through a [`Context`].

use std::{net::SocketAddr, time::Duration};

use crate::message::{Datagram, Message};

pub mod tokio;

pub type TimerId = u32;

/// One unit of work for the dispatcher.
#[derive(Debug)]
pub enum Event {
    Tcp(SocketAddr, Message),
    Broadcast(SocketAddr, Message),
    Multicast(SocketAddr, Datagram),
    Line(String),
    Timer(TimerId),
}

pub trait Receivers {
    fn handle_tcp(&mut self, remote: SocketAddr, message: Message);

    fn handle_broadcast(&mut self, remote: SocketAddr, message: Message);

    fn handle_multicast(&mut self, _remote: SocketAddr, _datagram: Datagram) {}

    fn handle_line(&mut self, _line: String) {}

    fn on_timer(&mut self, id: TimerId);

    /// Cooperative halt: checked by the dispatcher after every event.
    fn stopped(&self) -> bool {
        false
    }

    fn on_stop(&mut self) {}
}

pub enum Context {
    Tokio(tokio::Context),
    #[cfg(test)]
    Test(test::TestContext),
}

impl Context {
    /// Synchronous connect + send + close. Every failure mode collapses to
    /// `false`; the caller decides whether to retry or evict.
    pub fn send_tcp(&mut self, to: SocketAddr, message: &Message) -> bool {
        match self {
            Self::Tokio(context) => context.send_tcp(to, message),
            #[cfg(test)]
            Self::Test(context) => context.send_tcp(to, message),
        }
    }

    pub fn broadcast(&mut self, message: Message) {
        match self {
            Self::Tokio(context) => context.broadcast(message),
            #[cfg(test)]
            Self::Test(context) => context.broadcast(message),
        }
    }

    /// Emit one datagram to the multicast group from the engine's sender
    /// socket.
    pub fn multicast(&mut self, datagram: &Datagram) {
        match self {
            Self::Tokio(context) => context.multicast(datagram),
            #[cfg(test)]
            Self::Test(context) => context.multicast(datagram),
        }
    }

    /// Unicast a datagram (proposal, NACK, retransmission) straight to a
    /// peer's engine socket.
    pub fn unicast(&mut self, to: SocketAddr, datagram: &Datagram) {
        match self {
            Self::Tokio(context) => context.unicast(to, datagram),
            #[cfg(test)]
            Self::Test(context) => context.unicast(to, datagram),
        }
    }

    pub fn set(&mut self, duration: Duration) -> TimerId {
        match self {
            Self::Tokio(context) => context.set(duration),
            #[cfg(test)]
            Self::Test(context) => context.set(duration),
        }
    }

    pub fn unset(&mut self, id: TimerId) {
        match self {
            Self::Tokio(context) => context.unset(id),
            #[cfg(test)]
            Self::Test(context) => context.unset(id),
        }
    }
}
