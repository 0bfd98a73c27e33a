use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    time::Duration,
};

use crate::context::{Context, TimerId};

/// Thin wrapper tracking whether a repeating timer is currently armed.
#[derive(Debug, Default)]
pub struct Timer {
    pub id: Option<TimerId>,
}

impl Timer {
    pub fn set(&mut self, duration: Duration, context: &mut Context) {
        let evicted = self.id.replace(context.set(duration));
        assert!(evicted.is_none())
    }

    pub fn unset(&mut self, context: &mut Context) {
        if let Some(id) = self.id.take() {
            context.unset(id)
        }
    }

    pub fn reset(&mut self, duration: Duration, context: &mut Context) {
        self.unset(context);
        self.set(duration, context)
    }

    pub fn is_set(&self) -> bool {
        self.id.is_some()
    }

    pub fn fired(&self, id: TimerId) -> bool {
        self.id == Some(id)
    }
}

/// Address this host is reachable at on the local network.
///
/// Connects a throwaway datagram socket toward a public address; no packet
/// is sent, the OS just has to pick the outbound interface.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("1.1.1.1:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}
