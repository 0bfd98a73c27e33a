use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

/// Link-local tunables shared by servers, clients and the monitor.
///
/// Defaults match the deployed constants; everything here can be overridden
/// from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub broadcast_port: u16,
    pub multicast_group: SocketAddrV4,
    pub max_entries: u64,
    pub heartbeat_timeout: Duration,
    pub max_timeouts: u32,
    pub max_tries: u32,
    pub join_wait: Duration,
    pub buffer_size: usize,
    pub dedup_window: usize,
    pub tcp_connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_port: 5973,
            multicast_group: SocketAddrV4::new(Ipv4Addr::new(224, 1, 1, 1), 5007),
            max_entries: 20,
            heartbeat_timeout: Duration::from_secs(10),
            max_timeouts: 2,
            max_tries: 3,
            join_wait: Duration::from_secs(2),
            buffer_size: 1024,
            dedup_window: 50,
            tcp_connect_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Period of the leader's heartbeat sweep. Slacker than the member send
    /// period so a single late beat does not immediately strike.
    pub fn heartbeat_check_period(&self) -> Duration {
        self.heartbeat_timeout + Duration::from_secs(5)
    }

    /// How long a delivered STOP may stay unanswered before the engine
    /// resumes on its own.
    pub fn stop_watchdog(&self) -> Duration {
        2 * self.heartbeat_timeout
    }
}
