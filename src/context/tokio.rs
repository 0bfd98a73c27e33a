//! A context based on tokio and asynchronous IO.
//!
//! Although supported by an asynchronous reactor, protocol code, i.e.,
//! `impl Receivers` is still synchronous and running in a separated thread.
//! Reader tasks decode datagrams and connections into typed events; all
//! state mutation happens on the thread that calls [`Dispatch::run`].

use std::{
    collections::{HashMap, VecDeque},
    io::Write,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    net::{TcpListener, UdpSocket},
    runtime::Handle,
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    message::{BroadcastFrame, Datagram, Message},
};

use super::{Event, Receivers, TimerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket setup failed: {0}")]
    Setup(#[from] std::io::Error),
}

/// Which sockets a process needs. Servers take part in the ordered-multicast
/// group; clients only speak broadcast + TCP; the monitor only listens to
/// broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sockets {
    Server,
    Client,
    Monitor,
}

pub struct Dispatch {
    config: Arc<Config>,
    runtime: Handle,
    advertised: SocketAddr,
    engine: Option<Arc<UdpSocket>>,
    message_sender: flume::Sender<Event>,
    message_receiver: flume::Receiver<Event>,
    timer_sender: flume::Sender<TimerId>,
    timer_receiver: flume::Receiver<TimerId>,
    stop_sender: flume::Sender<()>,
    stop_receiver: flume::Receiver<()>,
}

impl Dispatch {
    pub fn new(config: Arc<Config>, runtime: Handle, sockets: Sockets) -> Result<Self, Error> {
        let (message_sender, message_receiver) = flume::unbounded();
        let (timer_sender, timer_receiver) = flume::bounded(0);
        let (stop_sender, stop_receiver) = flume::bounded(0);

        let _enter = runtime.enter();

        let tcp = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        tcp.set_nonblocking(true)?;
        let advertised = SocketAddr::new(crate::common::local_ip(), tcp.local_addr()?.port());
        let tcp = TcpListener::from_std(tcp)?;
        runtime.spawn(read_tcp(tcp, message_sender.clone()));

        let broadcast = broadcast_listener(config.broadcast_port)?;
        runtime.spawn(read_broadcast(
            broadcast,
            config.dedup_window,
            config.buffer_size,
            message_sender.clone(),
        ));

        let engine = if sockets == Sockets::Server {
            let listener = Arc::new(group_listener(config.multicast_group)?);
            runtime.spawn(read_datagrams(listener, config.buffer_size, message_sender.clone()));
            let sender = Arc::new(engine_socket()?);
            runtime.spawn(read_datagrams(
                sender.clone(),
                config.buffer_size,
                message_sender.clone(),
            ));
            Some(sender)
        } else {
            None
        };

        Ok(Self {
            config,
            runtime,
            advertised,
            engine,
            message_sender,
            message_receiver,
            timer_sender,
            timer_receiver,
            stop_sender,
            stop_receiver,
        })
    }

    /// Address other nodes can reach this process's TCP listener at.
    pub fn advertised(&self) -> SocketAddr {
        self.advertised
    }

    pub fn context(&self) -> super::Context {
        super::Context::Tokio(Context {
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            engine: self.engine.clone(),
            timer_id: 0,
            timer_sender: self.timer_sender.clone(),
            timer_tasks: Default::default(),
        })
    }

    /// Forward stdin lines into the event queue (interactive client).
    pub fn read_lines(&self) {
        let sender = self.message_sender.clone();
        self.runtime.spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if sender.send_async(Event::Line(line)).await.is_err() {
                    break;
                }
            }
        });
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            stop_sender: self.stop_sender.clone(),
        }
    }

    pub fn run(&self, receivers: &mut impl Receivers) {
        enum Selected {
            Event(Event),
            Stop,
        }

        loop {
            let selected = flume::Selector::new()
                .recv(&self.stop_receiver, |event| {
                    event.ok();
                    Selected::Stop
                })
                .recv(&self.message_receiver, |event| match event {
                    Ok(event) => Selected::Event(event),
                    Err(_) => Selected::Stop,
                })
                .recv(&self.timer_receiver, |event| match event {
                    Ok(id) => Selected::Event(Event::Timer(id)),
                    Err(_) => Selected::Stop,
                })
                .wait();
            match selected {
                Selected::Stop => break,
                Selected::Event(Event::Tcp(remote, message)) => {
                    receivers.handle_tcp(remote, message)
                }
                Selected::Event(Event::Broadcast(remote, message)) => {
                    receivers.handle_broadcast(remote, message)
                }
                Selected::Event(Event::Multicast(remote, datagram)) => {
                    receivers.handle_multicast(remote, datagram)
                }
                Selected::Event(Event::Line(line)) => receivers.handle_line(line),
                Selected::Event(Event::Timer(id)) => receivers.on_timer(id),
            }
            if receivers.stopped() {
                break;
            }
        }
        receivers.on_stop()
    }
}

pub struct DispatchHandle {
    stop_sender: flume::Sender<()>,
}

impl DispatchHandle {
    pub async fn stop(&self) {
        self.stop_sender.send_async(()).await.ok();
    }

    pub fn stop_sync(&self) {
        self.stop_sender.send(()).ok();
    }
}

pub struct Context {
    config: Arc<Config>,
    runtime: Handle,
    engine: Option<Arc<UdpSocket>>,
    timer_id: TimerId,
    timer_sender: flume::Sender<TimerId>,
    timer_tasks: HashMap<TimerId, JoinHandle<()>>,
}

impl Context {
    pub fn send_tcp(&mut self, to: SocketAddr, message: &Message) -> bool {
        let Ok(buf) = serde_json::to_vec(message) else {
            return false;
        };
        // deliberately blocking: issued from the dispatcher so that a slow
        // peer back-pressures us instead of reordering our sends
        let sent = std::net::TcpStream::connect_timeout(&to, self.config.tcp_connect_timeout)
            .and_then(|mut stream| {
                stream.set_write_timeout(Some(self.config.tcp_connect_timeout))?;
                stream.write_all(&buf)
            });
        match sent {
            Ok(()) => true,
            Err(err) => {
                debug!("tcp send to {to} failed: {err}");
                false
            }
        }
    }

    pub fn broadcast(&mut self, message: Message) {
        let frame = BroadcastFrame::new(message);
        let port = self.config.broadcast_port;
        match broadcast_sender() {
            Ok(socket) => {
                let buf = serde_json::to_vec(&frame).expect("framed message serializes");
                if let Err(err) =
                    socket.send_to(&buf, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
                {
                    warn!("broadcast failed: {err}");
                }
            }
            Err(err) => warn!("broadcast socket: {err}"),
        }
    }

    pub fn multicast(&mut self, datagram: &Datagram) {
        let group = SocketAddr::from(self.config.multicast_group);
        self.send_datagram(group, datagram)
    }

    pub fn unicast(&mut self, to: SocketAddr, datagram: &Datagram) {
        self.send_datagram(to, datagram)
    }

    fn send_datagram(&self, to: SocketAddr, datagram: &Datagram) {
        let Some(socket) = self.engine.clone() else {
            warn!("no engine socket, dropping datagram to {to}");
            return;
        };
        let buf = serde_json::to_vec(datagram).expect("datagram serializes");
        self.runtime.spawn(async move {
            if let Err(err) = socket.send_to(&buf, to).await {
                warn!("datagram send to {to} failed: {err}");
            }
        });
    }

    pub fn set(&mut self, duration: Duration) -> TimerId {
        self.timer_id += 1;
        let id = self.timer_id;
        let sender = self.timer_sender.clone();
        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(duration).await;
                if sender.send_async(id).await.is_err() {
                    break;
                }
            }
        });
        self.timer_tasks.insert(id, task);
        id
    }

    pub fn unset(&mut self, id: TimerId) {
        if let Some(task) = self.timer_tasks.remove(&id) {
            task.abort()
        }
    }
}

async fn read_tcp(listener: TcpListener, sender: flume::Sender<Event>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("tcp accept: {err}");
                continue;
            }
        };
        let sender = sender.clone();
        // one connection carries exactly one JSON object, read to EOF
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut stream = stream;
            if let Err(err) = stream.read_to_end(&mut buf).await {
                warn!("tcp read from {remote}: {err}");
                return;
            }
            match serde_json::from_slice::<Message>(&buf) {
                Ok(message) => {
                    sender.send_async(Event::Tcp(remote, message)).await.ok();
                }
                Err(err) => warn!("malformed tcp message from {remote}: {err}"),
            }
        });
    }
}

/// Bounded first-in-first-out set of recently seen broadcast ids.
struct DedupWindow {
    seen: VecDeque<Uuid>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// `false` if the id was already inside the window.
    fn insert(&mut self, id: Uuid) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.seen.len() == self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(id);
        true
    }
}

async fn read_broadcast(
    socket: UdpSocket,
    dedup_window: usize,
    buffer_size: usize,
    sender: flume::Sender<Event>,
) {
    let mut buf = vec![0; buffer_size];
    let mut seen = DedupWindow::new(dedup_window);
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("broadcast recv: {err}");
                continue;
            }
        };
        match serde_json::from_slice::<BroadcastFrame>(&buf[..len]) {
            Ok(frame) => {
                if !seen.insert(frame.msg_uuid) {
                    continue;
                }
                if sender
                    .send_async(Event::Broadcast(remote, frame.message))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!("malformed broadcast from {remote}: {err}"),
        }
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, buffer_size: usize, sender: flume::Sender<Event>) {
    let mut buf = vec![0; buffer_size];
    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("multicast recv: {err}");
                continue;
            }
        };
        match serde_json::from_slice::<Datagram>(&buf[..len]) {
            Ok(datagram) => {
                if sender
                    .send_async(Event::Multicast(remote, datagram))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => warn!("malformed datagram from {remote}: {err}"),
        }
    }
}

fn broadcast_listener(port: u16) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn broadcast_sender() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    Ok(socket.into())
}

fn group_listener(group: SocketAddrV4) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// The engine's sender socket. Peers answer proposals and NACKs straight to
/// this socket's address, so it doubles as a listener.
fn engine_socket() -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(1)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayed_broadcasts_are_dropped_inside_the_window() {
        let mut window = DedupWindow::new(3);
        let id = Uuid::new_v4();
        assert!(window.insert(id));
        assert!(!window.insert(id));

        // three fresh ids push the first one out again
        for _ in 0..3 {
            assert!(window.insert(Uuid::new_v4()));
        }
        assert!(window.insert(id));
    }
}
