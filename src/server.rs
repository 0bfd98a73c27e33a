//! The coordination core: membership and failure detection, ring election,
//! Byzantine cross-validation and the admission state machine, all driven
//! from the single dispatcher thread.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    byzantine::{LeaderRound, MemberRound, RoundHistory, RoundStatus},
    common::{hostname, Timer},
    config::Config,
    context::{Context, Receivers, TimerId},
    election,
    message::{
        GroupView, McPayload, Message, MonitorUpdate, OmBody, OmMessage, OmResult, OmStep,
        PeerAddr,
    },
    multicast::{Delivery, RoMulticast},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Pending,
    Leader,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Open,
    Mine,
    Closed,
}

#[derive(Debug, Clone)]
struct ClientRequest {
    addr: PeerAddr,
    number: u32,
    increase: bool,
}

#[derive(Debug, Clone, Copy)]
struct Beat {
    last: Instant,
    strikes: u32,
}

pub struct Server {
    context: Context,
    config: Arc<Config>,
    uuid: Uuid,
    addr: PeerAddr,
    role: Role,
    leader: Option<Uuid>,
    group_view: GroupView,
    entries: u64,
    lock: LockState,
    lock_pending: bool,
    requests: VecDeque<ClientRequest>,
    clients: HashMap<Uuid, PeerAddr>,
    heartbeats: HashMap<Uuid, Beat>,
    participating: bool,
    rom: RoMulticast,
    byz_leader: Option<LeaderRound>,
    byz_member: Option<MemberRound>,
    byz_history: RoundHistory,
    join_tries: u32,
    join_timer: Timer,
    heartbeat_timer: Timer,
    check_timer: Timer,
    watchdog_timer: Timer,
    halted: bool,
}

impl Server {
    pub fn new(context: Context, config: Arc<Config>, advertised: SocketAddr) -> Self {
        let uuid = Uuid::new_v4();
        Self::with_uuid(context, config, advertised, uuid)
    }

    fn with_uuid(
        context: Context,
        config: Arc<Config>,
        advertised: SocketAddr,
        uuid: Uuid,
    ) -> Self {
        Self {
            context,
            config,
            uuid,
            addr: advertised.into(),
            role: Role::Pending,
            leader: None,
            group_view: GroupView::new(),
            entries: 0,
            lock: LockState::Open,
            lock_pending: false,
            requests: VecDeque::new(),
            clients: HashMap::new(),
            heartbeats: HashMap::new(),
            participating: false,
            rom: RoMulticast::new(uuid),
            byz_leader: None,
            byz_member: None,
            byz_history: RoundHistory::new(),
            join_tries: 0,
            join_timer: Timer::default(),
            heartbeat_timer: Timer::default(),
            check_timer: Timer::default(),
            watchdog_timer: Timer::default(),
            halted: false,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn group_view(&self) -> &GroupView {
        &self.group_view
    }

    /// Enter the join flow: announce ourselves and wait for a leader.
    pub fn start(&mut self) {
        info!(uuid = %self.uuid, addr = ?self.addr, "server starting");
        self.request_join()
    }

    fn request_join(&mut self) {
        self.role = Role::Pending;
        self.leader = None;
        self.join_tries = 0;
        self.heartbeat_timer.unset(&mut self.context);
        self.check_timer.unset(&mut self.context);
        self.announce_join();
        let wait = self.config.join_wait;
        self.join_timer.reset(wait, &mut self.context);
    }

    fn announce_join(&mut self) {
        self.context.broadcast(Message::IdentServer {
            uuid: self.uuid,
            address: self.addr.0,
            port: self.addr.1,
        })
    }

    fn faulty_bound(&self) -> u32 {
        ((self.group_view.len().saturating_sub(1)) / 3) as u32
    }

    // membership

    fn handle_ident_server(&mut self, uuid: Uuid, addr: PeerAddr) {
        if uuid == self.uuid || self.role != Role::Leader {
            return;
        }
        if self.byz_leader.is_some() || self.byz_member.is_some() || self.participating {
            self.context.send_tcp(addr.socket(), &Message::TryAgain);
            return;
        }
        info!(%uuid, "admitting server");
        self.group_view.insert(uuid, addr);
        self.rom.register_member(uuid);
        let accept = Message::AcceptServer {
            leader: self.uuid,
            group_view: self.group_view.clone(),
            rnumbers: self.rom.rnumbers(),
            deliver_queue: self.rom.deliver_queue(),
            entries: self.entries,
        };
        if !self.context.send_tcp(addr.socket(), &accept) {
            warn!(%uuid, "new member unreachable, dropping admission");
            self.group_view.remove(&uuid);
            return;
        }
        self.heartbeats.insert(
            uuid,
            Beat {
                last: Instant::now(),
                strikes: 0,
            },
        );
        self.distribute_group_view();
        self.after_membership_change()
    }

    fn handle_accept_server(
        &mut self,
        leader: Uuid,
        group_view: GroupView,
        rnumbers: HashMap<Uuid, u64>,
        deliver_queue: HashMap<Uuid, crate::message::PendingEntry>,
        entries: u64,
    ) {
        let lonely_leader = self.role == Role::Leader && self.group_view.len() <= 1;
        if self.role != Role::Pending && !lonely_leader {
            warn!("unexpected ACCEPT_SERVER");
            return;
        }
        info!(%leader, "joined group");
        self.role = Role::Member;
        self.leader = Some(leader);
        self.group_view = group_view;
        for &member in self.group_view.clone().keys() {
            self.rom.register_member(member);
        }
        self.rom.sync_state(rnumbers, deliver_queue);
        let deliveries = self.rom.set_group_view(&self.group_view, &mut self.context);
        self.apply_deliveries(deliveries);
        self.entries = entries;
        self.lock = LockState::Open;
        self.lock_pending = false;
        self.join_timer.unset(&mut self.context);
        self.check_timer.unset(&mut self.context);
        let period = self.config.heartbeat_timeout;
        self.heartbeat_timer.reset(period, &mut self.context);
        self.emit_monitor()
    }

    fn handle_update_group_view(&mut self, group_view: GroupView) {
        if group_view == self.group_view {
            return;
        }
        debug!(size = group_view.len(), "adopting group view");
        self.group_view = group_view;
        for &member in self.group_view.clone().keys() {
            self.rom.register_member(member);
        }
        let deliveries = self.rom.set_group_view(&self.group_view, &mut self.context);
        self.apply_deliveries(deliveries);
        self.emit_monitor()
    }

    /// Push the authoritative view to every member; anyone unreachable is
    /// tentatively dropped and the shrunk view goes out again.
    fn distribute_group_view(&mut self) {
        loop {
            let others = Vec::from_iter(
                self.group_view
                    .iter()
                    .filter(|(&member, _)| member != self.uuid)
                    .map(|(&member, &addr)| (member, addr)),
            );
            let update = Message::UpdateGroupView {
                group_view: self.group_view.clone(),
            };
            let mut failed = Vec::new();
            for (member, addr) in others {
                if !self.context.send_tcp(addr.socket(), &update) {
                    failed.push(member);
                }
            }
            if failed.is_empty() {
                break;
            }
            for member in failed {
                warn!(%member, "member unreachable during view distribution, evicting");
                self.group_view.remove(&member);
                self.heartbeats.remove(&member);
            }
        }
        let deliveries = self.rom.set_group_view(&self.group_view, &mut self.context);
        self.apply_deliveries(deliveries);
        self.context.broadcast(Message::MonitorMessage(MonitorUpdate {
            uuid: self.uuid,
            group_view: Some(self.group_view.clone()),
            ..Default::default()
        }))
    }

    /// The leader's post-registration loop: yield to a larger uuid, or use
    /// the grown group for a cross-validation round.
    fn after_membership_change(&mut self) {
        if !election::is_ring_max(&self.group_view, self.uuid) {
            self.start_election()
        } else if self.faulty_bound() > 0 {
            self.start_byzantine()
        }
    }

    // heartbeats

    fn handle_heartbeat(&mut self, uuid: Uuid, addr: PeerAddr) {
        if self.role != Role::Leader {
            self.context.send_tcp(addr.socket(), &Message::NotLeader);
            return;
        }
        if self.group_view.contains_key(&uuid) {
            self.heartbeats.insert(
                uuid,
                Beat {
                    last: Instant::now(),
                    strikes: 0,
                },
            );
        } else {
            // evicted or never admitted: push it back through the join flow
            self.context.send_tcp(addr.socket(), &Message::NotLeader);
        }
    }

    fn send_heartbeat(&mut self) {
        let Some(leader) = self.leader.filter(|&leader| leader != self.uuid) else {
            return;
        };
        let Some(&addr) = self.group_view.get(&leader) else {
            warn!(%leader, "leader missing from group view");
            self.start_election();
            return;
        };
        let beat = Message::Heartbeat {
            uuid: self.uuid,
            address: self.addr.0,
            port: self.addr.1,
        };
        if !self.context.send_tcp(addr.socket(), &beat) {
            warn!(%leader, "leader unreachable, electing");
            self.group_view.remove(&leader);
            self.leader = None;
            let deliveries = self.rom.set_group_view(&self.group_view, &mut self.context);
            self.apply_deliveries(deliveries);
            self.start_election()
        }
    }

    fn check_heartbeats(&mut self, now: Instant) {
        if self.role != Role::Leader {
            return;
        }
        let mut evicted = Vec::new();
        for (&member, beat) in &mut self.heartbeats {
            if member == self.uuid || !self.group_view.contains_key(&member) {
                continue;
            }
            if now.duration_since(beat.last) > self.config.heartbeat_timeout {
                beat.strikes += 1;
                debug!(%member, strikes = beat.strikes, "missed heartbeat");
            }
            if beat.strikes >= self.config.max_timeouts {
                evicted.push(member);
            }
        }
        if !evicted.is_empty() {
            for member in &evicted {
                warn!(%member, "evicting silent member");
                self.group_view.remove(member);
                self.heartbeats.remove(member);
            }
            self.distribute_group_view();
            self.emit_monitor()
        }
        if self.group_view.len() == 1 {
            // alone: look for a bigger group to merge into
            self.announce_join()
        }
    }

    // election

    fn start_election(&mut self) {
        if self.participating {
            return;
        }
        info!("starting election");
        self.participating = true;
        self.emit_monitor();
        self.send_election(self.uuid, false)
    }

    /// Forward an election message to the ring neighbor, retrying with
    /// backoff and evicting unreachable neighbors.
    fn send_election(&mut self, mid: Uuid, is_leader: bool) {
        loop {
            let Some(neighbor) = election::neighbor(&self.group_view, self.uuid) else {
                // nobody left but us
                self.become_leader();
                return;
            };
            let addr = self.group_view[&neighbor].socket();
            let message = Message::ElectionMessage { mid, is_leader };
            let mut sent = false;
            for attempt in 0..self.config.max_tries {
                if self.context.send_tcp(addr, &message) {
                    sent = true;
                    break;
                }
                if attempt + 1 < self.config.max_tries {
                    let backoff = rand::thread_rng().gen_range(200..500);
                    std::thread::sleep(Duration::from_millis(backoff));
                }
            }
            if sent {
                return;
            }
            warn!(%neighbor, "ring neighbor unreachable, evicting and retrying");
            self.group_view.remove(&neighbor);
            self.heartbeats.remove(&neighbor);
            let deliveries = self.rom.set_group_view(&self.group_view, &mut self.context);
            self.apply_deliveries(deliveries);
        }
    }

    fn handle_election(&mut self, mid: Uuid, is_leader: bool) {
        if is_leader {
            if mid == self.uuid && !self.participating {
                // our announcement made it around the ring
                self.become_leader();
                return;
            }
            if self.participating {
                self.participating = false;
                self.leader = Some(mid);
                if mid != self.uuid {
                    if self.role == Role::Leader {
                        self.demote()
                    }
                    self.role = Role::Member;
                    if !self.heartbeat_timer.is_set() {
                        let period = self.config.heartbeat_timeout;
                        self.heartbeat_timer.set(period, &mut self.context);
                    }
                }
                self.send_election(mid, true);
                self.emit_monitor()
            }
        } else if mid == self.uuid {
            if self.participating {
                // everyone downstream had a smaller uuid: announce
                self.participating = false;
                self.send_election(self.uuid, true)
            }
        } else if mid > self.uuid {
            self.participating = true;
            self.send_election(mid, false)
        } else if !self.participating {
            self.participating = true;
            self.send_election(self.uuid, false)
        }
        // a smaller mid while participating is swallowed
    }

    fn become_leader(&mut self) {
        info!("assuming leadership");
        self.participating = false;
        self.role = Role::Leader;
        self.leader = Some(self.uuid);
        self.group_view.entry(self.uuid).or_insert(self.addr);
        self.join_timer.unset(&mut self.context);
        self.heartbeat_timer.unset(&mut self.context);
        let period = self.config.heartbeat_check_period();
        self.check_timer.reset(period, &mut self.context);

        let others = Vec::from_iter(
            self.group_view
                .iter()
                .filter(|(&member, _)| member != self.uuid)
                .map(|(&member, &addr)| (member, addr)),
        );
        let now = Instant::now();
        self.heartbeats.clear();
        for (member, addr) in others {
            if self.context.send_tcp(addr.socket(), &Message::Ping) {
                self.heartbeats.insert(member, Beat { last: now, strikes: 0 });
            } else {
                warn!(%member, "member unresponsive to leadership ping, evicting");
                self.group_view.remove(&member);
            }
        }
        self.distribute_group_view();
        self.emit_monitor();
        if self.faulty_bound() > 0 {
            self.start_byzantine()
        }
    }

    fn demote(&mut self) {
        info!("stepping down");
        self.role = Role::Member;
        self.check_timer.unset(&mut self.context);
        if let Some(round) = self.byz_leader.take() {
            self.byz_history.insert(round.id, RoundStatus::Aborted);
        }
    }

    // Byzantine agreement

    fn start_byzantine(&mut self) {
        if self.byz_leader.is_some() || self.faulty_bound() == 0 || self.role != Role::Leader {
            return;
        }
        let id = Uuid::new_v4();
        info!(round = %id, faulty = self.faulty_bound(), "starting byzantine round");
        self.rom.pause(&mut self.context);
        self.byz_history.insert(id, RoundStatus::Started);
        self.byz_leader = Some(LeaderRound::new(id));
        let dests = Vec::from_iter(
            self.group_view
                .keys()
                .copied()
                .filter(|&member| member != self.uuid),
        );
        let step = OmStep {
            v: self.entries,
            dests: dests.clone(),
            list: vec![self.uuid],
            faulty: self.faulty_bound(),
        };
        for member in dests {
            let Some(&addr) = self.group_view.get(&member) else {
                continue;
            };
            let message = Message::Om(OmMessage {
                id,
                body: OmBody::Step(step.clone()),
            });
            if !self.context.send_tcp(addr.socket(), &message) {
                warn!(%member, "unreachable during byzantine round start");
            }
        }
        self.emit_monitor()
    }

    fn handle_om_step(&mut self, id: Uuid, step: OmStep) {
        let conflicting = self
            .byz_member
            .as_ref()
            .map_or(false, |round| round.id != id);
        if conflicting {
            let old = self.byz_member.take().expect("checked above");
            warn!(old = %old.id, new = %id, "conflicting byzantine round, adopting the new one");
            self.byz_history.insert(old.id, RoundStatus::Aborted);
        }
        if self.byz_member.is_none() {
            self.byz_history.insert(id, RoundStatus::Started);
            self.byz_member = Some(MemberRound::new(id, self.group_view.len()));
        }
        if let Some(round) = self.byz_member.as_mut() {
            round.tree.push(step.list.clone(), step.v);
        }

        if step.faulty > 0 {
            let next_dests = Vec::from_iter(
                step.dests
                    .iter()
                    .copied()
                    .filter(|&dest| dest != self.uuid),
            );
            let mut list = vec![self.uuid];
            list.extend(&step.list);
            let relay = OmStep {
                v: self.entries,
                dests: next_dests.clone(),
                list,
                faulty: step.faulty - 1,
            };
            for dest in next_dests {
                let Some(&addr) = self.group_view.get(&dest) else {
                    continue;
                };
                let message = Message::Om(OmMessage {
                    id,
                    body: OmBody::Step(relay.clone()),
                });
                if !self.context.send_tcp(addr.socket(), &message) {
                    warn!(%dest, "cannot relay byzantine step, asking for a restart");
                    self.send_to_leader(&Message::OmRestart { id });
                    return;
                }
            }
        }

        let full = self
            .byz_member
            .as_ref()
            .map_or(false, |round| round.tree.is_full());
        if full {
            let round = self.byz_member.take().expect("checked above");
            let result = round.tree.decide().unwrap_or(self.entries);
            let report = Message::Om(OmMessage {
                id,
                body: OmBody::Result(OmResult {
                    from: self.uuid,
                    result,
                }),
            });
            self.send_to_leader(&report);
            self.byz_history.insert(id, RoundStatus::Finished);
            self.emit_monitor()
        }
    }

    fn handle_om_result(&mut self, id: Uuid, from: Uuid, result: u64) {
        let Some(round) = self.byz_leader.as_mut() else {
            warn!("byzantine report without an active round");
            return;
        };
        if round.id != id {
            warn!(got = %id, want = %round.id, "report for a stale byzantine round");
            return;
        }
        round.responders.insert(from);
        round.tally.add(result);
        let expected = HashSet::<Uuid>::from_iter(
            self.group_view
                .keys()
                .copied()
                .filter(|&member| member != self.uuid),
        );
        if !expected.is_subset(&round.responders) {
            return;
        }
        let reconciled = round.tally.plurality().unwrap_or(self.entries);
        info!(round = %id, value = reconciled, "byzantine round finished");
        self.byz_history.insert(id, RoundStatus::Finished);
        self.byz_leader = None;
        self.entries = reconciled;
        self.rom.resume(reconciled, &mut self.context);
        self.emit_monitor()
    }

    fn handle_om_restart(&mut self, id: Uuid) {
        if self.role != Role::Leader {
            return;
        }
        warn!(round = %id, "aborting byzantine round on member request");
        if let Some(round) = self.byz_leader.take() {
            self.byz_history.insert(round.id, RoundStatus::Aborted);
        } else {
            self.byz_history.insert(id, RoundStatus::Aborted);
        }
        self.start_byzantine()
    }

    fn send_to_leader(&mut self, message: &Message) {
        let Some(leader) = self.leader else { return };
        let Some(&addr) = self.group_view.get(&leader) else {
            return;
        };
        self.context.send_tcp(addr.socket(), message);
    }

    // admission

    fn handle_request_action(&mut self, addr: PeerAddr, number: u32, increase: bool) {
        debug!(number, increase, "client request queued");
        self.requests.push_back(ClientRequest {
            addr,
            number,
            increase,
        });
        self.drive_lock()
    }

    fn drive_lock(&mut self) {
        if self.lock == LockState::Open && !self.requests.is_empty() && !self.lock_pending {
            self.lock_pending = true;
            let uuid = self.uuid;
            self.rom.send(McPayload::Lock { uuid }, &mut self.context)
        }
    }

    fn on_lock(&mut self, holder: Uuid) {
        match self.lock {
            LockState::Open => {
                if holder == self.uuid {
                    self.lock = LockState::Mine;
                    self.lock_pending = false;
                    self.drain_requests()
                } else {
                    self.lock = LockState::Closed
                }
            }
            LockState::Mine | LockState::Closed => {
                if holder == self.uuid {
                    // our bid lost the total order; retry after the unlock
                    self.lock_pending = false
                } else {
                    debug!(%holder, "late lock bid ignored")
                }
            }
        }
    }

    fn on_unlock(&mut self, holder: Uuid) {
        if holder == self.uuid || self.lock == LockState::Closed {
            self.lock = LockState::Open;
        }
        self.drive_lock()
    }

    /// Serve every queued request while we hold the lock, then publish the
    /// new count and release.
    fn drain_requests(&mut self) {
        let before = self.entries;
        while let Some(request) = self.requests.pop_front() {
            if request.increase {
                if self.entries < self.config.max_entries {
                    self.entries += 1;
                    info!(number = request.number, entries = self.entries, "entry granted");
                    self.respond(request.addr, &Message::AcceptEntry)
                } else {
                    info!(number = request.number, "entry denied, venue full");
                    self.respond(request.addr, &Message::DenyEntry)
                }
            } else {
                if self.entries == 0 {
                    warn!("release on an empty venue");
                }
                self.entries = self.entries.saturating_sub(1);
                info!(number = request.number, entries = self.entries, "entry released");
            }
        }
        if self.entries != before {
            self.push_entries_to_clients();
            let update = McPayload::UpdateEntries {
                entries: self.entries,
                uuid: self.uuid,
            };
            self.rom.send(update, &mut self.context);
        }
        let unlock = McPayload::Unlock { uuid: self.uuid };
        self.rom.send(unlock, &mut self.context);
        self.emit_monitor()
    }

    fn respond(&mut self, addr: PeerAddr, message: &Message) {
        if !self.context.send_tcp(addr.socket(), message) {
            let gone = Vec::from_iter(
                self.clients
                    .iter()
                    .filter(|(_, &client)| client == addr)
                    .map(|(&uuid, _)| uuid),
            );
            for uuid in gone {
                self.clients.remove(&uuid);
            }
        }
    }

    fn on_remote_entries(&mut self, entries: u64, from: Uuid) {
        if from == self.uuid {
            return;
        }
        self.entries = entries;
        self.push_entries_to_clients();
        self.emit_monitor()
    }

    fn push_entries_to_clients(&mut self) {
        let update = Message::UpdateEntries {
            entries: self.entries,
        };
        let gone = Vec::from_iter(
            self.clients
                .clone()
                .into_iter()
                .filter(|(_, addr)| !self.context.send_tcp(addr.socket(), &update))
                .map(|(uuid, _)| uuid),
        );
        for uuid in gone {
            debug!(client = %uuid, "client unreachable, dropping registration");
            self.clients.remove(&uuid);
        }
    }

    fn apply_deliveries(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Payload(McPayload::Lock { uuid }) => self.on_lock(uuid),
                Delivery::Payload(McPayload::Unlock { uuid }) => self.on_unlock(uuid),
                Delivery::Payload(McPayload::UpdateEntries { entries, uuid }) => {
                    self.on_remote_entries(entries, uuid)
                }
                Delivery::Paused => {
                    let wait = self.config.stop_watchdog();
                    self.watchdog_timer.reset(wait, &mut self.context)
                }
                Delivery::Reconciled(value) => {
                    self.watchdog_timer.unset(&mut self.context);
                    self.entries = value;
                    self.push_entries_to_clients();
                    self.emit_monitor();
                    self.drive_lock()
                }
            }
        }
    }

    // observability

    fn emit_monitor(&mut self) {
        let update = MonitorUpdate {
            uuid: self.uuid,
            hostname: Some(hostname()),
            ip: Some(self.addr.0),
            port: Some(self.addr.1),
            clients: Some(self.clients.keys().copied().collect()),
            entries: Some(self.entries),
            election: Some(self.participating),
            byzantine: Some(self.byz_leader.is_some() || self.byz_member.is_some()),
            state: Some(format!("{:?}", self.role)),
            group_view: None,
            leaving: false,
        };
        self.context.broadcast(Message::MonitorMessage(update))
    }

    // timers

    fn on_join_timeout(&mut self) {
        if self.role != Role::Pending {
            self.join_timer.unset(&mut self.context);
            return;
        }
        self.join_tries += 1;
        if self.join_tries >= self.config.max_tries {
            info!("no group answered, becoming sole leader");
            self.join_timer.unset(&mut self.context);
            self.group_view.insert(self.uuid, self.addr);
            self.become_leader()
        } else {
            self.announce_join()
        }
    }

    fn on_watchdog(&mut self) {
        self.watchdog_timer.unset(&mut self.context);
        self.rom.force_resume(&mut self.context);
        if let Some(round) = self.byz_member.take() {
            self.byz_history.insert(round.id, RoundStatus::Aborted);
        }
        if let Some(round) = self.byz_leader.take() {
            self.byz_history.insert(round.id, RoundStatus::Aborted);
        }
        self.emit_monitor();
        self.drive_lock()
    }
}

impl Receivers for Server {
    fn handle_tcp(&mut self, remote: SocketAddr, message: Message) {
        match message {
            Message::AcceptServer {
                leader,
                group_view,
                rnumbers,
                deliver_queue,
                entries,
            } => self.handle_accept_server(leader, group_view, rnumbers, deliver_queue, entries),
            Message::TryAgain => {
                if self.role == Role::Pending {
                    debug!("group busy, retrying join");
                    self.announce_join();
                    let wait = self.config.join_wait;
                    self.join_timer.reset(wait, &mut self.context)
                }
            }
            Message::UpdateGroupView { group_view } => self.handle_update_group_view(group_view),
            Message::ElectionMessage { mid, is_leader } => self.handle_election(mid, is_leader),
            Message::Heartbeat {
                uuid,
                address,
                port,
            } => self.handle_heartbeat(uuid, PeerAddr(address, port)),
            Message::ChooseServer {
                uuid,
                address,
                port,
            } => {
                info!(client = %uuid, "client registered");
                self.clients.insert(uuid, PeerAddr(address, port));
                let accept = Message::AcceptClient {
                    entries: self.entries,
                };
                self.context
                    .send_tcp(SocketAddr::new(address, port), &accept);
                self.emit_monitor()
            }
            Message::ShutdownClient { uuid } => {
                info!(client = %uuid, "client left");
                self.clients.remove(&uuid);
                self.emit_monitor()
            }
            Message::RequestAction {
                address,
                port,
                number,
                increase,
                ..
            } => self.handle_request_action(PeerAddr(address, port), number, increase),
            Message::Om(OmMessage { id, body }) => match body {
                OmBody::Step(step) => self.handle_om_step(id, step),
                OmBody::Result(OmResult { from, result }) => {
                    self.handle_om_result(id, from, result)
                }
            },
            Message::OmRestart { id } => self.handle_om_restart(id),
            Message::NotLeader => {
                if self.role == Role::Member {
                    warn!("our leader is not the leader, rejoining");
                    self.request_join()
                }
            }
            Message::Ping => {}
            Message::ManualValueOverride { value } => {
                warn!(value, "manual counter override");
                self.entries = value;
                self.emit_monitor()
            }
            other => debug!(from = %remote, ?other, "unexpected tcp message"),
        }
    }

    fn handle_broadcast(&mut self, _remote: SocketAddr, message: Message) {
        match message {
            Message::IdentServer {
                uuid,
                address,
                port,
            } => self.handle_ident_server(uuid, PeerAddr(address, port)),
            Message::IdentClient { address, port, .. } => {
                // any server answers; the client picks its first responder
                let ident = Message::IdentServer {
                    uuid: self.uuid,
                    address: self.addr.0,
                    port: self.addr.1,
                };
                self.context
                    .send_tcp(SocketAddr::new(address, port), &ident);
            }
            Message::ShutdownServer { uuid } => {
                if uuid == self.uuid {
                    return;
                }
                if Some(uuid) == self.leader && self.role == Role::Member {
                    info!(%uuid, "leader announced shutdown");
                    self.group_view.remove(&uuid);
                    self.leader = None;
                    let deliveries =
                        self.rom.set_group_view(&self.group_view, &mut self.context);
                    self.apply_deliveries(deliveries);
                    self.start_election()
                } else if self.role == Role::Leader && self.group_view.contains_key(&uuid) {
                    info!(%uuid, "member announced shutdown");
                    self.group_view.remove(&uuid);
                    self.heartbeats.remove(&uuid);
                    self.distribute_group_view();
                    self.emit_monitor()
                }
            }
            Message::ShutdownSystem => {
                info!("system shutdown requested");
                self.halted = true
            }
            Message::RunByz => {
                if self.role == Role::Leader {
                    self.start_byzantine()
                }
            }
            Message::MonitorMessage(_) => {}
            other => debug!(?other, "unhandled broadcast"),
        }
    }

    fn handle_multicast(&mut self, remote: SocketAddr, datagram: crate::message::Datagram) {
        let deliveries = self.rom.handle(datagram, remote, &mut self.context);
        self.apply_deliveries(deliveries)
    }

    fn on_timer(&mut self, id: TimerId) {
        if self.join_timer.fired(id) {
            self.on_join_timeout()
        } else if self.heartbeat_timer.fired(id) {
            self.send_heartbeat()
        } else if self.check_timer.fired(id) {
            self.check_heartbeats(Instant::now())
        } else if self.watchdog_timer.fired(id) {
            self.on_watchdog()
        }
    }

    fn stopped(&self) -> bool {
        self.halted
    }

    fn on_stop(&mut self) {
        info!("shutting down");
        let goodbye = Message::ShutdownServer { uuid: self.uuid };
        match self.role {
            Role::Leader => self.context.broadcast(goodbye),
            Role::Member => self.send_to_leader(&goodbye),
            Role::Pending => {}
        }
        self.context.broadcast(Message::MonitorMessage(MonitorUpdate {
            uuid: self.uuid,
            leaving: true,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::message::Datagram;

    use super::*;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            max_entries: 2,
            ..Config::default()
        })
    }

    fn addr_of(i: usize) -> SocketAddr {
        format!("10.1.0.{}:40000", i + 1).parse().unwrap()
    }

    fn server(i: usize, uuid: Uuid) -> Server {
        Server::with_uuid(Context::recording(), config(), addr_of(i), uuid)
    }

    /// Promote a freshly started server to sole leader by running out its
    /// join announcements.
    fn sole_leader(server: &mut Server) {
        server.start();
        let id = server.join_timer.id.unwrap();
        for _ in 0..3 {
            server.on_timer(id);
        }
        assert_eq!(server.role, Role::Leader);
    }

    /// A little LAN for full-protocol tests: routes TCP by address and
    /// fans multicasts out to every server (loopback included). Everything
    /// routed is also logged, since routing drains the recorders.
    struct Lan {
        servers: Vec<Server>,
        tcp_log: Vec<(SocketAddr, Message)>,
        mc_log: Vec<Datagram>,
    }

    impl Lan {
        fn new(servers: Vec<Server>) -> Self {
            Self {
                servers,
                tcp_log: Vec::new(),
                mc_log: Vec::new(),
            }
        }

        fn pump(&mut self) {
            loop {
                let mut quiet = true;
                for i in 0..self.servers.len() {
                    let tcp = self.servers[i].context.recorded().take_tcp();
                    let multicasts = self.servers[i].context.recorded().take_multicasts();
                    let unicasts = self.servers[i].context.recorded().take_unicasts();
                    let broadcasts =
                        std::mem::take(&mut self.servers[i].context.recorded().broadcasts);
                    let source = self.servers[i].addr.socket();
                    quiet &= tcp.is_empty()
                        && multicasts.is_empty()
                        && unicasts.is_empty()
                        && broadcasts.is_empty();
                    for (target, message) in tcp {
                        self.tcp_log.push((target, message.clone()));
                        if let Some(j) = self.index_of(target) {
                            self.servers[j].handle_tcp(source, message)
                        }
                    }
                    for datagram in multicasts {
                        self.mc_log.push(datagram.clone());
                        for j in 0..self.servers.len() {
                            self.servers[j].handle_multicast(source, datagram.clone())
                        }
                    }
                    for (target, datagram) in unicasts {
                        if let Some(j) = self.index_of(target) {
                            self.servers[j].handle_multicast(source, datagram)
                        }
                    }
                    for message in broadcasts {
                        for j in 0..self.servers.len() {
                            self.servers[j].handle_broadcast(source, message.clone())
                        }
                    }
                }
                if quiet {
                    break;
                }
            }
        }

        fn index_of(&self, target: SocketAddr) -> Option<usize> {
            self.servers
                .iter()
                .position(|server| server.addr.socket() == target)
        }
    }

    /// Build a settled group of `n` servers with ascending uuids; the last
    /// one (largest uuid) is the leader, so admissions don't re-elect.
    fn group(n: usize) -> Lan {
        let mut servers =
            Vec::from_iter((0..n).map(|i| server(i, Uuid::from_u128((i + 1) as u128))));
        sole_leader(&mut servers[n - 1]);
        let mut lan = Lan::new(servers);
        lan.pump();
        for i in 0..n - 1 {
            lan.servers[i].start();
            lan.pump();
        }
        for server in &lan.servers {
            assert_eq!(server.group_view.len(), n);
        }
        lan
    }

    #[test]
    fn unanswered_join_promotes_sole_leader() {
        let mut s = server(0, Uuid::from_u128(1));
        s.start();
        assert_eq!(s.role, Role::Pending);
        assert_eq!(
            s.context
                .recorded()
                .broadcasts
                .iter()
                .filter(|m| matches!(m, Message::IdentServer { .. }))
                .count(),
            1
        );
        let id = s.join_timer.id.unwrap();
        s.on_timer(id);
        s.on_timer(id);
        assert_eq!(s.role, Role::Pending);
        s.on_timer(id);
        assert_eq!(s.role, Role::Leader);
        assert_eq!(s.group_view.len(), 1);
        assert_eq!(s.entries, 0);
        assert!(!s.participating);
    }

    #[test]
    fn leader_admits_and_distributes_the_view() {
        let mut leader = server(0, Uuid::from_u128(9));
        sole_leader(&mut leader);
        leader.context.recorded().take_tcp();

        let joiner = Uuid::from_u128(3);
        leader.handle_ident_server(joiner, addr_of(1).into());
        assert_eq!(leader.group_view.len(), 2);
        let tcp = leader.context.recorded().take_tcp();
        assert!(tcp
            .iter()
            .any(|(to, m)| *to == addr_of(1) && matches!(m, Message::AcceptServer { .. })));
        assert!(tcp
            .iter()
            .any(|(to, m)| *to == addr_of(1) && matches!(m, Message::UpdateGroupView { .. })));
        // smaller uuid joined: still ring max, no election
        assert!(!leader.participating);
    }

    #[test]
    fn larger_joiner_triggers_exactly_one_election() {
        let mut lan = group(1);
        let mut joiner = server(1, Uuid::from_u128(100));
        joiner.start();
        lan.servers.push(joiner);
        lan.pump();

        assert_eq!(lan.servers[1].role, Role::Leader);
        assert_eq!(lan.servers[0].role, Role::Member);
        assert_eq!(lan.servers[0].leader, Some(Uuid::from_u128(100)));
        for server in &lan.servers {
            assert_eq!(server.group_view.len(), 2);
            assert!(!server.participating);
        }
    }

    #[test]
    fn busy_leader_answers_try_again() {
        let mut leader = server(0, Uuid::from_u128(9));
        sole_leader(&mut leader);
        leader.participating = true;
        leader.context.recorded().take_tcp();
        leader.handle_ident_server(Uuid::from_u128(3), addr_of(1).into());
        let tcp = leader.context.recorded().take_tcp();
        assert_eq!(tcp.len(), 1);
        assert!(matches!(tcp[0].1, Message::TryAgain));
        assert_eq!(leader.group_view.len(), 1);
    }

    #[test]
    fn identical_group_view_update_is_a_no_op() {
        let mut lan = group(2);
        let view = lan.servers[0].group_view.clone();
        lan.servers[0].context.recorded().broadcasts.clear();
        lan.servers[0].handle_update_group_view(view);
        assert!(lan.servers[0].context.recorded().broadcasts.is_empty());
    }

    #[test]
    fn increment_under_lock_updates_both_replicas() {
        let mut lan = group(2);
        let client = "10.9.0.1:50000".parse::<SocketAddr>().unwrap();
        lan.servers[0].handle_tcp(
            client,
            Message::RequestAction {
                uuid: Uuid::from_u128(77),
                address: client.ip(),
                port: client.port(),
                number: 4,
                increase: true,
            },
        );
        lan.pump();

        for server in &lan.servers {
            assert_eq!(server.entries, 1);
            assert_eq!(server.lock, LockState::Open);
        }
        // the serving replica granted exactly once
        let grants = lan
            .tcp_log
            .iter()
            .filter(|(to, m)| *to == client && matches!(m, Message::AcceptEntry))
            .count();
        assert_eq!(grants, 1);
    }

    #[test]
    fn full_venue_denies_without_publishing() {
        let mut lan = group(2);
        lan.servers[0].entries = 2;
        lan.servers[1].entries = 2;
        let client = "10.9.0.1:50000".parse::<SocketAddr>().unwrap();
        lan.servers[0].handle_tcp(
            client,
            Message::RequestAction {
                uuid: Uuid::from_u128(77),
                address: client.ip(),
                port: client.port(),
                number: 4,
                increase: true,
            },
        );
        lan.pump();

        assert!(lan
            .tcp_log
            .iter()
            .any(|(to, m)| *to == client && matches!(m, Message::DenyEntry)));
        for server in &lan.servers {
            assert_eq!(server.entries, 2);
            assert_eq!(server.lock, LockState::Open);
        }
        // no UPDATE_ENTRIES travelled the ordered layer
        assert!(!lan.mc_log.iter().any(|datagram| {
            matches!(
                datagram,
                Datagram::Stamped(stamped)
                    if matches!(
                        stamped.payload,
                        crate::message::Payload::Real {
                            inner: McPayload::UpdateEntries { .. }
                        }
                    )
            )
        }));
    }

    #[test]
    fn release_clamps_at_zero() {
        let mut lan = group(2);
        let client = "10.9.0.1:50000".parse::<SocketAddr>().unwrap();
        lan.servers[0].handle_tcp(
            client,
            Message::RequestAction {
                uuid: Uuid::from_u128(77),
                address: client.ip(),
                port: client.port(),
                number: 4,
                increase: false,
            },
        );
        lan.pump();
        for server in &lan.servers {
            assert_eq!(server.entries, 0);
        }
    }

    #[test]
    fn heartbeat_failure_starts_an_election() {
        let mut lan = group(3);
        // kill the leader (largest uuid, index 2)
        let leader_addr = lan.servers[2].addr.socket();
        let dead = lan.servers.remove(2);
        drop(dead);
        for server in &mut lan.servers {
            server.context.recorded().unreachable.insert(leader_addr);
        }

        let id = lan.servers[1].heartbeat_timer.id.unwrap();
        lan.servers[1].on_timer(id);
        lan.pump();

        let leaders = Vec::from_iter(
            lan.servers
                .iter()
                .filter(|server| server.role == Role::Leader),
        );
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].uuid, Uuid::from_u128(2));
        for server in &lan.servers {
            assert_eq!(server.group_view.len(), 2);
            assert!(!server.participating);
        }
    }

    #[test]
    fn silent_member_is_struck_out() {
        let mut lan = group(2);
        let leader = &mut lan.servers[1];
        let member = Uuid::from_u128(1);
        let past = Instant::now() - Duration::from_secs(60);
        leader.heartbeats.insert(
            member,
            Beat {
                last: past,
                strikes: 0,
            },
        );
        let now = Instant::now();
        leader.check_heartbeats(now);
        assert!(leader.group_view.contains_key(&member));
        leader.check_heartbeats(now);
        assert!(!leader.group_view.contains_key(&member));
    }

    #[test]
    fn byzantine_round_reconciles_an_overridden_counter() {
        let mut lan = group(4);
        for server in &mut lan.servers {
            server.entries = 5;
        }
        // inject a fault
        let victim = lan.servers[1].addr.socket();
        lan.servers[1].handle_tcp(victim, Message::ManualValueOverride { value: 99 });
        assert_eq!(lan.servers[1].entries, 99);

        let leader_addr = lan.servers[3].addr.socket();
        lan.servers[3].handle_broadcast(leader_addr, Message::RunByz);
        lan.pump();

        for server in &lan.servers {
            assert_eq!(server.entries, 5);
            assert!(server.byz_leader.is_none());
            assert!(server.byz_member.is_none());
            assert!(!server.rom.is_paused());
        }
        assert!(lan.servers[3]
            .byz_history
            .values()
            .any(|status| *status == RoundStatus::Finished));
    }

    #[test]
    fn orphaned_stop_resumes_through_the_watchdog() {
        let mut lan = group(2);
        let leader = &mut lan.servers[1];
        leader.rom.pause(&mut leader.context);
        lan.pump();
        assert!(lan.servers[0].rom.is_paused());
        assert!(lan.servers[0].watchdog_timer.is_set());

        let id = lan.servers[0].watchdog_timer.id.unwrap();
        lan.servers[0].on_timer(id);
        assert!(!lan.servers[0].rom.is_paused());
        assert!(!lan.servers[0].watchdog_timer.is_set());
    }

    #[test]
    fn shutdown_system_halts_the_server() {
        let mut s = server(0, Uuid::from_u128(1));
        sole_leader(&mut s);
        assert!(!s.stopped());
        s.handle_broadcast(addr_of(5), Message::ShutdownSystem);
        assert!(s.stopped());
    }
}
