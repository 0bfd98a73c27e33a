//! Reliable, totally-ordered multicast over the UDP group socket.
//!
//! Reliability is a flood: the first time a node sees a stamped datagram
//! from someone else it re-sends it under its own sequence number, so every
//! peer keeps a per-relayer contiguous stream and can serve NACKs for
//! anything it ever forwarded. Total order is the ISIS three-phase
//! agreement: receivers propose a sequence number back to the direct
//! source, the originator finalizes the maximum once every live member of
//! the view-at-send has answered, and delivery releases the hold-back queue
//! in `(agreed, original-sender)` order.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    context::Context,
    message::{ControlDatagram, Datagram, GroupView, McPayload, Payload, PendingEntry, StampedDatagram},
};

/// Upcalls raised toward the coordination core, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A totally-ordered application message.
    Payload(McPayload),
    /// A STOP was delivered; payload traffic is quiesced until RESUME.
    Paused,
    /// The matching RESUME arrived carrying the reconciled counter value.
    Reconciled(u64),
}

pub struct RoMulticast {
    id: Uuid,
    snumber: u64,
    rnumbers: HashMap<Uuid, u64>,
    received: HashSet<Uuid>,
    holdback: HashMap<Uuid, (StampedDatagram, SocketAddr)>,
    out: HashMap<u64, StampedDatagram>,
    out_a: HashMap<Uuid, HashMap<Uuid, u64>>,
    view_backlog: HashMap<Uuid, HashSet<Uuid>>,
    current_view: HashSet<Uuid>,
    deliver_queue: HashMap<Uuid, PendingEntry>,
    aq: u64,
    pq: u64,
    paused: bool,
    paused_queue: VecDeque<(Uuid, Option<Uuid>, Payload)>,
}

impl RoMulticast {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            snumber: 0,
            rnumbers: HashMap::from([(id, 0)]),
            received: Default::default(),
            holdback: Default::default(),
            out: Default::default(),
            out_a: Default::default(),
            view_backlog: Default::default(),
            current_view: HashSet::from([id]),
            deliver_queue: Default::default(),
            aq: 0,
            pq: 0,
            paused: false,
            paused_queue: Default::default(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Give the engine its own copy of the membership and re-check every
    /// in-flight proposal collection: if everyone still present has already
    /// answered, the round completes now instead of deadlocking on a
    /// crashed proposer. Unagreed messages whose originator left can never
    /// finalize and are dropped so the hold-back queue keeps moving; any
    /// agreed messages they were blocking are delivered.
    pub fn set_group_view(&mut self, view: &GroupView, context: &mut Context) -> Vec<Delivery> {
        self.current_view = view.keys().copied().collect();
        let in_flight = Vec::from_iter(self.out_a.keys().copied());
        for id in in_flight {
            if self.out_a.contains_key(&id) && self.proposal_complete(id) {
                self.finish_proposal(id, context)
            }
        }
        let view = &self.current_view;
        self.deliver_queue.retain(|id, entry| {
            let keep = entry.agreed.is_some()
                || entry
                    .original
                    .map_or(true, |original| view.contains(&original));
            if !keep {
                warn!(%id, "dropping unagreed message from an evicted sender");
            }
            keep
        });
        let mut deliveries = Vec::new();
        self.drain_agreed(context, &mut deliveries);
        deliveries
    }

    pub fn register_member(&mut self, id: Uuid) {
        self.rnumbers.entry(id).or_insert(0);
    }

    /// Adopt a leader's sequencing state on join.
    pub fn sync_state(
        &mut self,
        rnumbers: HashMap<Uuid, u64>,
        deliver_queue: HashMap<Uuid, PendingEntry>,
    ) {
        self.rnumbers.extend(rnumbers);
        self.deliver_queue.extend(deliver_queue);
    }

    pub fn rnumbers(&self) -> HashMap<Uuid, u64> {
        self.rnumbers.clone()
    }

    pub fn deliver_queue(&self) -> HashMap<Uuid, PendingEntry> {
        self.deliver_queue.clone()
    }

    /// Multicast an application payload through the total order. Buffered
    /// while the layer is paused.
    pub fn send(&mut self, payload: McPayload, context: &mut Context) {
        self.submit(Payload::Real { inner: payload }, context)
    }

    /// Quiesce payload traffic at a totally-ordered cut.
    pub fn pause(&mut self, context: &mut Context) {
        if !self.paused {
            info!("pausing ordered multicast");
        }
        self.paused = true;
        self.submit(Payload::Stop, context)
    }

    /// Lift the pause, carrying the reconciled counter to every replica.
    pub fn resume(&mut self, value: u64, context: &mut Context) {
        if self.paused {
            info!("resuming ordered multicast");
        }
        self.paused = false;
        self.submit(Payload::Resume { value }, context);
        self.flush_paused(context)
    }

    /// Local-only resume, used when a STOP was never answered.
    pub fn force_resume(&mut self, context: &mut Context) {
        if !self.paused {
            return;
        }
        warn!("no RESUME arrived for a delivered STOP, resuming locally");
        self.paused = false;
        self.flush_paused(context)
    }

    fn flush_paused(&mut self, context: &mut Context) {
        while let Some((id, original, payload)) = self.paused_queue.pop_front() {
            self.transmit(id, original, payload, context)
        }
    }

    fn submit(&mut self, payload: Payload, context: &mut Context) {
        let id = Uuid::new_v4();
        self.out_a.insert(id, HashMap::new());
        self.view_backlog.insert(id, self.current_view.clone());
        if self.paused && matches!(payload, Payload::Real { .. }) {
            self.paused_queue.push_back((id, Some(self.id), payload));
            return;
        }
        self.transmit(id, Some(self.id), payload, context)
    }

    /// Stamp with this node's send counter and put it on the wire. Every
    /// stamped datagram we ever emit stays in `out` for NACK retransmits.
    fn transmit(&mut self, id: Uuid, original: Option<Uuid>, payload: Payload, context: &mut Context) {
        self.snumber += 1;
        let datagram = StampedDatagram {
            id,
            sender: self.id,
            seq: self.snumber,
            original,
            payload,
        };
        self.out.insert(self.snumber, datagram.clone());
        context.multicast(&Datagram::Stamped(datagram))
    }

    pub fn handle(
        &mut self,
        datagram: Datagram,
        remote: SocketAddr,
        context: &mut Context,
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        match datagram {
            Datagram::Control(ControlDatagram::Proposal {
                mesg_id, pq, sender, ..
            }) => self.collect_proposal(mesg_id, pq, sender, context),
            Datagram::Control(ControlDatagram::Nack { nacks, .. }) => {
                for seq in nacks {
                    if let Some(datagram) = self.out.get(&seq) {
                        context.unicast(remote, &Datagram::Stamped(datagram.clone()))
                    }
                }
            }
            Datagram::Stamped(datagram) => self.handle_stamped(datagram, remote, context, &mut deliveries),
        }
        deliveries
    }

    fn handle_stamped(
        &mut self,
        datagram: StampedDatagram,
        remote: SocketAddr,
        context: &mut Context,
        deliveries: &mut Vec<Delivery>,
    ) {
        let sender = datagram.sender;
        let Some(&contiguous) = self.rnumbers.get(&sender) else {
            warn!(%sender, "datagram from unregistered sender");
            return;
        };
        if self.received.insert(datagram.id) {
            if sender != self.id {
                self.relay(&datagram, context)
            }
            if datagram.seq == contiguous + 1 {
                let mut next = datagram.seq + 1;
                self.process(datagram, remote, context, deliveries);
                while let Some((held, held_remote)) = self.take_holdback(next, sender) {
                    self.process(held, held_remote, context, deliveries);
                    next += 1;
                }
            } else if datagram.seq <= contiguous {
                debug!(%sender, seq = datagram.seq, "stale datagram");
            } else {
                self.request_missing(datagram, remote, context, deliveries)
            }
        } else if datagram.seq == contiguous + 1 {
            // retransmission of something already seen through a relay;
            // it still advances this sender's stream
            self.rnumbers.insert(sender, datagram.seq);
        }
    }

    /// First sight of someone else's datagram: forward it under our own
    /// stamp so the flood survives the originator and NACKs against us can
    /// be served.
    fn relay(&mut self, datagram: &StampedDatagram, context: &mut Context) {
        if self.paused && matches!(datagram.payload, Payload::Real { .. }) {
            self.paused_queue
                .push_back((datagram.id, datagram.original, datagram.payload.clone()));
            return;
        }
        self.transmit(datagram.id, datagram.original, datagram.payload.clone(), context)
    }

    fn process(
        &mut self,
        datagram: StampedDatagram,
        remote: SocketAddr,
        context: &mut Context,
        deliveries: &mut Vec<Delivery>,
    ) {
        *self.rnumbers.entry(datagram.sender).or_insert(0) += 1;
        match datagram.payload {
            Payload::Real { .. } | Payload::Stop | Payload::Resume { .. } => {
                self.propose_order(datagram, remote, context)
            }
            Payload::Agreed { mesg_id, a } => self.finalize(mesg_id, a, context, deliveries),
        }
    }

    fn propose_order(&mut self, datagram: StampedDatagram, remote: SocketAddr, context: &mut Context) {
        self.pq = self.aq.max(self.pq) + 1;
        self.deliver_queue.insert(
            datagram.id,
            PendingEntry {
                payload: datagram.payload,
                original: datagram.original,
                pq: self.pq,
                agreed: None,
            },
        );
        context.unicast(
            remote,
            &Datagram::Control(ControlDatagram::Proposal {
                id: Uuid::new_v4(),
                mesg_id: datagram.id,
                pq: self.pq,
                sender: self.id,
            }),
        )
    }

    fn collect_proposal(&mut self, mesg_id: Uuid, pq: u64, proposer: Uuid, context: &mut Context) {
        let Some(proposals) = self.out_a.get_mut(&mesg_id) else {
            return;
        };
        proposals.insert(proposer, pq);
        if self.proposal_complete(mesg_id) {
            self.finish_proposal(mesg_id, context)
        }
    }

    /// One proposal from every member that was present at send time and is
    /// still present now.
    fn proposal_complete(&self, mesg_id: Uuid) -> bool {
        let Some(backlog) = self.view_backlog.get(&mesg_id) else {
            return false;
        };
        let proposals = &self.out_a[&mesg_id];
        backlog
            .intersection(&self.current_view)
            .all(|member| proposals.contains_key(member))
    }

    fn finish_proposal(&mut self, mesg_id: Uuid, context: &mut Context) {
        let proposals = self.out_a.remove(&mesg_id).expect("checked by caller");
        self.view_backlog.remove(&mesg_id);
        let Some(a) = proposals.values().max().copied() else {
            warn!(%mesg_id, "every proposer left the group, abandoning message");
            return;
        };
        self.transmit(Uuid::new_v4(), None, Payload::Agreed { mesg_id, a }, context)
    }

    fn finalize(&mut self, mesg_id: Uuid, a: u64, context: &mut Context, deliveries: &mut Vec<Delivery>) {
        self.aq = self.aq.max(a);
        match self.deliver_queue.get_mut(&mesg_id) {
            Some(entry) => entry.agreed = Some(a),
            None => {
                if !self.received.contains(&mesg_id) {
                    error!(%mesg_id, "agreement for a message that never reached the hold-back queue");
                }
                return;
            }
        }
        self.drain_agreed(context, deliveries)
    }

    /// Release the hold-back queue head-first: the smallest
    /// `(sequence, original)` entry goes out only once its agreement is
    /// final, everything behind it waits.
    fn drain_agreed(&mut self, context: &mut Context, deliveries: &mut Vec<Delivery>) {
        loop {
            let head = self
                .deliver_queue
                .iter()
                .min_by_key(|(id, entry)| {
                    (
                        entry.agreed.unwrap_or(entry.pq),
                        entry.original.unwrap_or(**id),
                    )
                })
                .map(|(id, entry)| (*id, entry.agreed.is_some()));
            let Some((id, agreed)) = head else { return };
            if !agreed {
                return;
            }
            let entry = self.deliver_queue.remove(&id).expect("head exists");
            self.deliver(entry, context, deliveries)
        }
    }

    fn deliver(&mut self, entry: PendingEntry, context: &mut Context, deliveries: &mut Vec<Delivery>) {
        match entry.payload {
            Payload::Real { inner } => deliveries.push(Delivery::Payload(inner)),
            Payload::Stop => {
                if !self.paused {
                    info!("pausing ordered multicast");
                }
                self.paused = true;
                deliveries.push(Delivery::Paused)
            }
            Payload::Resume { value } => {
                if self.paused {
                    info!("resuming ordered multicast");
                }
                self.paused = false;
                self.flush_paused(context);
                deliveries.push(Delivery::Reconciled(value))
            }
            Payload::Agreed { .. } => warn!("agreement datagram in the hold-back queue"),
        }
    }

    /// A gap: hold the datagram, replay anything already held that became
    /// contiguous, and ask the direct source for the rest.
    fn request_missing(
        &mut self,
        datagram: StampedDatagram,
        remote: SocketAddr,
        context: &mut Context,
        deliveries: &mut Vec<Delivery>,
    ) {
        let sender = datagram.sender;
        let upto = datagram.seq;
        self.holdback.insert(datagram.id, (datagram, remote));
        let mut nacks = Vec::new();
        let mut stalled = false;
        for seq in self.rnumbers[&sender] + 1..upto {
            if stalled || !self.holds(seq, sender) {
                stalled = true;
                nacks.push(seq);
            } else if let Some((held, held_remote)) = self.take_holdback(seq, sender) {
                self.process(held, held_remote, context, deliveries)
            }
        }
        if !nacks.is_empty() {
            context.unicast(
                remote,
                &Datagram::Control(ControlDatagram::Nack {
                    id: Uuid::new_v4(),
                    nacks,
                }),
            )
        }
    }

    fn holds(&self, seq: u64, sender: Uuid) -> bool {
        self.holdback
            .values()
            .any(|(held, _)| held.seq == seq && held.sender == sender)
    }

    fn take_holdback(&mut self, seq: u64, sender: Uuid) -> Option<(StampedDatagram, SocketAddr)> {
        let id = self
            .holdback
            .iter()
            .find(|(_, (held, _))| held.seq == seq && held.sender == sender)
            .map(|(id, _)| *id)?;
        self.holdback.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::message::PeerAddr;

    use super::*;

    /// One queued emission, addressed the way the sockets would see it.
    #[derive(Debug, Clone)]
    enum Hop {
        Group {
            source: SocketAddr,
            datagram: Datagram,
        },
        Direct {
            source: SocketAddr,
            target: SocketAddr,
            datagram: Datagram,
        },
    }

    /// A tiny in-memory group network: multicasts loop back to their sender
    /// like the real group socket, unicasts land on one engine.
    struct Net {
        ids: Vec<Uuid>,
        engines: Vec<(RoMulticast, Context)>,
        delivered: Vec<Vec<Delivery>>,
    }

    fn addr(i: usize) -> SocketAddr {
        format!("10.0.0.{}:5007", i + 1).parse().unwrap()
    }

    fn view_of(ids: &[Uuid]) -> GroupView {
        GroupView::from_iter(
            ids.iter()
                .enumerate()
                .map(|(i, &id)| (id, PeerAddr(addr(i).ip(), addr(i).port()))),
        )
    }

    impl Net {
        fn new(n: usize) -> Self {
            let mut ids = Vec::from_iter((0..n).map(|_| Uuid::new_v4()));
            ids.sort();
            let view = view_of(&ids);
            let engines = ids
                .iter()
                .map(|&id| {
                    let mut engine = RoMulticast::new(id);
                    let mut context = Context::recording();
                    for &other in &ids {
                        engine.register_member(other);
                    }
                    engine.set_group_view(&view, &mut context);
                    (engine, context)
                })
                .collect();
            Self {
                ids,
                engines,
                delivered: vec![Vec::new(); n],
            }
        }

        fn engine(&mut self, i: usize) -> (&mut RoMulticast, &mut Context) {
            let (engine, context) = &mut self.engines[i];
            (engine, context)
        }

        fn drain(&mut self) -> Vec<Hop> {
            let mut hops = Vec::new();
            for (i, (_, context)) in self.engines.iter_mut().enumerate() {
                for datagram in context.recorded().take_multicasts() {
                    hops.push(Hop::Group {
                        source: addr(i),
                        datagram,
                    });
                }
                for (target, datagram) in context.recorded().take_unicasts() {
                    hops.push(Hop::Direct {
                        source: addr(i),
                        target,
                        datagram,
                    });
                }
            }
            hops
        }

        fn apply(&mut self, hop: Hop) {
            match hop {
                Hop::Group { source, datagram } => {
                    for i in 0..self.engines.len() {
                        let (engine, context) = &mut self.engines[i];
                        let deliveries = engine.handle(datagram.clone(), source, context);
                        self.delivered[i].extend(deliveries);
                    }
                }
                Hop::Direct {
                    source,
                    target,
                    datagram,
                } => {
                    let Some(i) = (0..self.engines.len()).find(|&i| addr(i) == target) else {
                        return;
                    };
                    let (engine, context) = &mut self.engines[i];
                    let deliveries = engine.handle(datagram, source, context);
                    self.delivered[i].extend(deliveries);
                }
            }
        }

        fn settle(&mut self) {
            self.settle_where(|_| true)
        }

        fn settle_where(&mut self, keep: impl Fn(&Hop) -> bool) {
            loop {
                let hops = self.drain();
                if hops.is_empty() {
                    return;
                }
                for hop in hops {
                    if keep(&hop) {
                        self.apply(hop)
                    }
                }
            }
        }

        fn payloads(&self, i: usize) -> Vec<McPayload> {
            self.delivered[i]
                .iter()
                .filter_map(|delivery| match delivery {
                    Delivery::Payload(payload) => Some(*payload),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn singleton_delivers_to_itself() {
        let mut net = Net::new(1);
        let id = net.ids[0];
        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: id }, context);
        net.settle();
        assert_eq!(net.payloads(0), vec![McPayload::Lock { uuid: id }]);
    }

    #[test]
    fn concurrent_sends_deliver_in_the_same_order_everywhere() {
        let mut net = Net::new(3);
        let [a, b, c] = [net.ids[0], net.ids[1], net.ids[2]];
        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: a }, context);
        let (engine, context) = net.engine(1);
        engine.send(McPayload::Lock { uuid: b }, context);
        let (engine, context) = net.engine(2);
        engine.send(McPayload::UpdateEntries { entries: 7, uuid: c }, context);
        net.settle();

        let reference = net.payloads(0);
        assert_eq!(reference.len(), 3);
        assert_eq!(net.payloads(1), reference);
        assert_eq!(net.payloads(2), reference);
    }

    #[test]
    fn reordered_hops_still_agree() {
        let mut net = Net::new(3);
        let [a, b, _] = [net.ids[0], net.ids[1], net.ids[2]];
        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: a }, context);
        engine.send(McPayload::Unlock { uuid: a }, context);
        let (engine, context) = net.engine(1);
        engine.send(McPayload::Lock { uuid: b }, context);

        // deliver each round of emissions back to front; per-sender gaps
        // open up and have to heal through the hold-back queue and NACKs
        loop {
            let mut hops = net.drain();
            if hops.is_empty() {
                break;
            }
            hops.reverse();
            for hop in hops {
                net.apply(hop)
            }
        }

        let reference = net.payloads(0);
        assert_eq!(reference.len(), 3);
        assert_eq!(net.payloads(1), reference);
        assert_eq!(net.payloads(2), reference);
    }

    #[test]
    fn lost_datagram_recovers_through_nack() {
        let mut net = Net::new(2);
        let a = net.ids[0];
        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: a }, context);
        engine.send(McPayload::Unlock { uuid: a }, context);

        let hops = net.drain();
        assert_eq!(hops.len(), 2);
        // second send never reaches engine 1 the first time around
        for (i, hop) in hops.into_iter().enumerate() {
            match hop {
                Hop::Group { source, datagram } if i == 1 => {
                    net.apply(Hop::Direct {
                        source,
                        target: addr(0),
                        datagram,
                    });
                }
                hop => net.apply(hop),
            }
        }
        // the follow-up traffic (relay of the first message) exposes the
        // gap; engine 1 NACKs, engine 0 retransmits from `out`
        net.settle();

        assert_eq!(net.payloads(0).len(), 2);
        assert_eq!(net.payloads(1), net.payloads(0));
    }

    #[test]
    fn pause_buffers_sends_until_resume_reconciles() {
        let mut net = Net::new(2);
        let a = net.ids[0];
        let (engine, context) = net.engine(0);
        engine.pause(context);
        net.settle();
        assert!(net.delivered[0].contains(&Delivery::Paused));
        assert!(net.delivered[1].contains(&Delivery::Paused));
        assert!(net.engines[1].0.is_paused());

        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: a }, context);
        assert!(context.recorded().multicasts.is_empty());

        let (engine, context) = net.engine(0);
        engine.resume(42, context);
        net.settle();

        for i in 0..2 {
            assert!(net.delivered[i].contains(&Delivery::Reconciled(42)));
            assert_eq!(net.payloads(i), vec![McPayload::Lock { uuid: a }]);
            assert!(!net.engines[i].0.is_paused());
        }
        // the buffered payload is ordered after the resume everywhere
        let resume_at = |deliveries: &[Delivery]| {
            deliveries
                .iter()
                .position(|d| matches!(d, Delivery::Reconciled(_)))
                .unwrap()
        };
        let lock_at = |deliveries: &[Delivery]| {
            deliveries
                .iter()
                .position(|d| matches!(d, Delivery::Payload(_)))
                .unwrap()
        };
        assert!(resume_at(&net.delivered[0]) < lock_at(&net.delivered[0]));
        assert!(resume_at(&net.delivered[1]) < lock_at(&net.delivered[1]));
    }

    #[test]
    fn view_change_completes_stuck_proposal_round() {
        let mut net = Net::new(3);
        let a = net.ids[0];
        let dead = addr(2);
        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: a }, context);

        // the third engine is crashed: nothing reaches it, nothing leaves it
        net.settle_where(|hop| match hop {
            Hop::Group { source, .. } => *source != dead,
            Hop::Direct { source, target, .. } => *source != dead && *target != dead,
        });
        // agreement cannot finish, nothing was delivered
        assert_eq!(net.payloads(0), vec![]);
        assert_eq!(net.payloads(1), vec![]);

        // the failure detector removes the dead node; the proposal round
        // completes from the proposals already collected
        let survivors = view_of(&net.ids.clone()[..2]);
        let (engine, context) = net.engine(0);
        engine.set_group_view(&survivors, context);
        let (engine, context) = net.engine(1);
        engine.set_group_view(&survivors, context);
        net.settle_where(|hop| match hop {
            Hop::Group { source, .. } => *source != dead,
            Hop::Direct { source, target, .. } => *source != dead && *target != dead,
        });

        assert_eq!(net.payloads(0), vec![McPayload::Lock { uuid: a }]);
        assert_eq!(net.payloads(1), vec![McPayload::Lock { uuid: a }]);
    }

    #[test]
    fn joiner_adopts_sequencing_state() {
        let mut net = Net::new(2);
        let a = net.ids[0];
        let (engine, context) = net.engine(0);
        engine.send(McPayload::Lock { uuid: a }, context);
        net.settle();

        let (leader, _) = net.engine(0);
        let rnumbers = leader.rnumbers();
        let deliver_queue = leader.deliver_queue();
        assert!(deliver_queue.is_empty());

        let mut joiner = RoMulticast::new(Uuid::new_v4());
        joiner.sync_state(rnumbers.clone(), deliver_queue);
        for id in rnumbers.keys() {
            assert!(joiner.rnumbers().contains_key(id));
        }
    }
}
