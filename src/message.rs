//! Wire types. Every payload is a flat UTF-8 JSON object: application
//! messages carry an `"intention"` tag, reliable-multicast datagrams carry a
//! `"purpose"` tag, and a RO-wrapped application message carries both at the
//! same level.

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Advertised endpoint of a node, serialized as `[address, port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr(pub IpAddr, pub u16);

impl PeerAddr {
    pub fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.0, self.1)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.ip(), addr.port())
    }
}

/// The authoritative membership map. Keys sort ascending; the ring and the
/// leader are derived from the descending order.
pub type GroupView = BTreeMap<Uuid, PeerAddr>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intention", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    IdentServer {
        uuid: Uuid,
        address: IpAddr,
        port: u16,
    },
    IdentClient {
        uuid: Uuid,
        address: IpAddr,
        port: u16,
    },
    ShutdownServer {
        uuid: Uuid,
    },
    ShutdownSystem,
    MonitorMessage(MonitorUpdate),
    RunByz,
    AcceptServer {
        leader: Uuid,
        group_view: GroupView,
        rnumbers: HashMap<Uuid, u64>,
        deliver_queue: HashMap<Uuid, PendingEntry>,
        entries: u64,
    },
    TryAgain,
    UpdateGroupView {
        group_view: GroupView,
    },
    ElectionMessage {
        mid: Uuid,
        is_leader: bool,
    },
    Heartbeat {
        uuid: Uuid,
        address: IpAddr,
        port: u16,
    },
    ChooseServer {
        uuid: Uuid,
        address: IpAddr,
        port: u16,
    },
    ShutdownClient {
        uuid: Uuid,
    },
    RequestAction {
        uuid: Uuid,
        address: IpAddr,
        port: u16,
        number: u32,
        increase: bool,
    },
    AcceptClient {
        entries: u64,
    },
    AcceptEntry,
    DenyEntry,
    UpdateEntries {
        entries: u64,
    },
    Om(OmMessage),
    OmRestart {
        id: Uuid,
    },
    NotLeader,
    Ping,
    ManualValueOverride {
        value: u64,
    },
}

/// Observability snapshot. Fields are optional so the same intention covers
/// per-node state updates, the leader's group-view notices and departure
/// notices; the monitor keys off whichever fields are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorUpdate {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byzantine: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_view: Option<GroupView>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub leaving: bool,
}

/// One round-trip unit of the oral-messages protocol. The recursive step and
/// the member's final report share the `OM` intention and are told apart by
/// their field sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmMessage {
    pub id: Uuid,
    #[serde(flatten)]
    pub body: OmBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OmBody {
    Step(OmStep),
    Result(OmResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmStep {
    pub v: u64,
    pub dests: Vec<Uuid>,
    pub list: Vec<Uuid>,
    pub faulty: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OmResult {
    pub from: Uuid,
    pub result: u64,
}

/// Outer frame of every broadcast datagram; `msg_uuid` feeds the receiver's
/// bounded dedup window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub msg_uuid: Uuid,
    #[serde(flatten)]
    pub message: Message,
}

impl BroadcastFrame {
    pub fn new(message: Message) -> Self {
        Self {
            msg_uuid: Uuid::new_v4(),
            message,
        }
    }
}

/// Application messages carried through the totally-ordered layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intention", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum McPayload {
    Lock { uuid: Uuid },
    Unlock { uuid: Uuid },
    UpdateEntries { entries: u64, uuid: Uuid },
}

/// Anything that can arrive on the multicast sockets. Stamped datagrams
/// travel through the reliable layer (per-sender sequence numbers, flooding,
/// NACK recovery); control datagrams are raw unicast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datagram {
    Stamped(StampedDatagram),
    Control(ControlDatagram),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedDatagram {
    pub id: Uuid,
    pub sender: Uuid,
    #[serde(rename = "S")]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Uuid>,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose")]
pub enum Payload {
    #[serde(rename = "REAL_MSG")]
    Real {
        #[serde(flatten)]
        inner: McPayload,
    },
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "RESUME")]
    Resume { value: u64 },
    #[serde(rename = "FIN_SEQ")]
    Agreed { mesg_id: Uuid, a: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose")]
pub enum ControlDatagram {
    #[serde(rename = "PROP_SEQ")]
    Proposal {
        id: Uuid,
        mesg_id: Uuid,
        pq: u64,
        sender: Uuid,
    },
    #[serde(rename = "NACK")]
    Nack { id: Uuid, nacks: Vec<u64> },
}

/// A message waiting in the ordering hold-back queue: proposed locally,
/// agreement not yet final. Shipped to joiners inside `ACCEPT_SERVER`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Uuid>,
    pub pq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreed: Option<u64>,
}
