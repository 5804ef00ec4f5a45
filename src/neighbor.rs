//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The per-neighbor BGP session engine (§4.C8, the core's second anchor
//! after the message codec). [`Peer`] owns everything specific to one
//! neighbor: its FSM state, its connection(s), its negotiated session
//! parameters and its Adj-RIB-Out (§3 "Peer" — "Peers own their Adj-RIB-Out
//! and their connections exclusively").
//!
//! Per the Design Notes ("From generator-based pseudo-async to a
//! cooperative tick"), every method here is synchronous and I/O-free: it
//! transforms `Peer` state and returns the wire bytes/events the caller
//! (the reactor) must act on. The only async I/O performed on a `Peer`'s
//! behalf — reading/writing its [`Connection`] — is driven from outside by
//! [`crate::reactor`], one non-blocking attempt per tick.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::{Neighbor, PeerAs};
use crate::debug::Debug;
use crate::network::{ConnDirection, Connection, RecvError};
use crate::packet::attribute::{AttributeCollection, DecodeCxt, EncodeCxt};
use crate::packet::cache::AttributeCache;
use crate::packet::capability::{AddPathTuple, Capability, Negotiated};
use crate::packet::consts::{
    AS_TRANS, AddPathMode, CeaseSubcode, ErrorCode, FsmErrorSubcode, OpenMessageErrorSubcode,
};
use crate::packet::error::{DecodeError, MessageHeaderError, OpenMessageError};
use crate::packet::message::{
    KeepaliveMsg, Message, NotificationMsg, OpenMsg, RouteRefreshMsg, UpdateMsg,
};
use crate::packet::nlri::{Family, Nlri};
use crate::rib::{Change, PeerRib};

/// Large hold-time used while negotiating, before the real value is known
/// (RFC 4271 §8 note on `Idle`/`Connect` defaults).
const LARGE_HOLDTIME_SECS: u64 = 240;
/// Floor under which a non-zero negotiated hold-time is rejected (§4.C5
/// "Hold-time").
const MIN_HOLDTIME: u16 = 3;
/// Cap on `ConnectRetryTimer` backoff (§4.C8 "Timers").
const CONNECT_RETRY_MAX_SECS: u64 = 300;

/// Lower bound of the jitter range RFC 4271 §10 requires applied to the
/// KeepaliveTimer and ConnectRetryTimer so that peers sharing a restart
/// event don't all fire in lockstep.
const JITTER_MIN_FACTOR: f64 = 0.75;

/// Scales `interval` by a value drawn uniformly from
/// `[JITTER_MIN_FACTOR, 1.0)` (RFC 4271 §10).
fn jittered(interval: Duration) -> Duration {
    let factor = rand::rng().random_range(JITTER_MIN_FACTOR..1.0);
    interval.mul_f64(factor)
}

// ===== Finite State Machine =====

pub mod fsm {
    use serde::{Deserialize, Serialize};

    /// RFC 4271 §8 states (§4.C8).
    #[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    pub enum State {
        Idle,
        Connect,
        Active,
        OpenSent,
        OpenConfirm,
        Established,
    }

    /// The internal event categories of §4.C8, collapsed onto what a
    /// synchronous `Peer` method needs to see; timer identity is kept
    /// distinct so the reactor can report which timer fired without the FSM
    /// itself owning a task handle.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    pub enum Timer {
        ConnectRetry,
        Hold,
        Keepalive,
    }
}

/// Reason this session went back to `Idle`, used to decide whether a
/// reconnect should be scheduled (§4.C8 "Every reset schedules a reconnect
/// with backoff unless ManualStop was the cause").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    Manual,
    HoldExpired,
    NotificationReceived,
    NotificationSent,
    CollisionLost,
    TcpClosed,
    DecodeError,
}

/// Events surfaced to the API plane's event emission (§6.4).
#[derive(Debug)]
pub enum SessionEvent {
    StateChange { old: fsm::State, new: fsm::State },
    OpenReceived(OpenMsg),
    UpdateReceived { withdrawn: Vec<Nlri>, announced: Vec<(Nlri, AttributeCollection, Option<IpAddr>)> },
    NotificationReceived(NotificationMsg),
    NotificationSent(NotificationMsg),
    KeepaliveReceived,
    Eor(Family),
}

/// Inbound/outbound message counters (§6.4, `show neighbor`).
#[derive(Debug, Default)]
pub struct PeerStats {
    pub established_transitions: u32,
    pub msgs_sent: u64,
    pub msgs_rcvd: u64,
    pub updates_sent: u64,
    pub updates_rcvd: u64,
    pub erroneous_updates_withdrawn: u32,
}

/// One side of a (possibly colliding) connection pair, paired with the
/// direction it was established in (§4.C8 "Collision detection").
struct Slot {
    conn: Connection,
    direction: ConnDirection,
}

/// Runtime per-neighbor object (§3 "Peer"). Lifecycle: created when a
/// [`Neighbor`] is added, destroyed when removed; enable/disable is an FSM
/// event, not object recreation.
pub struct Peer {
    pub addr: IpAddr,
    pub config: Neighbor,
    pub state: fsm::State,
    slot: Option<Slot>,
    /// A second connection accepted while `slot` is still mid-negotiation;
    /// resolved as soon as an OPEN is read from it (§4.C8, §6.8).
    pending: Option<Slot>,
    pub identifier: Option<Ipv4Addr>,
    pub capabilities_adv: Vec<Capability>,
    pub capabilities_rcvd: Vec<Capability>,
    pub negotiated: Option<Negotiated>,
    pub rib: PeerRib,
    pub stats: PeerStats,
    pub notification_sent: Option<NotificationMsg>,
    pub notification_rcvd: Option<NotificationMsg>,
    pub last_established: Option<DateTime<Utc>>,
    connect_retry_deadline: Option<Instant>,
    connect_retry_backoff: Duration,
    hold_deadline: Option<Instant>,
    keepalive_deadline: Option<Instant>,
    /// Families still owed their first post-establishment EOR (§4.C7 "An
    /// EOR marker is emitted by the FSM ... when `pending` has been fully
    /// drained for the first time per family").
    eor_owed: BTreeSet<Family>,
    /// Set once we have actively attempted an outbound connection for the
    /// current `Connect`/`Active` cycle, so the reactor knows to try.
    pub wants_outbound_connect: bool,
}

/// Result of a collision between two connections for the same peer
/// (§4.C8/§6.8): which direction survives. Kept as a free function so it is
/// testable without a real socket.
pub fn collision_keep_active(local_id: Ipv4Addr, peer_id: Ipv4Addr) -> bool {
    local_id > peer_id
}

impl Peer {
    pub fn new(addr: IpAddr, config: Neighbor) -> Peer {
        Peer {
            addr,
            config,
            state: fsm::State::Idle,
            slot: None,
            pending: None,
            identifier: None,
            capabilities_adv: Vec::new(),
            capabilities_rcvd: Vec::new(),
            negotiated: None,
            rib: PeerRib::new(),
            stats: PeerStats::default(),
            notification_sent: None,
            notification_rcvd: None,
            last_established: None,
            connect_retry_deadline: None,
            connect_retry_backoff: Duration::from_secs(config_retry_secs(&config)),
            hold_deadline: None,
            keepalive_deadline: None,
            eor_owed: BTreeSet::new(),
            wants_outbound_connect: false,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == fsm::State::Established
    }

    // ===== Manual start/stop (§4.C8 transition table) =====

    /// `ManualStart`: `Idle -> Connect` (or `Active` for a passive-only
    /// neighbor, which only ever accepts incoming connections).
    pub fn manual_start(&mut self, now: Instant) {
        if self.state != fsm::State::Idle {
            return;
        }
        self.transition(if self.config.passive { fsm::State::Active } else { fsm::State::Connect });
        self.wants_outbound_connect = !self.config.passive;
        self.arm_connect_retry(now);
    }

    /// `ManualStop`: send a NOTIFICATION (Cease, optionally carrying an RFC
    /// 8203 shutdown communication) and drop to `Idle` from any state.
    pub fn manual_stop(&mut self, message: Option<&str>) -> Option<Message> {
        let notif = message
            .map(|m| NotificationMsg::shutdown_communication(CeaseSubcode::AdministrativeShutdown, m))
            .unwrap_or_else(|| NotificationMsg::new(ErrorCode::Cease, CeaseSubcode::AdministrativeShutdown as u8));
        let out = self.close_with_notification(notif.clone(), StopReason::Manual);
        self.wants_outbound_connect = false;
        out
    }

    // ===== Connection establishment =====

    /// `TcpConnectionFails` while `Connect`: back off and retry from
    /// `Active` (actually re-attempted from `Connect` here since this core
    /// has no genuinely passive-only posture beyond `config.passive`).
    pub fn connect_failed(&mut self, now: Instant) {
        self.wants_outbound_connect = !self.config.passive;
        self.transition(if self.config.passive { fsm::State::Active } else { fsm::State::Connect });
        self.bump_connect_retry_backoff();
        self.arm_connect_retry(now);
    }

    /// `TcpConnection Succeeds` while `Connect`, or `TcpConnectionConfirmed`
    /// while `Active`: send our OPEN and move to `OpenSent`.
    pub fn connection_established(
        &mut self,
        conn: Connection,
        direction: ConnDirection,
        local_id: Ipv4Addr,
        local_as: u32,
    ) -> Vec<Message> {
        if self.slot.is_some() {
            return self.accept_secondary(conn, direction);
        }
        self.wants_outbound_connect = false;
        self.connect_retry_deadline = None;
        let open = self.build_open(local_id, local_as);
        let caps = open.capabilities.clone();
        self.capabilities_adv = caps;
        self.slot = Some(Slot { conn, direction });
        self.transition(fsm::State::OpenSent);
        self.hold_deadline = Some(Instant::now() + Duration::from_secs(LARGE_HOLDTIME_SECS));
        vec![Message::Open(open)]
    }

    /// A second connection arrived for a peer that already has one
    /// mid-negotiation: stash it; resolution happens once its OPEN is read
    /// (§4.C8 "Collision detection").
    fn accept_secondary(&mut self, mut conn: Connection, direction: ConnDirection) -> Vec<Message> {
        if self.pending.is_some() {
            // A third connection: we already have a collision pair pending
            // resolution, reject this one outright.
            let notif = NotificationMsg::new(ErrorCode::Cease, CeaseSubcode::ConnectionRejected as u8);
            conn.queue(&Message::Notification(notif), EncodeCxt { four_octet_asn: true });
            let _ = conn.try_flush();
            return Vec::new();
        }
        self.pending = Some(Slot { conn, direction });
        Vec::new()
    }

    fn build_open(&self, local_id: Ipv4Addr, local_as: u32) -> OpenMsg {
        let caps = &self.config.capabilities;
        let mut capabilities = Vec::new();
        let my_as = if local_as > u32::from(u16::MAX) { AS_TRANS } else { local_as as u16 };
        if caps.four_octet_asn {
            capabilities.push(Capability::FourOctetAsNumber { asn: local_as });
        }
        for family in &caps.families {
            capabilities.push(Capability::MultiProtocol { afi: family.0, safi: family.1 });
        }
        if caps.route_refresh {
            capabilities.push(Capability::RouteRefresh);
        }
        if caps.enhanced_route_refresh {
            capabilities.push(Capability::EnhancedRouteRefresh);
        }
        if caps.extended_message {
            capabilities.push(Capability::ExtendedMessage);
        }
        if !caps.add_path.is_empty() {
            let tuples = caps
                .add_path
                .iter()
                .map(|(family, dir)| AddPathTuple {
                    afi: family.0,
                    safi: family.1,
                    mode: match dir {
                        crate::config::AddPathDirection::Receive => AddPathMode::Receive,
                        crate::config::AddPathDirection::Send => AddPathMode::Send,
                        crate::config::AddPathDirection::ReceiveSend => AddPathMode::ReceiveSend,
                    },
                })
                .collect();
            capabilities.push(Capability::AddPath(tuples));
        }
        if let Some((hostname, domain)) = caps.hostname.clone() {
            capabilities.push(Capability::Hostname { hostname, domain });
        }
        if let Some(version) = caps.software_version.clone() {
            capabilities.push(Capability::SoftwareVersion(version));
        }
        OpenMsg::new(my_as, self.config.hold_time, local_id, capabilities)
    }

    // ===== Inbound message handling =====

    /// Reads and processes every frame currently buffered on this peer's
    /// active connection(s), returning the bytes to write back and the
    /// events to surface to the API plane. `budget` caps the number of
    /// messages processed this call (§4.C9 "Rate limiting"); any remainder
    /// stays buffered for the next tick.
    pub fn poll_io(
        &mut self,
        local_id: Ipv4Addr,
        local_as: u32,
        cache: &mut AttributeCache,
        budget: Option<usize>,
    ) -> PollOutcome {
        let mut out = PollOutcome::default();
        let max_size = self.negotiated.as_ref().map(|n| n.max_message_size).unwrap_or(4096);
        let dcxt = self.decode_cxt(local_as);

        if let Some(pending) = &mut self.pending {
            match pending.conn.try_recv(max_size, &dcxt, cache) {
                Ok(messages) => {
                    for msg in messages {
                        if let Message::Open(open) = msg {
                            let mut outcome = self.resolve_collision(open, local_id, local_as);
                            out.to_send.append(&mut outcome.to_send);
                            out.events.append(&mut outcome.events);
                            if let Some((reason, notif)) = outcome.close {
                                if let Some(notif) = notif {
                                    out.to_send.push(Message::Notification(notif.clone()));
                                    out.events.push(SessionEvent::NotificationSent(notif.clone()));
                                    self.notification_sent = Some(notif);
                                }
                                out.close = Some(reason);
                                return out;
                            }
                            break;
                        }
                    }
                }
                Err(RecvError::Closed) | Err(RecvError::Io(_)) => {
                    self.pending = None;
                }
                Err(RecvError::Decode(_)) => {
                    self.pending = None;
                }
            }
        }

        let Some(slot) = &mut self.slot else { return out };
        let messages = match slot.conn.try_recv(max_size, &dcxt, cache) {
            Ok(messages) => messages,
            Err(RecvError::Closed) => {
                out.close = Some(StopReason::TcpClosed);
                return out;
            }
            Err(RecvError::Io(_)) => {
                out.close = Some(StopReason::TcpClosed);
                return out;
            }
            Err(RecvError::Decode(error)) => {
                let notif: NotificationMsg = error.into();
                out.to_send.push(Message::Notification(notif.clone()));
                out.events.push(SessionEvent::NotificationSent(notif.clone()));
                self.notification_sent = Some(notif);
                out.close = Some(StopReason::DecodeError);
                return out;
            }
        };

        for (count, msg) in messages.into_iter().enumerate() {
            if let Some(budget) = budget {
                if count >= budget {
                    break;
                }
            }
            self.stats.msgs_rcvd += 1;
            Debug::NbrMsgRx(&self.addr, &msg).log();
            self.reset_hold_timer(&msg);
            let mut outcome = self.handle_message(msg, local_id);
            out.to_send.append(&mut outcome.to_send);
            out.events.append(&mut outcome.events);
            if let Some((reason, notif)) = outcome.close {
                if let Some(notif) = notif {
                    out.to_send.push(Message::Notification(notif.clone()));
                    out.events.push(SessionEvent::NotificationSent(notif.clone()));
                    self.notification_sent = Some(notif);
                }
                out.close = Some(reason);
                return out;
            }
        }
        out
    }

    fn decode_cxt(&self, local_as: u32) -> DecodeCxt {
        let add_path_families: BTreeSet<Family> = self
            .negotiated
            .as_ref()
            .map(|n| {
                n.add_path
                    .iter()
                    .filter(|(_, mode)| matches!(mode, AddPathMode::Receive | AddPathMode::ReceiveSend))
                    .map(|(family, _)| *family)
                    .collect()
            })
            .unwrap_or_default();
        DecodeCxt {
            four_octet_asn: self.negotiated.as_ref().map(|n| n.four_octet_asn).unwrap_or(false),
            peer_as: self.peer_as_hint(local_as),
            is_external: self.is_external(local_as),
            add_path_families,
        }
    }

    fn peer_as_hint(&self, _local_as: u32) -> u32 {
        match self.config.peer_as {
            PeerAs::Fixed(asn) => asn,
            _ => self.negotiated.as_ref().map(|n| n.remote_asn).unwrap_or(0),
        }
    }

    fn is_external(&self, local_as: u32) -> bool {
        matches!(self.config.peer_type(local_as), crate::config::PeerType::External)
    }

    /// Resolves a collision once the pending connection's OPEN is known
    /// (§4.C8, §6.8): higher BGP identifier keeps the connection it
    /// initiated; the loser is closed with NOTIFICATION(6,7). If the
    /// incoming connection wins, it never had our OPEN sent on it (it was
    /// stashed raw by `accept_secondary`), so this sends it now and feeds
    /// the OPEN already read through the normal handshake path rather than
    /// parking in `OpenSent` waiting for a message that already arrived.
    fn resolve_collision(&mut self, pending_open: OpenMsg, local_id: Ipv4Addr, local_as: u32) -> MessageOutcome {
        let Some(pending) = self.pending.take() else { return MessageOutcome::default() };
        let keep_incoming = match &self.slot {
            None => true,
            Some(slot) => {
                let peer_id = pending_open.identifier;
                let keep_active = collision_keep_active(local_id, peer_id);
                let primary_is_active = slot.direction == ConnDirection::Active;
                primary_is_active != keep_active
            }
        };
        Debug::NbrCollision(&self.addr, if keep_incoming { "kept incoming" } else { "kept existing" }).log();
        if !keep_incoming {
            let mut loser = pending;
            let notif =
                NotificationMsg::new(ErrorCode::Cease, CeaseSubcode::ConnectionCollisionResolution as u8);
            loser.conn.queue(&Message::Notification(notif), EncodeCxt { four_octet_asn: true });
            let _ = loser.conn.try_flush();
            return MessageOutcome::default();
        }
        if let Some(mut loser) = self.slot.take() {
            let notif =
                NotificationMsg::new(ErrorCode::Cease, CeaseSubcode::ConnectionCollisionResolution as u8);
            loser.conn.queue(&Message::Notification(notif), EncodeCxt { four_octet_asn: true });
            let _ = loser.conn.try_flush();
        }
        self.slot = Some(pending);
        self.transition(fsm::State::OpenSent);
        let open = self.build_open(local_id, local_as);
        self.capabilities_adv = open.capabilities.clone();
        let mut out = MessageOutcome::default().sending(Message::Open(open));
        let opened = self.on_open(pending_open, local_id);
        out.to_send.extend(opened.to_send);
        out.events.extend(opened.events);
        out.close = opened.close;
        out
    }

    fn handle_message(&mut self, msg: Message, local_id: Ipv4Addr) -> MessageOutcome {
        match (self.state, msg) {
            (fsm::State::OpenSent, Message::Open(open)) => self.on_open(open, local_id),
            (fsm::State::OpenConfirm, Message::Keepalive(_)) => self.on_keepalive_confirm(),
            (fsm::State::Established, Message::Keepalive(_)) => {
                MessageOutcome::events(vec![SessionEvent::KeepaliveReceived])
            }
            (fsm::State::Established, Message::Update(update)) => self.on_update(update),
            (fsm::State::Established, Message::RouteRefresh(rr)) => self.on_route_refresh(rr),
            (_, Message::Notification(notif)) => {
                self.notification_rcvd = Some(notif.clone());
                MessageOutcome::events(vec![SessionEvent::NotificationReceived(notif)])
                    .closing(StopReason::NotificationReceived, None)
            }
            (state, _) => {
                let subcode = match state {
                    fsm::State::OpenSent | fsm::State::OpenConfirm => {
                        FsmErrorSubcode::UnexpectedMessageInOpenConfirm
                    }
                    _ => FsmErrorSubcode::UnexpectedMessageInEstablished,
                };
                let notif = NotificationMsg::new(ErrorCode::FiniteStateMachineError, subcode as u8);
                MessageOutcome::default().closing(StopReason::DecodeError, Some(notif))
            }
        }
    }

    fn on_open(&mut self, open: OpenMsg, local_id: Ipv4Addr) -> MessageOutcome {
        if let Err(notif) = self.validate_open(&open, local_id) {
            return MessageOutcome::default().closing(StopReason::DecodeError, Some(notif));
        }
        self.identifier = Some(open.identifier);
        self.capabilities_rcvd = open.capabilities.clone();
        let negotiated = Negotiated::compute(
            &self.capabilities_adv,
            &self.capabilities_rcvd,
            self.config.hold_time,
            open.holdtime,
        );
        if negotiated.holdtime != 0 && negotiated.holdtime < MIN_HOLDTIME {
            let notif = NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::UnacceptableHoldTime as u8,
            );
            return MessageOutcome::default().closing(StopReason::DecodeError, Some(notif));
        }
        self.eor_owed = negotiated.families.clone();
        self.negotiated = Some(negotiated);
        self.transition(fsm::State::OpenConfirm);
        self.arm_session_timers();
        MessageOutcome::events(vec![SessionEvent::OpenReceived(open)])
            .sending(Message::Keepalive(KeepaliveMsg::new()))
    }

    /// RFC 4271 §6.2 OPEN validation: version, peer AS, BGP identifier.
    fn validate_open(&self, open: &OpenMsg, local_id: Ipv4Addr) -> Result<(), NotificationMsg> {
        if open.version != crate::packet::consts::BGP_VERSION {
            return Err(NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::UnsupportedVersionNumber as u8,
            ));
        }
        let remote_as = open
            .capabilities
            .iter()
            .find_map(|cap| match cap {
                Capability::FourOctetAsNumber { asn } => Some(*asn),
                _ => None,
            })
            .unwrap_or(u32::from(open.my_as));
        if !self.config.peer_as.accepts(remote_as) {
            return Err(NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadPeerAs as u8,
            ));
        }
        if open.identifier == Ipv4Addr::UNSPECIFIED || open.identifier == local_id {
            return Err(NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadBgpIdentifier as u8,
            ));
        }
        Ok(())
    }

    fn on_keepalive_confirm(&mut self) -> MessageOutcome {
        self.transition(fsm::State::Established);
        self.stats.established_transitions += 1;
        self.last_established = Some(Utc::now());
        MessageOutcome::events(vec![SessionEvent::KeepaliveReceived])
    }

    fn on_update(&mut self, update: UpdateMsg) -> MessageOutcome {
        self.stats.updates_rcvd += 1;
        if let Some(eor_family) = update.eor_family() {
            return MessageOutcome::events(vec![SessionEvent::Eor(eor_family)]);
        }

        let mut withdrawn = update.withdrawn.clone();
        let mut announced = Vec::new();

        if update.treat_as_withdraw {
            self.stats.erroneous_updates_withdrawn += 1;
            withdrawn.extend(update.nlri.iter().cloned());
            if let Some(mp) = update.attrs.mp_reach() {
                withdrawn.extend(mp.nlri.iter().cloned());
            }
        } else {
            let next_hop = update.attrs.next_hop();
            for nlri in &update.nlri {
                announced.push((nlri.clone(), update.attrs.clone(), next_hop));
            }
            if let Some(mp) = update.attrs.mp_reach() {
                let next_hop = mp_next_hop(&mp.nexthop);
                for nlri in &mp.nlri {
                    announced.push((nlri.clone(), update.attrs.clone(), next_hop));
                }
            }
            if let Some(mp) = update.attrs.mp_unreach() {
                withdrawn.extend(mp.nlri.iter().cloned());
            }
        }

        MessageOutcome::events(vec![SessionEvent::UpdateReceived { withdrawn, announced }])
    }

    fn on_route_refresh(&mut self, rr: RouteRefreshMsg) -> MessageOutcome {
        if let Some(family) = rr.family() {
            self.rib.table(family).resend();
        }
        MessageOutcome::default()
    }

    // ===== Timers =====

    fn reset_hold_timer(&mut self, msg: &Message) {
        if matches!(msg, Message::Notification(_)) {
            return;
        }
        if let Some(negotiated) = &self.negotiated {
            if negotiated.holdtime != 0 {
                self.hold_deadline = Some(Instant::now() + Duration::from_secs(negotiated.holdtime.into()));
            }
        } else {
            self.hold_deadline = Some(Instant::now() + Duration::from_secs(LARGE_HOLDTIME_SECS));
        }
    }

    fn arm_session_timers(&mut self) {
        let hold = self.negotiated.as_ref().map(|n| n.holdtime).unwrap_or(self.config.hold_time);
        if hold == 0 {
            self.hold_deadline = None;
            self.keepalive_deadline = None;
        } else {
            self.hold_deadline = Some(Instant::now() + Duration::from_secs(hold.into()));
            let base = Duration::from_secs(u64::from(hold) / 3);
            self.keepalive_deadline = Some(Instant::now() + jittered(base));
        }
    }

    fn arm_connect_retry(&mut self, now: Instant) {
        self.connect_retry_deadline = Some(now + jittered(self.connect_retry_backoff));
    }

    fn bump_connect_retry_backoff(&mut self) {
        let doubled = self.connect_retry_backoff.saturating_mul(2);
        self.connect_retry_backoff = doubled.min(Duration::from_secs(CONNECT_RETRY_MAX_SECS));
    }

    /// Checks the three per-peer timers against `now`, returning the
    /// messages to write and whether the session should close (§4.C8
    /// "Timers"). A fired `ConnectRetryTimer` sets
    /// [`Peer::wants_outbound_connect`] for the reactor to act on.
    pub fn poll_timers(&mut self, now: Instant) -> PollOutcome {
        let mut out = PollOutcome::default();

        if let Some(deadline) = self.hold_deadline {
            if now >= deadline && self.state != fsm::State::Idle {
                let notif = NotificationMsg::new(ErrorCode::HoldTimerExpired, 0);
                out.to_send.push(Message::Notification(notif.clone()));
                out.events.push(SessionEvent::NotificationSent(notif.clone()));
                self.notification_sent = Some(notif);
                out.close = Some(StopReason::HoldExpired);
                return out;
            }
        }

        if self.state == fsm::State::Established {
            if let Some(deadline) = self.keepalive_deadline {
                if now >= deadline {
                    out.to_send.push(Message::Keepalive(KeepaliveMsg::new()));
                    let hold = self.negotiated.as_ref().map(|n| n.holdtime).unwrap_or(self.config.hold_time);
                    self.keepalive_deadline = Some(now + jittered(Duration::from_secs(u64::from(hold) / 3)));
                }
            }
        }

        if let Some(deadline) = self.connect_retry_deadline {
            if now >= deadline
                && matches!(self.state, fsm::State::Connect | fsm::State::Active)
                && self.slot.is_none()
            {
                self.wants_outbound_connect = !self.config.passive;
                self.arm_connect_retry(now);
            }
        }

        out
    }

    /// Earliest of this peer's pending `hold`/`keepalive`/`connect-retry`
    /// deadlines, if any are armed (§4.C9 "Scheduling contract" step (5)).
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.hold_deadline, self.keepalive_deadline, self.connect_retry_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    // ===== Adj-RIB-Out draining =====

    /// Drains this peer's Adj-RIB-Out across every negotiated family and
    /// queues the resulting UPDATEs on the wire, emitting any first-time
    /// EOR owed per family (§4.C7, §8 scenario 5). Returns the events to
    /// surface (EOR notices) plus whether anything was written.
    pub fn drain_ribs(&mut self, limit: usize) -> Vec<Message> {
        let Some(slot) = &mut self.slot else { return Vec::new() };
        let Some(negotiated) = &self.negotiated else { return Vec::new() };
        if self.state != fsm::State::Established {
            return Vec::new();
        }
        let cxt = EncodeCxt { four_octet_asn: negotiated.four_octet_asn };
        let group_updates = self.config.group_updates;
        let mut messages = Vec::new();
        let families: Vec<Family> = self.rib.families().copied().collect();
        for family in families {
            let table = self.rib.table(family);
            let was_pending_empty = table.is_pending_empty();
            let batch = table.drain(limit, group_updates, cxt);
            if !batch.is_empty() {
                table.commit(&batch);
                messages.extend(batch.messages);
            }
            if !was_pending_empty && table.is_pending_empty() && self.eor_owed.remove(&family) {
                messages.push(crate::rib::eor_message(family));
            }
        }
        for msg in &messages {
            self.stats.msgs_sent += 1;
            if matches!(msg, Message::Update(_)) {
                self.stats.updates_sent += 1;
            }
            slot.conn.queue(msg, cxt);
            Debug::NbrMsgTx(&self.addr, msg).log();
        }
        messages
    }

    /// Queues already-built messages (OPEN, KEEPALIVE, NOTIFICATION) onto
    /// the active connection and flushes as much as the socket accepts.
    pub fn send_and_flush(&mut self, messages: &[Message]) -> Result<(), crate::error::IoError> {
        let Some(slot) = &mut self.slot else { return Ok(()) };
        let cxt = EncodeCxt {
            four_octet_asn: self.negotiated.as_ref().map(|n| n.four_octet_asn).unwrap_or(false),
        };
        for msg in messages {
            self.stats.msgs_sent += 1;
            slot.conn.queue(msg, cxt);
            Debug::NbrMsgTx(&self.addr, msg).log();
        }
        slot.conn.try_flush()?;
        Ok(())
    }

    pub fn ring_len(&self) -> usize {
        self.slot.as_ref().map(|s| s.conn.ring_len()).unwrap_or(0)
    }

    /// Flushes whatever is already queued on the active connection (e.g. by
    /// [`Peer::drain_ribs`]) without queuing anything new.
    pub fn flush(&mut self) -> Result<bool, crate::error::IoError> {
        match &mut self.slot {
            Some(slot) => slot.conn.try_flush(),
            None => Ok(true),
        }
    }

    fn close_with_notification(&mut self, notif: NotificationMsg, reason: StopReason) -> Option<Message> {
        self.notification_sent = Some(notif.clone());
        if let Some(slot) = &mut self.slot {
            let cxt = EncodeCxt {
                four_octet_asn: self.negotiated.as_ref().map(|n| n.four_octet_asn).unwrap_or(false),
            };
            slot.conn.queue(&Message::Notification(notif.clone()), cxt);
            let _ = slot.conn.try_flush();
        }
        self.teardown(reason);
        Some(Message::Notification(notif))
    }

    /// Tears this session down to `Idle`, dropping its connection(s) and
    /// clearing negotiated state; a reconnect is armed unless `reason` is
    /// `Manual` (§4.C8).
    pub fn teardown(&mut self, reason: StopReason) {
        self.slot = None;
        self.pending = None;
        self.negotiated = None;
        self.capabilities_rcvd.clear();
        self.hold_deadline = None;
        self.keepalive_deadline = None;
        self.eor_owed.clear();
        self.transition(fsm::State::Idle);
        if reason != StopReason::Manual {
            self.wants_outbound_connect = !self.config.passive;
            self.arm_connect_retry(Instant::now());
        } else {
            self.wants_outbound_connect = false;
            self.connect_retry_deadline = None;
        }
    }

    fn transition(&mut self, new_state: fsm::State) {
        if self.state == new_state {
            return;
        }
        let old = self.state;
        self.state = new_state;
        Debug::NbrFsmTransition(&self.addr, &old, &new_state).log();
    }

    // ===== Adj-RIB-Out API surface =====

    pub fn enqueue_change(&mut self, change: Change) -> bool {
        let family = change.nlri.family();
        if self.negotiated.as_ref().map(|n| n.families.contains(&family)).unwrap_or(false) {
            self.rib.table(family).enqueue(change);
            true
        } else {
            false
        }
    }
}

fn mp_next_hop(raw: &bytes::Bytes) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(raw);
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 | 32 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn config_retry_secs(config: &Neighbor) -> u64 {
    if config.connect_retry_interval == 0 { 120 } else { config.connect_retry_interval.into() }
}

/// Outcome of processing inbound wire messages or timers for one `Peer`
/// (§4.C9 "Scheduling contract").
#[derive(Default)]
pub struct PollOutcome {
    pub to_send: Vec<Message>,
    pub events: Vec<SessionEvent>,
    pub close: Option<StopReason>,
}

/// Result of handling a single inbound message: wire bytes to queue, events
/// to surface, and whether the session should close.
#[derive(Default)]
struct MessageOutcome {
    to_send: Vec<Message>,
    events: Vec<SessionEvent>,
    close: Option<(StopReason, Option<NotificationMsg>)>,
}

impl MessageOutcome {
    fn events(events: Vec<SessionEvent>) -> MessageOutcome {
        MessageOutcome { events, ..MessageOutcome::default() }
    }

    fn sending(mut self, msg: Message) -> MessageOutcome {
        self.to_send.push(msg);
        self
    }

    fn closing(mut self, reason: StopReason, notif: Option<NotificationMsg>) -> MessageOutcome {
        self.close = Some((reason, notif));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_stays_within_rfc4271_bounds() {
        let base = Duration::from_secs(30);
        for _ in 0..200 {
            let got = jittered(base);
            assert!(got >= base.mul_f64(JITTER_MIN_FACTOR));
            assert!(got < base);
        }
    }

    #[test]
    fn collision_resolution_keeps_higher_local_id() {
        let local = Ipv4Addr::new(2, 2, 2, 2);
        let peer = Ipv4Addr::new(1, 1, 1, 1);
        assert!(collision_keep_active(local, peer));
        assert!(!collision_keep_active(peer, local));
    }

    #[test]
    fn next_deadline_is_none_when_idle() {
        let config = test_neighbor(false);
        let peer = Peer::new("192.0.2.1".parse().unwrap(), config);
        assert_eq!(peer.next_deadline(), None);
    }

    #[test]
    fn next_deadline_is_the_earliest_armed_timer() {
        let config = test_neighbor(false);
        let mut peer = Peer::new("192.0.2.1".parse().unwrap(), config);
        let now = Instant::now();
        peer.hold_deadline = Some(now + Duration::from_secs(90));
        peer.keepalive_deadline = Some(now + Duration::from_secs(30));
        peer.connect_retry_deadline = Some(now + Duration::from_secs(60));
        assert_eq!(peer.next_deadline(), peer.keepalive_deadline);
    }

    #[test]
    fn manual_start_arms_connect_for_active_neighbor() {
        let config = test_neighbor(false);
        let mut peer = Peer::new("192.0.2.1".parse().unwrap(), config);
        peer.manual_start(Instant::now());
        assert_eq!(peer.state, fsm::State::Connect);
        assert!(peer.wants_outbound_connect);
    }

    #[test]
    fn manual_start_is_passive_only_for_passive_neighbor() {
        let config = test_neighbor(true);
        let mut peer = Peer::new("192.0.2.1".parse().unwrap(), config);
        peer.manual_start(Instant::now());
        assert_eq!(peer.state, fsm::State::Active);
        assert!(!peer.wants_outbound_connect);
    }

    fn test_neighbor(passive: bool) -> Neighbor {
        Neighbor {
            peer_address: "192.0.2.1".parse().unwrap(),
            local_address: None,
            local_as: 65001,
            peer_as: PeerAs::Fixed(65002),
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            capabilities: crate::config::NeighborCapabilities::default(),
            hold_time: 180,
            connect_retry_interval: 120,
            passive,
            md5_key: None,
            ttl_security: None,
            group_updates: true,
            rate_limit: None,
            respawn: true,
            permitted_source: None,
            watchdog: None,
            enabled: true,
        }
    }
}
