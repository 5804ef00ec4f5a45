//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The reactor (§4.C9, the core's third anchor): a single-threaded,
//! cooperative event loop that owns every socket — the listener, each
//! peer's connection(s), the API transports — and drives [`Peer::poll_io`],
//! [`Peer::poll_timers`] and [`Peer::drain_ribs`] one tick at a time.
//!
//! Nothing here spawns a long-lived task per peer; a single `Reactor::run`
//! loop owns all state and every I/O attempt is either already non-blocking
//! (`network::Connection`, `api::OutgoingQueue` consumers) or explicitly
//! bounded (outbound TCP connects, reported back over a channel rather than
//! awaited inline, so the tick loop is never stalled waiting on a single
//! peer).

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::api::{self, AckMode, ApiEncoding, Command, NeighborSelector, OutgoingQueue, Response};
use crate::config::{ApiProcessConfig, ConfigDelta, InstanceConfig, Neighbor};
use crate::debug::{self, Debug, InstanceInactiveReason};
use crate::error::{ApiError, Error, IoError};
use crate::network::{ConnDirection, Connection, Listener};
use crate::neighbor::{fsm, Peer, SessionEvent, StopReason};
use crate::packet::cache::AttributeCache;
use crate::packet::message::Message;

/// Remote TCP port BGP sessions connect out to (RFC 4271 §8, "a connection
/// is formed between two systems on TCP port 179").
const BGP_PORT: u16 = 179;
/// Lower bound on the reactor's poll interval: nothing waits longer than
/// this between non-blocking sweeps of every socket, keeping newly readable
/// listener/API fds and freshly fired timers reasonably prompt without a
/// dedicated per-fd readiness multiplexer (see `DESIGN.md`).
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound on the poll interval when no peer has a nearer timer.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period granted to in-flight NOTIFICATIONs before a global shutdown
/// exits unconditionally (§5 "Cancellation and timeouts").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Per-tick cap on connections accepted from the listener, so one busy tick
/// cannot starve the rest of the scheduling contract.
const ACCEPT_BUDGET: usize = 64;

/// The single-threaded BGP reactor (§4.C9). Owns the listener, every peer,
/// the API transports, and the shared attribute cache.
pub struct Reactor {
    config: ArcSwap<InstanceConfig>,
    peers: BTreeMap<IpAddr, Peer>,
    listener: Option<Listener>,
    unix_listener: Option<UnixListener>,
    api_processes: Vec<ApiProcess>,
    api_sockets: Vec<ApiSocket>,
    cache: AttributeCache,
    /// Peers with an outbound connect attempt in flight, so `tick` does not
    /// spawn a second one.
    connecting: BTreeSet<IpAddr>,
    connect_tx: mpsc::UnboundedSender<(IpAddr, Result<Connection, IoError>)>,
    connect_rx: mpsc::UnboundedReceiver<(IpAddr, Result<Connection, IoError>)>,
    /// Peers whose Adj-RIB-Out drain is suspended by the outgoing-ring
    /// high-water mark (§4.C9 "Backpressure").
    drain_suspended: BTreeSet<IpAddr>,
    event_counter: u64,
    shutdown_deadline: Option<Instant>,
}

impl Reactor {
    pub fn new(config: InstanceConfig) -> Reactor {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Reactor {
            config: ArcSwap::from_pointee(config),
            peers: BTreeMap::new(),
            listener: None,
            unix_listener: None,
            api_processes: Vec::new(),
            api_sockets: Vec::new(),
            cache: AttributeCache::default(),
            connecting: BTreeSet::new(),
            connect_tx,
            connect_rx,
            drain_suspended: BTreeSet::new(),
            event_counter: 0,
            shutdown_deadline: None,
        }
    }

    fn router_id(&self) -> std::net::Ipv4Addr {
        self.config.load().router_id
    }

    fn local_as(&self) -> u32 {
        self.config.load().asn
    }

    /// Runs the reactor to completion: binds its sockets, spawns configured
    /// API processes, starts every enabled neighbor and loops the
    /// scheduling contract of §4.C9 until a graceful shutdown completes.
    pub async fn run(mut self) -> Result<(), Error> {
        Debug::InstanceCreate.log();
        let snapshot = self.config.load_full();
        if snapshot.router_id == std::net::Ipv4Addr::UNSPECIFIED {
            Debug::InstanceStop(InstanceInactiveReason::MissingRouterId).log();
            return Err(Error::InstanceStart(Box::new(Error::Io(IoError::TcpSocket(
                io::Error::new(io::ErrorKind::InvalidInput, "missing router-id"),
            )))));
        }

        if let Some(listen) = snapshot.listen {
            let addr = SocketAddr::new(listen, snapshot.listen_port);
            let md5_keys = snapshot.neighbors.values().find_map(|n| n.md5_key.clone());
            self.listener = Some(Listener::bind(addr, md5_keys).await.map_err(Error::Io)?);
        }
        if let Some(path) = &snapshot.api_socket_path {
            self.unix_listener = Some(bind_unix_socket(path).map_err(Error::Io)?);
        }
        for process in &snapshot.api_processes {
            match ApiProcess::spawn(process.clone()) {
                Ok(proc) => self.api_processes.push(proc),
                Err(error) => error.log(),
            }
        }

        for (addr, neighbor) in &snapshot.neighbors {
            let mut peer = Peer::new(*addr, neighbor.clone());
            Debug::NbrCreate(addr).log();
            if neighbor.enabled {
                peer.manual_start(Instant::now());
            }
            self.peers.insert(*addr, peer);
        }
        Debug::InstanceStart.log();

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| Error::Io(IoError::TcpSocket(e)))?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::Io(IoError::TcpSocket(e)))?;
        let mut sighup = signal(SignalKind::hangup()).map_err(|e| Error::Io(IoError::TcpSocket(e)))?;
        let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(|e| Error::Io(IoError::TcpSocket(e)))?;

        let mut interval = MIN_POLL_INTERVAL;
        loop {
            tokio::select! {
                _ = sigterm.recv() => self.begin_shutdown(None),
                _ = sigint.recv() => self.begin_shutdown(None),
                _ = sighup.recv() => self.reload(),
                _ = sigusr1.recv() => self.dump_state(),
                _ = tokio::time::sleep(interval) => {}
            }

            interval = self.tick().await;

            if let Some(deadline) = self.shutdown_deadline {
                let all_idle = self.peers.values().all(|p| p.state == fsm::State::Idle);
                if all_idle || Instant::now() >= deadline {
                    break;
                }
            }
        }

        Debug::InstanceStop(InstanceInactiveReason::AdminDown).log();
        Ok(())
    }

    /// One tick of the scheduling contract: accept, feed API input, advance
    /// every peer, and return the interval until the next tick should run
    /// (the minimum of every peer's pending timers, clamped).
    async fn tick(&mut self) -> Duration {
        let local_id = self.router_id();
        let local_as = self.local_as();

        self.accept_connections(local_id, local_as);
        self.accept_api_sockets();
        self.poll_connect_results(local_id, local_as);
        self.maybe_connect_outbound(local_as);
        self.poll_api_processes(local_as);
        self.poll_api_sockets(local_as);

        let now = Instant::now();
        let addrs: Vec<IpAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.advance_peer(addr, local_id, local_as, now);
        }

        let next = self
            .peers
            .values()
            .filter_map(Peer::next_deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(MAX_POLL_INTERVAL);
        next.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }

    // ===== Peer connections =====

    fn accept_connections(&mut self, local_id: std::net::Ipv4Addr, local_as: u32) {
        let Some(listener) = &self.listener else { return };
        for _ in 0..ACCEPT_BUDGET {
            match listener.try_accept() {
                Ok(Some((conn, remote))) => {
                    let remote_ip = remote.ip();
                    if let Some(peer) = self.peers.get_mut(&remote_ip) {
                        if !peer.config.enabled {
                            continue;
                        }
                        let messages = peer.connection_established(conn, ConnDirection::Passive, local_id, local_as);
                        if !messages.is_empty() {
                            let _ = peer.send_and_flush(&messages);
                        }
                    }
                    // An incoming connection from an address with no
                    // configured neighbor is simply dropped; `conn` closes
                    // its socket on drop.
                }
                Ok(None) => break,
                Err(error) => {
                    Error::Io(error).log();
                    break;
                }
            }
        }
    }

    fn maybe_connect_outbound(&mut self, local_as: u32) {
        for (addr, peer) in self.peers.iter_mut() {
            if !peer.wants_outbound_connect || self.connecting.contains(addr) {
                continue;
            }
            if !peer.config.enabled {
                peer.wants_outbound_connect = false;
                continue;
            }
            peer.wants_outbound_connect = false;
            self.connecting.insert(*addr);
            let remote = SocketAddr::new(*addr, BGP_PORT);
            let local_address = peer.config.local_address;
            let md5_key = peer.config.md5_key.clone();
            let ttl = peer.config.ttl_security;
            let tx = self.connect_tx.clone();
            let addr = *addr;
            tokio::spawn(async move {
                let result = Connection::connect(local_address, remote, md5_key.as_deref(), ttl).await;
                let _ = tx.send((addr, result));
            });
        }
        let _ = local_as;
    }

    fn poll_connect_results(&mut self, local_id: std::net::Ipv4Addr, local_as: u32) {
        while let Ok((addr, result)) = self.connect_rx.try_recv() {
            self.connecting.remove(&addr);
            let Some(peer) = self.peers.get_mut(&addr) else { continue };
            match result {
                Ok(conn) => {
                    let messages = peer.connection_established(conn, ConnDirection::Active, local_id, local_as);
                    if !messages.is_empty() {
                        let _ = peer.send_and_flush(&messages);
                    }
                }
                Err(error) => {
                    Error::Io(error).log();
                    peer.connect_failed(Instant::now());
                }
            }
        }
    }

    fn advance_peer(&mut self, addr: IpAddr, local_id: std::net::Ipv4Addr, local_as: u32, now: Instant) {
        let Some(peer) = self.peers.get_mut(&addr) else { return };
        let budget = peer.config.rate_limit;

        let io_outcome = peer.poll_io(local_id, local_as, &mut self.cache, budget);
        self.emit_events(addr, &io_outcome.events);
        if !io_outcome.to_send.is_empty() {
            let _ = peer.send_and_flush(&io_outcome.to_send);
        }
        if let Some(reason) = io_outcome.close {
            peer.teardown(reason);
            self.drain_suspended.remove(&addr);
            return;
        }

        let timer_outcome = peer.poll_timers(now);
        self.emit_events(addr, &timer_outcome.events);
        if !timer_outcome.to_send.is_empty() {
            let _ = peer.send_and_flush(&timer_outcome.to_send);
        }
        if let Some(reason) = timer_outcome.close {
            peer.teardown(reason);
            self.drain_suspended.remove(&addr);
            return;
        }

        if peer.ring_len() >= crate::network::RING_HIGH_WATERMARK {
            self.drain_suspended.insert(addr);
        } else if peer.ring_len() < crate::network::RING_LOW_WATERMARK {
            self.drain_suspended.remove(&addr);
        }
        if !self.drain_suspended.contains(&addr) && peer.is_established() {
            let drained = peer.drain_ribs(4096);
            for msg in &drained {
                if let Message::Update(update) = msg {
                    if let Some(family) = update.eor_family() {
                        self.event_counter += 1;
                        Debug::NbrEorTx(&addr).log();
                        self.emit_events(addr, &[SessionEvent::Eor(family)]);
                    }
                }
            }
            let _ = peer.flush();
        }
    }

    fn emit_events(&mut self, addr: IpAddr, events: &[SessionEvent]) {
        for event in events {
            self.event_counter += 1;
            if matches!(event, SessionEvent::Eor(_)) {
                Debug::NbrEorRx(&addr).log();
            }
            let Some(peer) = self.peers.get(&addr) else { continue };
            let envelope = build_event_envelope(self.event_counter, addr, peer, event);
            for process in self.api_processes.iter_mut().filter(|p| p.config.emit_events) {
                process.queue_event(&envelope);
            }
            for socket in self.api_sockets.iter_mut().filter(|s| s.emit_events) {
                socket.queue_event(&envelope);
            }
        }
    }

    // ===== Configuration reload (§4.C9, Design Notes) =====

    fn reload(&mut self) {
        Debug::InstanceReload.log();
        // The external parser is out of scope (§1): a `SIGHUP` re-reads
        // whatever snapshot the embedder last handed in via
        // `Reactor::apply_config`. With nothing new supplied, reload is a
        // no-op refresh of the existing snapshot.
        let current = self.config.load_full();
        self.apply_config((*current).clone());
    }

    /// Diffs `new_config` against the running snapshot and turns the result
    /// into per-peer FSM events rather than mutating peers directly (§4.C9,
    /// Design Notes "From mutable global configuration"). The embedder
    /// (whatever owns the out-of-scope parser) calls this whenever it has a
    /// new `InstanceConfig` to apply, including in response to `SIGHUP`.
    pub fn apply_config(&mut self, new_config: InstanceConfig) {
        let old = self.config.load_full();
        let delta = ConfigDelta::compute(&old, &new_config);
        if delta.is_empty() {
            self.config.store(std::sync::Arc::new(new_config));
            return;
        }
        let local_as = new_config.asn;
        for neighbor in &delta.added {
            let mut peer = Peer::new(neighbor.peer_address, neighbor.clone());
            Debug::NbrCreate(&neighbor.peer_address).log();
            if neighbor.enabled {
                peer.manual_start(Instant::now());
            }
            self.peers.insert(neighbor.peer_address, peer);
        }
        for addr in &delta.removed {
            if let Some(mut peer) = self.peers.remove(addr) {
                let _ = peer.manual_stop(Some("neighbor removed"));
            }
            Debug::NbrDelete(addr).log();
        }
        for neighbor in &delta.modified {
            if let Some(peer) = self.peers.get_mut(&neighbor.peer_address) {
                peer.config = neighbor.clone();
                if peer.state != fsm::State::Idle {
                    let _ = peer.manual_stop(Some("configuration changed"));
                }
                if neighbor.enabled {
                    peer.manual_start(Instant::now());
                }
            }
        }
        let _ = local_as;
        self.config.store(std::sync::Arc::new(new_config));
    }

    fn dump_state(&self) {
        let snapshot: Vec<(IpAddr, fsm::State)> = self.peers.iter().map(|(a, p)| (*a, p.state)).collect();
        debug::dump_state_snapshot(&snapshot);
    }

    // ===== Shutdown (§5 "Cancellation and timeouts") =====

    fn begin_shutdown(&mut self, message: Option<&str>) {
        request_shutdown(&mut self.peers, &mut self.shutdown_deadline, message);
    }

    // ===== API plane (§4.C10, §6.3) =====

    fn accept_api_sockets(&mut self) {
        let Some(listener) = &self.unix_listener else { return };
        loop {
            match listener.try_accept() {
                Ok((stream, _)) => {
                    self.api_sockets.push(ApiSocket::new(stream));
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    Error::Io(IoError::TcpAccept(error)).log();
                    break;
                }
            }
        }
    }

    fn poll_api_processes(&mut self, local_as: u32) {
        let mut respawn = Vec::new();
        for (idx, process) in self.api_processes.iter_mut().enumerate() {
            match process.poll_lines() {
                Ok(lines) => {
                    for line in lines {
                        Debug::ApiCommandRx(&line).log();
                        let response = dispatch_line(
                            &mut self.peers,
                            &mut self.cache,
                            local_as,
                            &mut self.shutdown_deadline,
                            process.queue.stats(),
                            &line,
                        );
                        process.queue_response(&response);
                    }
                    if process.queue.over_high_watermark() {
                        Debug::ApiBackpressure(&process.config.name).log();
                    }
                    process.try_flush();
                }
                Err(ApiProcessState::Exited) => {
                    if process.config.respawn && process.restarts < process.config.respawn_limit {
                        respawn.push(idx);
                    }
                }
            }
        }
        for idx in respawn.into_iter().rev() {
            if let Some(process) = self.api_processes.get_mut(idx) {
                process.restarts += 1;
                let _ = process.respawn();
            }
        }
    }

    fn poll_api_sockets(&mut self, local_as: u32) {
        self.api_sockets.retain_mut(|socket| socket.poll_lines().is_ok());
        for socket in &mut self.api_sockets {
            let pending = std::mem::take(&mut socket.pending_lines);
            for line in pending {
                Debug::ApiCommandRx(&line).log();
                let response = dispatch_line(
                    &mut self.peers,
                    &mut self.cache,
                    local_as,
                    &mut self.shutdown_deadline,
                    socket.queue.stats(),
                    &line,
                );
                socket.queue_response(&response);
            }
            if socket.queue.over_high_watermark() {
                Debug::ApiBackpressure("unix-socket").log();
            }
            socket.try_flush();
        }
    }
}

/// Issues `ManualStop` to every peer and arms the shutdown grace deadline
/// (§5 "Cancellation and timeouts"). A no-op if shutdown is already in
/// flight. Free function so it can be driven both from signal handling
/// (`Reactor::begin_shutdown`) and from the API `shutdown` verb, which is
/// dispatched through code that only holds disjoint field references.
fn request_shutdown(peers: &mut BTreeMap<IpAddr, Peer>, shutdown_deadline: &mut Option<Instant>, message: Option<&str>) {
    if shutdown_deadline.is_some() {
        return;
    }
    Debug::InstanceStop(InstanceInactiveReason::AdminDown).log();
    for peer in peers.values_mut() {
        let _ = peer.manual_stop(message);
    }
    *shutdown_deadline = Some(Instant::now() + SHUTDOWN_GRACE);
}

fn bind_unix_socket(path: &PathBuf) -> Result<UnixListener, IoError> {
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).map_err(IoError::TcpSocket)
}

/// Dispatches one already-parsed-or-parseable command line against the
/// current peer set, returning the `Response` to render back to the
/// originating connection.
fn dispatch_line(
    peers: &mut BTreeMap<IpAddr, Peer>,
    cache: &mut AttributeCache,
    local_as: u32,
    shutdown_deadline: &mut Option<Instant>,
    queue_stats: (usize, usize),
    line: &str,
) -> Response {
    match api::parse_command(line) {
        Ok(command) => dispatch_command(peers, cache, local_as, shutdown_deadline, queue_stats, command),
        Err(error) => Response::Error { message: error.to_string() },
    }
}

fn dispatch_command(
    peers: &mut BTreeMap<IpAddr, Peer>,
    cache: &mut AttributeCache,
    local_as: u32,
    shutdown_deadline: &mut Option<Instant>,
    queue_stats: (usize, usize),
    command: Command,
) -> Response {
    match command {
        Command::Announce { selector, route } => {
            let targets = selector.resolve(peers, local_as);
            if targets.is_empty() {
                return Response::Error { message: ApiError::NoMatchingNeighbor.to_string() };
            }
            for addr in targets {
                match route.clone().into_announce(cache) {
                    Ok(change) => {
                        if let Some(peer) = peers.get_mut(&addr) {
                            peer.enqueue_change(change);
                        }
                    }
                    Err(error) => return Response::Error { message: error.to_string() },
                }
            }
            Response::Done
        }
        Command::Withdraw { selector, route } => {
            let targets = selector.resolve(peers, local_as);
            if targets.is_empty() {
                return Response::Error { message: ApiError::NoMatchingNeighbor.to_string() };
            }
            let change = route.into_withdraw();
            for addr in targets {
                if let Some(peer) = peers.get_mut(&addr) {
                    peer.enqueue_change(change.clone());
                }
            }
            Response::Done
        }
        Command::Teardown { selector, message } => {
            let targets = selector.resolve(peers, local_as);
            for addr in targets {
                if let Some(peer) = peers.get_mut(&addr) {
                    let _ = peer.manual_stop(message.as_deref());
                }
            }
            Response::Done
        }
        Command::Reload | Command::Restart => Response::Done,
        Command::Shutdown { message } => {
            request_shutdown(peers, shutdown_deadline, message.as_deref());
            Response::Done
        }
        Command::ShowNeighbor { selector } => {
            let targets = selector.resolve(peers, local_as);
            let mut lines = Vec::new();
            for addr in targets {
                if let Some(peer) = peers.get(&addr) {
                    lines.push(format!(
                        "neighbor {addr} local-as {} peer-as {:?} state {:?} established-transitions {}",
                        peer.config.local_as, peer.config.peer_as, peer.state, peer.stats.established_transitions
                    ));
                }
            }
            Response::Text { body: lines.join("\n") }
        }
        Command::ShowAdjRib { selector, direction } => {
            if direction == api::RibDirection::In {
                // No Adj-RIB-In is maintained by this core; say so rather
                // than mislabeling the Adj-RIB-Out counts as "in" routes.
                return Response::Text { body: "adj-rib-in is not maintained".to_string() };
            }
            let targets = selector.resolve(peers, local_as);
            let mut lines = Vec::new();
            for addr in targets {
                if let Some(peer) = peers.get(&addr) {
                    for family in peer.rib.families() {
                        if let Some(table) = peer.rib.get(*family) {
                            lines.push(format!("neighbor {addr} family {family:?} routes {}", table.sent_len()));
                        }
                    }
                }
            }
            Response::Text { body: lines.join("\n") }
        }
        Command::FlushAdjRibOut { selector } => {
            let targets = selector.resolve(peers, local_as);
            for addr in targets {
                if let Some(peer) = peers.get_mut(&addr) {
                    let families: Vec<_> = peer.rib.families().copied().collect();
                    for family in families {
                        peer.rib.table(family).flush();
                    }
                }
            }
            Response::Done
        }
        Command::ClearAdjRibOut { selector } => {
            let targets = selector.resolve(peers, local_as);
            for addr in targets {
                if let Some(peer) = peers.get_mut(&addr) {
                    let families: Vec<_> = peer.rib.families().copied().collect();
                    for family in families {
                        peer.rib.table(family).clear();
                    }
                }
            }
            Response::Done
        }
        Command::RouteRefresh { selector } => {
            let targets = selector.resolve(peers, local_as);
            for addr in targets {
                if let Some(peer) = peers.get_mut(&addr) {
                    let families: Vec<_> = peer.rib.families().copied().collect();
                    for family in families {
                        peer.rib.table(family).resend();
                    }
                }
            }
            Response::Done
        }
        Command::WatchdogEnable { tag } => {
            for peer in peers.values_mut() {
                let families: Vec<_> = peer.rib.families().copied().collect();
                for family in families {
                    peer.rib.table(family).watchdog_enable(&tag);
                }
            }
            Debug::RibOutWatchdog(&tag, true).log();
            Response::Done
        }
        Command::WatchdogDisable { tag } => {
            for peer in peers.values_mut() {
                let families: Vec<_> = peer.rib.families().copied().collect();
                for family in families {
                    peer.rib.table(family).watchdog_disable(&tag);
                }
            }
            Debug::RibOutWatchdog(&tag, false).log();
            Response::Done
        }
        Command::QueueStatus => {
            let (items, bytes) = queue_stats;
            Response::Text { body: format!("queue-status items {items} bytes {bytes}") }
        }
    }
}

fn build_event_envelope(counter: u64, addr: IpAddr, peer: &Peer, event: &SessionEvent) -> String {
    let (event_type, payload) = match event {
        SessionEvent::StateChange { old, new } => {
            ("state".to_string(), serde_json::json!({ "old": old, "new": new }))
        }
        SessionEvent::OpenReceived(open) => ("open".to_string(), serde_json::json!(open)),
        SessionEvent::UpdateReceived { withdrawn, announced } => (
            "update".to_string(),
            serde_json::json!({ "withdrawn": withdrawn.len(), "announced": announced.len() }),
        ),
        SessionEvent::NotificationReceived(notif) => ("notification".to_string(), serde_json::json!(notif)),
        SessionEvent::NotificationSent(notif) => ("notification-sent".to_string(), serde_json::json!(notif)),
        SessionEvent::KeepaliveReceived => ("keepalive".to_string(), serde_json::Value::Null),
        SessionEvent::Eor(family) => ("eor".to_string(), serde_json::json!({ "family": format!("{family:?}") })),
    };
    let envelope = serde_json::json!({
        "exabgp": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
        "pid": std::process::id(),
        "counter": counter,
        "type": event_type,
        "neighbor": {
            "address": { "peer": addr },
            "asn": { "local": peer.config.local_as, "peer": peer.identifier },
        },
        "message": payload,
    });
    envelope.to_string()
}

// ===== API process transport (§6.3 "Child processes") =====

enum ApiProcessState {
    Exited,
}

/// A spawned API process (§6.3 "Child processes"). stdout/stdin are pipes,
/// not sockets, so they carry no non-blocking `try_read`/`try_write`; a
/// dedicated reader and writer task per process ferries lines across
/// channels instead, keeping the tick loop itself free of any `.await` on a
/// single process's pipe.
struct ApiProcess {
    config: ApiProcessConfig,
    child: Option<Child>,
    line_rx: mpsc::UnboundedReceiver<String>,
    write_tx: mpsc::UnboundedSender<String>,
    queue: OutgoingQueue,
    restarts: u32,
}

impl ApiProcess {
    fn spawn(config: ApiProcessConfig) -> Result<ApiProcess, Error> {
        let (child, line_rx, write_tx) = spawn_child(&config)?;
        Ok(ApiProcess { config, child: Some(child), line_rx, write_tx, queue: OutgoingQueue::default(), restarts: 0 })
    }

    fn respawn(&mut self) -> Result<(), Error> {
        let (child, line_rx, write_tx) = spawn_child(&self.config)?;
        self.child = Some(child);
        self.line_rx = line_rx;
        self.write_tx = write_tx;
        Ok(())
    }

    fn poll_lines(&mut self) -> Result<Vec<String>, ApiProcessState> {
        let mut lines = Vec::new();
        loop {
            match self.line_rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(ApiProcessState::Exited),
            }
        }
        Ok(lines)
    }

    fn queue_response(&mut self, response: &Response) {
        if let Some(line) = response.render(self.config.encoder, self.config.ack_mode) {
            self.queue.push(line);
        }
    }

    fn queue_event(&mut self, envelope: &str) {
        self.queue.push(envelope.to_string());
    }

    fn try_flush(&mut self) {
        while !self.queue.is_empty() {
            if self.queue.over_high_watermark() && !self.queue.under_low_watermark() {
                break;
            }
            let Some(line) = self.queue.pop() else { break };
            if self.write_tx.send(line).is_err() {
                break;
            }
        }
    }
}

fn spawn_child(
    config: &ApiProcessConfig,
) -> Result<(Child, mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>), Error> {
    let Some((program, args)) = config.command.split_first() else {
        return Err(Error::Io(IoError::TcpSocket(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty api-process command",
        ))));
    };
    let mut child = ProcessCommand::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Io(IoError::TcpSocket(e)))?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stdin = child.stdin.take().expect("piped stdin");

    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = write_rx.recv().await {
            let mut data = line.into_bytes();
            data.push(b'\n');
            if stdin.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    Ok((child, line_rx, write_tx))
}

// ===== API Unix-domain socket transport (§6.3 "Unix-domain socket") =====

struct ApiSocket {
    stream: UnixStream,
    encoding: ApiEncoding,
    ack_mode: AckMode,
    emit_events: bool,
    read_buf: BytesMut,
    queue: OutgoingQueue,
    pending_lines: Vec<String>,
}

impl ApiSocket {
    fn new(stream: UnixStream) -> ApiSocket {
        ApiSocket {
            stream,
            encoding: ApiEncoding::Text,
            ack_mode: AckMode::Enabled,
            emit_events: true,
            read_buf: BytesMut::with_capacity(4096),
            queue: OutgoingQueue::default(),
            pending_lines: Vec::new(),
        }
    }

    fn poll_lines(&mut self) -> Result<(), ()> {
        loop {
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(()),
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return Err(()),
            }
        }
        self.pending_lines.extend(drain_lines(&mut self.read_buf));
        Ok(())
    }

    fn queue_response(&mut self, response: &Response) {
        if let Some(line) = response.render(self.encoding, self.ack_mode) {
            self.queue.push(line);
        }
    }

    fn queue_event(&mut self, envelope: &str) {
        self.queue.push(envelope.to_string());
    }

    fn try_flush(&mut self) {
        while !self.queue.is_empty() {
            if self.queue.over_high_watermark() && !self.queue.under_low_watermark() {
                break;
            }
            let Some(line) = self.queue.pop() else { break };
            let mut data = line.into_bytes();
            data.push(b'\n');
            match self.stream.try_write(&data) {
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.queue.push(String::from_utf8_lossy(&data).trim_end().to_string());
                    break;
                }
                Err(_) => break,
            }
        }
    }
}

/// Splits complete newline-terminated lines out of `buf`, leaving any
/// trailing partial line buffered for the next read (mirrors
/// `Connection::try_recv`'s partial-frame tolerance at the line level).
fn drain_lines(buf: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line = buf.split_to(pos);
        buf.advance(1);
        if let Ok(text) = String::from_utf8(line.to_vec()) {
            if !text.trim().is_empty() {
                lines.push(text);
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_splits_on_newline_and_keeps_partial() {
        let mut buf = BytesMut::from(&b"announce route 10.0.0.0/24\nwithdraw"[..]);
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["announce route 10.0.0.0/24".to_string()]);
        assert_eq!(&buf[..], b"withdraw");
    }

    #[test]
    fn drain_lines_skips_blank_lines() {
        let mut buf = BytesMut::from(&b"\n\nreload\n"[..]);
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["reload".to_string()]);
    }

    fn test_neighbor() -> Neighbor {
        Neighbor {
            peer_address: "192.0.2.1".parse().unwrap(),
            local_address: None,
            local_as: 65001,
            peer_as: crate::config::PeerAs::Fixed(65002),
            router_id: std::net::Ipv4Addr::new(192, 0, 2, 1),
            capabilities: crate::config::NeighborCapabilities::default(),
            hold_time: 180,
            connect_retry_interval: 120,
            passive: false,
            md5_key: None,
            ttl_security: None,
            group_updates: false,
            rate_limit: None,
            respawn: false,
            permitted_source: None,
            watchdog: None,
            enabled: true,
        }
    }

    #[test]
    fn queue_status_reports_the_calling_transport_stats() {
        let mut peers = BTreeMap::new();
        let mut cache = AttributeCache::default();
        let mut shutdown_deadline = None;
        let response = dispatch_command(&mut peers, &mut cache, 65001, &mut shutdown_deadline, (3, 128), Command::QueueStatus);
        match response {
            Response::Text { body } => assert_eq!(body, "queue-status items 3 bytes 128"),
            other => panic!("expected Response::Text, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_command_stops_every_peer_and_arms_the_grace_deadline() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let mut peers = BTreeMap::new();
        peers.insert(addr, Peer::new(addr, test_neighbor()));
        peers.get_mut(&addr).unwrap().manual_start(Instant::now());
        let mut cache = AttributeCache::default();
        let mut shutdown_deadline = None;
        let command = Command::Shutdown { message: Some("maintenance".to_string()) };
        let response = dispatch_command(&mut peers, &mut cache, 65001, &mut shutdown_deadline, (0, 0), command);
        assert!(matches!(response, Response::Done));
        assert!(shutdown_deadline.is_some());
        assert_eq!(peers[&addr].state, fsm::State::Idle);
    }

    #[test]
    fn shutdown_command_is_idempotent() {
        let mut peers = BTreeMap::new();
        let mut cache = AttributeCache::default();
        let first_deadline = Instant::now() + Duration::from_secs(2);
        let mut shutdown_deadline = Some(first_deadline);
        let response =
            dispatch_command(&mut peers, &mut cache, 65001, &mut shutdown_deadline, (0, 0), Command::Shutdown { message: None });
        assert!(matches!(response, Response::Done));
        assert_eq!(shutdown_deadline, Some(first_deadline));
    }

    #[test]
    fn show_adj_rib_in_reports_not_maintained_instead_of_out_counts() {
        let mut peers = BTreeMap::new();
        let mut cache = AttributeCache::default();
        let mut shutdown_deadline = None;
        let command = Command::ShowAdjRib { selector: NeighborSelector::All, direction: api::RibDirection::In };
        let response = dispatch_command(&mut peers, &mut cache, 65001, &mut shutdown_deadline, (0, 0), command);
        match response {
            Response::Text { body } => assert_eq!(body, "adj-rib-in is not maintained"),
            other => panic!("expected Response::Text, got {other:?}"),
        }
    }
}
