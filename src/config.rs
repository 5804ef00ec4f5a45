//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Configuration surface (§3 "Neighbor", §6.5). The text configuration
//! parser is explicitly out of scope (§1): this module only defines the
//! typed descriptor that parser hands to the core, plus the runtime reload
//! machinery (§4.C9, Design Notes "From mutable global configuration") that
//! turns a new descriptor into per-peer FSM events.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::packet::nlri::Family;

/// A neighbor's configured peer ASN: a fixed value, a range (accept any ASN
/// in the range, used with BGP peer groups of unknown remote ASN) or `Auto`
/// (learn the ASN from the first OPEN received, per common route-server
/// practice).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PeerAs {
    Fixed(u32),
    Range(u32, u32),
    Auto,
}

impl PeerAs {
    pub fn accepts(&self, asn: u32) -> bool {
        match self {
            PeerAs::Fixed(expected) => *expected == asn,
            PeerAs::Range(lo, hi) => (*lo..=*hi).contains(&asn),
            PeerAs::Auto => true,
        }
    }
}

/// ADD-PATH direction a neighbor is configured to offer, per family (§3
/// "Capability").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AddPathDirection {
    Receive,
    Send,
    ReceiveSend,
}

/// Capabilities to offer a neighbor (§3 "Capability", §4.C5). Booleans for
/// capabilities with no further parameters; `add_path`/`families` carry the
/// per-family detail.
#[derive(Clone, Debug)]
pub struct NeighborCapabilities {
    pub families: BTreeSet<Family>,
    pub four_octet_asn: bool,
    pub route_refresh: bool,
    pub enhanced_route_refresh: bool,
    pub extended_message: bool,
    pub graceful_restart: Option<u16>,
    pub add_path: BTreeMap<Family, AddPathDirection>,
    pub hostname: Option<(String, String)>,
    pub software_version: Option<String>,
}

impl Default for NeighborCapabilities {
    fn default() -> NeighborCapabilities {
        NeighborCapabilities {
            families: BTreeSet::new(),
            four_octet_asn: true,
            route_refresh: true,
            enhanced_route_refresh: false,
            extended_message: false,
            graceful_restart: None,
            add_path: BTreeMap::new(),
            hostname: None,
            software_version: None,
        }
    }
}

/// Configuration-time descriptor of one BGP neighbor (§3 "Neighbor"): the
/// unit the external parser hands to the core, one per configured peer.
#[derive(Clone, Debug)]
pub struct Neighbor {
    pub peer_address: IpAddr,
    pub local_address: Option<IpAddr>,
    pub local_as: u32,
    pub peer_as: PeerAs,
    pub router_id: Ipv4Addr,
    pub capabilities: NeighborCapabilities,
    pub hold_time: u16,
    pub connect_retry_interval: u16,
    pub passive: bool,
    pub md5_key: Option<String>,
    pub ttl_security: Option<u8>,
    pub group_updates: bool,
    /// Per-tick message-handling budget (§4.C9 "Rate limiting"); `None`
    /// disables the cap.
    pub rate_limit: Option<usize>,
    pub respawn: bool,
    /// Incoming connections are only accepted from addresses matching this
    /// pattern, when set (§3 "Neighbor" — "permitted incoming address
    /// pattern").
    pub permitted_source: Option<IpNetwork>,
    pub watchdog: Option<String>,
    pub enabled: bool,
}

impl Neighbor {
    /// Whether `local_as` exceeds the classic 2-octet AS number range and
    /// therefore requires `AS_TRANS` on the wire plus the Four-Octet AS
    /// Number capability (§4.C4 "OPEN body", §8 round-trip properties).
    pub fn local_as_is_4byte(&self) -> bool {
        self.local_as > u32::from(u16::MAX)
    }

    pub fn peer_type(&self, local_as: u32) -> PeerType {
        match &self.peer_as {
            PeerAs::Fixed(asn) if *asn == local_as => PeerType::Internal,
            PeerAs::Range(lo, hi) if (*lo..=*hi).contains(&local_as) => PeerType::Internal,
            _ => PeerType::External,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerType {
    Internal,
    External,
}

/// Per-process API transport configuration (§6.3). Each entry spawns one
/// child process whose stdout carries commands in and whose stdin carries
/// responses/events out.
#[derive(Clone, Debug)]
pub struct ApiProcessConfig {
    pub name: String,
    pub command: Vec<String>,
    pub respawn: bool,
    pub respawn_limit: u32,
    pub encoder: ApiEncoding,
    pub ack_mode: AckMode,
    /// Whether this process is subscribed to event emission (§6.4 "per
    /// API-process subscription"), as opposed to only issuing commands.
    pub emit_events: bool,
}

impl Default for ApiProcessConfig {
    fn default() -> ApiProcessConfig {
        ApiProcessConfig {
            name: String::new(),
            command: Vec::new(),
            respawn: true,
            respawn_limit: 5,
            encoder: ApiEncoding::Text,
            ack_mode: AckMode::Enabled,
            emit_events: true,
        }
    }
}

/// Response encoding for an API transport connection (§4.C10 "Responses").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ApiEncoding {
    Text,
    Json,
}

/// Per-connection ACK policy (§4.C10 "Responses"): whether `done`/`error`
/// lines are emitted for commands that don't otherwise produce output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AckMode {
    Enabled,
    Silenced,
    Disabled,
}

/// The top-level, typed configuration snapshot (§3, §6.5). Produced
/// in-memory by the external parser; the core never reads the snapshot's
/// origin, only its content.
#[derive(Clone, Debug, Default)]
pub struct InstanceConfig {
    pub router_id: Ipv4Addr,
    pub asn: u32,
    pub listen: Option<IpAddr>,
    pub listen_port: u16,
    pub neighbors: BTreeMap<IpAddr, Neighbor>,
    pub api_processes: Vec<ApiProcessConfig>,
    pub api_socket_path: Option<PathBuf>,
    pub group_updates: bool,
}

/// The difference between two configuration snapshots, computed on
/// `SIGHUP`/`reload` (§4.C9, Design Notes "From mutable global
/// configuration"): diffed against the previous `ArcSwap` snapshot and fed
/// through the FSM as `Add`/`Remove`/`Modify` events rather than mutating
/// peers directly.
#[derive(Debug, Default)]
pub struct ConfigDelta {
    pub added: Vec<Neighbor>,
    pub removed: Vec<IpAddr>,
    pub modified: Vec<Neighbor>,
}

impl ConfigDelta {
    /// Computes the delta needed to move a running instance from `old` to
    /// `new`. A neighbor whose non-runtime fields are unchanged is dropped
    /// from `modified` entirely so reload is a no-op for it.
    pub fn compute(old: &InstanceConfig, new: &InstanceConfig) -> ConfigDelta {
        let mut delta = ConfigDelta::default();
        for (addr, nbr) in &new.neighbors {
            match old.neighbors.get(addr) {
                None => delta.added.push(nbr.clone()),
                Some(prev) if !neighbor_config_eq(prev, nbr) => {
                    delta.modified.push(nbr.clone());
                }
                Some(_) => {}
            }
        }
        for addr in old.neighbors.keys() {
            if !new.neighbors.contains_key(addr) {
                delta.removed.push(*addr);
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compares the fields that matter for session re-establishment; two
/// `Neighbor`s differing only in `enabled` still compare equal here because
/// that transition is modeled as an FSM event, not a reconfiguration
/// (§3 "Peer" lifecycle).
fn neighbor_config_eq(a: &Neighbor, b: &Neighbor) -> bool {
    a.peer_address == b.peer_address
        && a.local_address == b.local_address
        && a.local_as == b.local_as
        && a.peer_as == b.peer_as
        && a.router_id == b.router_id
        && a.hold_time == b.hold_time
        && a.connect_retry_interval == b.connect_retry_interval
        && a.passive == b.passive
        && a.md5_key == b.md5_key
        && a.ttl_security == b.ttl_security
        && a.group_updates == b.group_updates
        && a.capabilities.families == b.capabilities.families
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_neighbor(addr: IpAddr) -> Neighbor {
        Neighbor {
            peer_address: addr,
            local_address: None,
            local_as: 65001,
            peer_as: PeerAs::Fixed(65002),
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            capabilities: NeighborCapabilities::default(),
            hold_time: 180,
            connect_retry_interval: 120,
            passive: false,
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

    #[test]
    fn delta_detects_added_and_removed() {
        let addr_a: IpAddr = "192.0.2.1".parse().unwrap();
        let addr_b: IpAddr = "192.0.2.2".parse().unwrap();
        let mut old = InstanceConfig::default();
        old.neighbors.insert(addr_a, sample_neighbor(addr_a));
        let mut new = InstanceConfig::default();
        new.neighbors.insert(addr_b, sample_neighbor(addr_b));

        let delta = ConfigDelta::compute(&old, &new);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed, vec![addr_a]);
        assert!(delta.modified.is_empty());
    }

    #[test]
    fn delta_ignores_unchanged_neighbor() {
        let addr: IpAddr = "192.0.2.1".parse().unwrap();
        let mut old = InstanceConfig::default();
        old.neighbors.insert(addr, sample_neighbor(addr));
        let new = old.clone();
        assert!(ConfigDelta::compute(&old, &new).is_empty());
    }

    #[test]
    fn peer_as_range_accepts_within_bounds() {
        let peer_as = PeerAs::Range(65000, 65010);
        assert!(peer_as.accepts(65005));
        assert!(!peer_as.accepts(65020));
    }
}
