//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The API plane (§4.C10): a line-oriented command language spoken over
//! per-process pipes and a Unix-domain socket (§6.3). Parsing and command
//! dispatch live here; the reactor (`crate::reactor`) owns the actual
//! process/socket I/O and calls into [`parse_command`] and
//! [`NeighborSelector::resolve`] to turn a line of text into Adj-RIB-Out
//! mutations or a synchronous query answer.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};

use serde::Serialize;

use crate::config::{AckMode, ApiEncoding};
use crate::error::ApiError;
use crate::neighbor::Peer;
use crate::packet::consts::Origin;
use crate::packet::nlri::{Ipv4Prefix, Ipv6Prefix, Nlri};
use crate::rib::Change;

/// High-water mark for a connection's outgoing response queue (§4.C9
/// "Backpressure", §6.3): above this many buffered bytes, further command
/// processing for this connection is suspended.
pub const QUEUE_HIGH_WATERMARK: usize = 1 << 20;
/// Low-water mark: processing resumes once the queue falls below this.
pub const QUEUE_LOW_WATERMARK: usize = 1 << 18;

// ===== Neighbor selector grammar (§4.C10 "neighbor selector grammar") =====

/// One attribute constraint in a conjunctive neighbor selector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SelectorAttr {
    PeerAs(u32),
    LocalAs(u32),
    LocalIp(IpAddr),
    RouterId(Ipv4Addr),
}

/// The neighbor selector grammar of §4.C10: an explicit address, `*` for
/// every configured peer, or a conjunction of attribute constraints.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NeighborSelector {
    All,
    Address(IpAddr),
    Attributes(Vec<SelectorAttr>),
}

impl NeighborSelector {
    /// Parses a selector from whitespace-separated tokens, consuming as
    /// many as match; returns the selector plus the remaining tokens.
    pub fn parse<'a>(tokens: &'a [&'a str]) -> Result<(NeighborSelector, &'a [&'a str]), ApiError> {
        match tokens.first() {
            Some(&"*") => Ok((NeighborSelector::All, &tokens[1..])),
            Some(tok) if tok.parse::<IpAddr>().is_ok() => {
                Ok((NeighborSelector::Address(tok.parse().unwrap()), &tokens[1..]))
            }
            Some(&"peer-as") | Some(&"local-as") | Some(&"local-ip") | Some(&"router-id") => {
                let mut attrs = Vec::new();
                let mut rest = tokens;
                loop {
                    match rest.first() {
                        Some(&"peer-as") => {
                            let value = next_value(rest, "peer-as")?;
                            attrs.push(SelectorAttr::PeerAs(parse_u32(value)?));
                            rest = &rest[2..];
                        }
                        Some(&"local-as") => {
                            let value = next_value(rest, "local-as")?;
                            attrs.push(SelectorAttr::LocalAs(parse_u32(value)?));
                            rest = &rest[2..];
                        }
                        Some(&"local-ip") => {
                            let value = next_value(rest, "local-ip")?;
                            let addr = value
                                .parse()
                                .map_err(|_| ApiError::InvalidSelector(format!("bad local-ip '{value}'")))?;
                            attrs.push(SelectorAttr::LocalIp(addr));
                            rest = &rest[2..];
                        }
                        Some(&"router-id") => {
                            let value = next_value(rest, "router-id")?;
                            let addr = value
                                .parse()
                                .map_err(|_| ApiError::InvalidSelector(format!("bad router-id '{value}'")))?;
                            attrs.push(SelectorAttr::RouterId(addr));
                            rest = &rest[2..];
                        }
                        _ => break,
                    }
                }
                Ok((NeighborSelector::Attributes(attrs), rest))
            }
            _ => Ok((NeighborSelector::All, tokens)),
        }
    }

    /// Resolves this selector to the addresses of every peer it matches.
    pub fn resolve(&self, peers: &std::collections::BTreeMap<IpAddr, Peer>, local_as: u32) -> Vec<IpAddr> {
        match self {
            NeighborSelector::All => peers.keys().copied().collect(),
            NeighborSelector::Address(addr) => {
                if peers.contains_key(addr) { vec![*addr] } else { Vec::new() }
            }
            NeighborSelector::Attributes(attrs) => peers
                .iter()
                .filter(|(_, peer)| attrs.iter().all(|attr| attr.matches(peer, local_as)))
                .map(|(addr, _)| *addr)
                .collect(),
        }
    }
}

impl SelectorAttr {
    fn matches(&self, peer: &Peer, local_as: u32) -> bool {
        match self {
            SelectorAttr::PeerAs(asn) => peer.config.peer_as.accepts(*asn),
            SelectorAttr::LocalAs(asn) => *asn == local_as,
            SelectorAttr::LocalIp(ip) => peer.config.local_address == Some(*ip),
            SelectorAttr::RouterId(id) => peer.identifier == Some(*id),
        }
    }
}

fn next_value<'a>(tokens: &'a [&'a str], keyword: &str) -> Result<&'a str, ApiError> {
    tokens
        .get(1)
        .copied()
        .ok_or_else(|| ApiError::MalformedCommand(format!("'{keyword}' requires a value")))
}

fn parse_u32(value: &str) -> Result<u32, ApiError> {
    value.parse().map_err(|_| ApiError::MalformedCommand(format!("expected a number, got '{value}'")))
}

// ===== Route specification (announce/withdraw route) =====

/// The route fields an `announce`/`withdraw` command can carry, parsed from
/// text before being turned into a [`Change`] against a specific peer's
/// Adj-RIB-Out. Only the IPv4/IPv6 unicast textual grammar is implemented;
/// other families are reachable only via the wire codec (`packet::nlri`),
/// which supports every family in §4.C3 — the text command grammar for
/// those is a CLI/parser concern outside this spec's core (§1).
#[derive(Clone, Debug, Default)]
pub struct RouteSpec {
    pub prefix: Option<IpAddr>,
    pub prefix_len: Option<u8>,
    pub next_hop: Option<IpAddr>,
    pub origin: Option<Origin>,
    pub med: Option<u32>,
    pub local_preference: Option<u32>,
    pub as_path: Vec<u32>,
    pub communities: Vec<u32>,
    pub large_communities: Vec<(u32, u32, u32)>,
    pub watchdog: Option<String>,
}

impl RouteSpec {
    fn parse(tokens: &[&str]) -> Result<RouteSpec, ApiError> {
        let mut spec = RouteSpec::default();
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i] {
                "route" => {
                    let text = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'route' requires a prefix".into())
                    })?;
                    let network: ipnetwork::IpNetwork = text
                        .parse()
                        .map_err(|_| ApiError::MalformedCommand(format!("bad prefix '{text}'")))?;
                    spec.prefix = Some(network.ip());
                    spec.prefix_len = Some(network.prefix());
                    i += 2;
                }
                "next-hop" => {
                    let text = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'next-hop' requires an address".into())
                    })?;
                    spec.next_hop = Some(
                        text.parse()
                            .map_err(|_| ApiError::MalformedCommand(format!("bad next-hop '{text}'")))?,
                    );
                    i += 2;
                }
                "origin" => {
                    let text = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'origin' requires a value".into())
                    })?;
                    spec.origin = Some(match text {
                        "igp" => Origin::Igp,
                        "egp" => Origin::Egp,
                        "incomplete" => Origin::Incomplete,
                        other => {
                            return Err(ApiError::MalformedCommand(format!("bad origin '{other}'")));
                        }
                    });
                    i += 2;
                }
                "med" => {
                    let value = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'med' requires a value".into())
                    })?;
                    spec.med = Some(parse_u32(value)?);
                    i += 2;
                }
                "local-preference" => {
                    let value = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'local-preference' requires a value".into())
                    })?;
                    spec.local_preference = Some(parse_u32(value)?);
                    i += 2;
                }
                "as-path" => {
                    let value = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'as-path' requires a value".into())
                    })?;
                    for asn in value.trim_matches(|c| c == '[' || c == ']').split(',') {
                        if !asn.is_empty() {
                            spec.as_path.push(parse_u32(asn)?);
                        }
                    }
                    i += 2;
                }
                "community" => {
                    let value = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'community' requires a value".into())
                    })?;
                    for community in value.trim_matches(|c| c == '[' || c == ']').split(',') {
                        spec.communities.push(parse_community(community)?);
                    }
                    i += 2;
                }
                "large-community" => {
                    let value = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'large-community' requires a value".into())
                    })?;
                    for lc in value.trim_matches(|c| c == '[' || c == ']').split(',') {
                        let parts: Vec<&str> = lc.split(':').collect();
                        if parts.len() != 3 {
                            return Err(ApiError::MalformedCommand(format!("bad large-community '{lc}'")));
                        }
                        spec.large_communities.push((
                            parse_u32(parts[0])?,
                            parse_u32(parts[1])?,
                            parse_u32(parts[2])?,
                        ));
                    }
                    i += 2;
                }
                "watchdog" => {
                    let tag = *tokens.get(i + 1).ok_or_else(|| {
                        ApiError::MalformedCommand("'watchdog' requires a tag".into())
                    })?;
                    spec.watchdog = Some(tag.to_string());
                    i += 2;
                }
                other => return Err(ApiError::MalformedCommand(format!("unexpected token '{other}'"))),
            }
        }
        if spec.prefix.is_none() {
            return Err(ApiError::MalformedCommand("missing 'route <prefix>'".into()));
        }
        Ok(spec)
    }

    /// Builds the NLRI for this spec's address family; `path_id` is filled
    /// in by the caller once ADD-PATH negotiation for the peer is known.
    fn nlri(&self) -> Nlri {
        let len = self.prefix_len.unwrap_or(32);
        match self.prefix.unwrap() {
            IpAddr::V4(addr) => Nlri::Ipv4Unicast { prefix: Ipv4Prefix { addr, len }, path_id: None },
            IpAddr::V6(addr) => Nlri::Ipv6Unicast { prefix: Ipv6Prefix { addr, len }, path_id: None },
        }
    }

    /// Turns this spec into a [`Change`], interning its attributes in
    /// `cache` (§3 "Change", §4.C2 "Attribute interning").
    pub fn into_announce(self, cache: &mut crate::packet::cache::AttributeCache) -> Result<Change, ApiError> {
        use crate::packet::attribute::{Attribute, AttributeCollection, AsPath, AsPathSegment};
        use crate::packet::consts::AsPathSegmentType;
        let mut attrs = AttributeCollection::new();
        attrs
            .insert(Attribute::Origin(self.origin.unwrap_or(Origin::Igp)), cache)
            .map_err(|_| ApiError::MalformedCommand("duplicate ORIGIN".into()))?;
        let segments = if self.as_path.is_empty() {
            Vec::new()
        } else {
            vec![AsPathSegment { seg_type: AsPathSegmentType::Sequence, members: self.as_path.clone() }]
        };
        attrs
            .insert(Attribute::AsPath(AsPath { segments }), cache)
            .map_err(|_| ApiError::MalformedCommand("duplicate AS_PATH".into()))?;
        if let IpAddr::V4(next_hop) = self.next_hop.unwrap_or(Ipv4Addr::UNSPECIFIED.into()) {
            attrs
                .insert(Attribute::NextHop(next_hop), cache)
                .map_err(|_| ApiError::MalformedCommand("duplicate NEXT_HOP".into()))?;
        }
        if let Some(med) = self.med {
            attrs.insert(Attribute::Med(med), cache).map_err(|_| ApiError::MalformedCommand("duplicate MED".into()))?;
        }
        if let Some(local_pref) = self.local_preference {
            attrs
                .insert(Attribute::LocalPref(local_pref), cache)
                .map_err(|_| ApiError::MalformedCommand("duplicate LOCAL_PREF".into()))?;
        }
        if !self.communities.is_empty() {
            attrs
                .insert(Attribute::Communities(self.communities.clone()), cache)
                .map_err(|_| ApiError::MalformedCommand("duplicate COMMUNITIES".into()))?;
        }
        if !self.large_communities.is_empty() {
            attrs
                .insert(Attribute::LargeCommunities(self.large_communities.clone()), cache)
                .map_err(|_| ApiError::MalformedCommand("duplicate LARGE_COMMUNITIES".into()))?;
        }
        let next_hop = match self.next_hop {
            Some(IpAddr::V6(v6)) => Some(IpAddr::V6(v6)),
            _ => None,
        };
        let mut change = Change::announce(self.nlri(), attrs, next_hop);
        if let Some(tag) = &self.watchdog {
            change = change.with_watchdog(tag.clone());
        }
        Ok(change)
    }

    pub fn into_withdraw(self) -> Change {
        Change::withdraw(self.nlri())
    }
}

fn parse_community(text: &str) -> Result<u32, ApiError> {
    if let Some((hi, lo)) = text.split_once(':') {
        let hi: u16 = hi.parse().map_err(|_| ApiError::MalformedCommand(format!("bad community '{text}'")))?;
        let lo: u16 = lo.parse().map_err(|_| ApiError::MalformedCommand(format!("bad community '{text}'")))?;
        Ok(((hi as u32) << 16) | lo as u32)
    } else {
        text.parse().map_err(|_| ApiError::MalformedCommand(format!("bad community '{text}'")))
    }
}

// ===== Command grammar =====

/// The Adj-RIB direction queried by `show adj-rib` (§4.C10).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RibDirection {
    In,
    Out,
}

/// A fully parsed API command (§4.C10 "the core public verbs").
#[derive(Clone, Debug)]
pub enum Command {
    Announce { selector: NeighborSelector, route: RouteSpec },
    Withdraw { selector: NeighborSelector, route: RouteSpec },
    Teardown { selector: NeighborSelector, message: Option<String> },
    Reload,
    Restart,
    Shutdown { message: Option<String> },
    ShowNeighbor { selector: NeighborSelector },
    ShowAdjRib { selector: NeighborSelector, direction: RibDirection },
    FlushAdjRibOut { selector: NeighborSelector },
    ClearAdjRibOut { selector: NeighborSelector },
    RouteRefresh { selector: NeighborSelector },
    WatchdogEnable { tag: String },
    WatchdogDisable { tag: String },
    QueueStatus,
}

/// Parses one command line (§4.C10). Commands are optionally prefixed with
/// `neighbor <selector>`; bare `announce`/`withdraw`/... apply to every
/// configured peer (`NeighborSelector::All`).
pub fn parse_command(line: &str) -> Result<Command, ApiError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ApiError::MalformedCommand("empty command".into()));
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();

    let (selector, rest) = if tokens.first() == Some(&"neighbor") {
        NeighborSelector::parse(&tokens[1..])?
    } else {
        (NeighborSelector::All, tokens.as_slice())
    };

    match rest.first() {
        Some(&"announce") if rest.get(1) == Some(&"route") => {
            let route = RouteSpec::parse(&rest[1..])?;
            Ok(Command::Announce { selector, route })
        }
        Some(&"withdraw") if rest.get(1) == Some(&"route") => {
            let route = RouteSpec::parse(&rest[1..])?;
            Ok(Command::Withdraw { selector, route })
        }
        Some(&"teardown") => {
            let message = if rest.len() > 1 { Some(rest[1..].join(" ")) } else { None };
            Ok(Command::Teardown { selector, message })
        }
        Some(&"reload") => Ok(Command::Reload),
        Some(&"restart") => Ok(Command::Restart),
        Some(&"shutdown") => {
            let message = if rest.len() > 1 { Some(rest[1..].join(" ")) } else { None };
            Ok(Command::Shutdown { message })
        }
        Some(&"show") if rest.get(1) == Some(&"neighbor") => Ok(Command::ShowNeighbor { selector }),
        Some(&"show") if rest.get(1) == Some(&"adj-rib") => match rest.get(2) {
            Some(&"in") => Ok(Command::ShowAdjRib { selector, direction: RibDirection::In }),
            Some(&"out") => Ok(Command::ShowAdjRib { selector, direction: RibDirection::Out }),
            _ => Err(ApiError::MalformedCommand("'show adj-rib' requires 'in' or 'out'".into())),
        },
        Some(&"flush") if rest.get(1) == Some(&"adj-rib") && rest.get(2) == Some(&"out") => {
            Ok(Command::FlushAdjRibOut { selector })
        }
        Some(&"clear") if rest.get(1) == Some(&"adj-rib") && rest.get(2) == Some(&"out") => {
            Ok(Command::ClearAdjRibOut { selector })
        }
        Some(&"route-refresh") => Ok(Command::RouteRefresh { selector }),
        Some(&"watchdog") => match rest.get(1) {
            Some(&"enable") => {
                let tag = rest.get(2).ok_or_else(|| {
                    ApiError::MalformedCommand("'watchdog enable' requires a tag".into())
                })?;
                Ok(Command::WatchdogEnable { tag: tag.to_string() })
            }
            Some(&"disable") => {
                let tag = rest.get(2).ok_or_else(|| {
                    ApiError::MalformedCommand("'watchdog disable' requires a tag".into())
                })?;
                Ok(Command::WatchdogDisable { tag: tag.to_string() })
            }
            _ => Err(ApiError::MalformedCommand("'watchdog' requires 'enable'/'disable'".into())),
        },
        Some(&"queue-status") => Ok(Command::QueueStatus),
        Some(verb) => Err(ApiError::UnknownCommand(verb.to_string())),
        None => Err(ApiError::MalformedCommand("missing verb".into())),
    }
}

// ===== Responses (§4.C10 "Responses") =====

/// One outcome reported back to an API connection: either a terminal
/// `done`/`error` ACK, or a query result rendered as its own line(s).
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Done,
    Error { message: String },
    Text { body: String },
}

impl Response {
    /// Renders this response for `encoding`, honoring `ack_mode` (§4.C10
    /// "ACK policy is per-connection and tri-state"). Returns `None` when
    /// the connection's ACK mode suppresses this response entirely.
    pub fn render(&self, encoding: ApiEncoding, ack_mode: AckMode) -> Option<String> {
        match (self, ack_mode) {
            (Response::Done, AckMode::Enabled) => Some(render_line(encoding, self)),
            (Response::Done, AckMode::Silenced | AckMode::Disabled) => None,
            (Response::Error { .. }, AckMode::Disabled) => None,
            (Response::Error { .. }, _) => Some(render_line(encoding, self)),
            (Response::Text { .. }, AckMode::Disabled) => None,
            (Response::Text { .. }, _) => Some(render_line(encoding, self)),
        }
    }
}

fn render_line(encoding: ApiEncoding, response: &Response) -> String {
    match encoding {
        ApiEncoding::Json => serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string()),
        ApiEncoding::Text => match response {
            Response::Done => "done".to_string(),
            Response::Error { message } => format!("error: {message}"),
            Response::Text { body } => body.clone(),
        },
    }
}

/// Per-connection outgoing queue with the backpressure accounting of §6.3:
/// `write_with_backpressure` records the line then reports whether the
/// caller should suspend further command processing on this connection
/// until the queue drains below the low-water mark.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    lines: VecDeque<String>,
    bytes: usize,
}

impl OutgoingQueue {
    pub fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.lines.pop_front().inspect(|line| self.bytes -= line.len() + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.lines.len(), self.bytes)
    }

    /// Whether this queue has crossed the high-water mark and should
    /// suspend further drains into it (§4.C9 "Backpressure", §6.3).
    pub fn over_high_watermark(&self) -> bool {
        self.bytes >= QUEUE_HIGH_WATERMARK
    }

    /// Whether this queue has fallen back below the low-water mark and
    /// suspended work may resume.
    pub fn under_low_watermark(&self) -> bool {
        self.bytes < QUEUE_LOW_WATERMARK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_wildcard() {
        let tokens = ["*", "announce", "route", "10.0.0.0/24"];
        let (selector, rest) = NeighborSelector::parse(&tokens).unwrap();
        assert_eq!(selector, NeighborSelector::All);
        assert_eq!(rest, &tokens[1..]);
    }

    #[test]
    fn selector_parses_explicit_address() {
        let tokens = ["192.0.2.1", "announce", "route", "10.0.0.0/24"];
        let (selector, rest) = NeighborSelector::parse(&tokens).unwrap();
        assert_eq!(selector, NeighborSelector::Address("192.0.2.1".parse().unwrap()));
        assert_eq!(rest, &tokens[1..]);
    }

    #[test]
    fn selector_parses_attribute_conjunction() {
        let tokens = ["peer-as", "65000", "local-as", "65001", "announce"];
        let (selector, rest) = NeighborSelector::parse(&tokens).unwrap();
        assert_eq!(
            selector,
            NeighborSelector::Attributes(vec![SelectorAttr::PeerAs(65000), SelectorAttr::LocalAs(65001)])
        );
        assert_eq!(rest, &["announce"]);
    }

    #[test]
    fn parse_announce_route_scenario() {
        let cmd = parse_command("announce route 10.0.0.0/24 next-hop 192.0.2.1 med 100").unwrap();
        match cmd {
            Command::Announce { selector, route } => {
                assert_eq!(selector, NeighborSelector::All);
                assert_eq!(route.prefix, Some("10.0.0.0".parse().unwrap()));
                assert_eq!(route.prefix_len, Some(24));
                assert_eq!(route.next_hop, Some("192.0.2.1".parse().unwrap()));
                assert_eq!(route.med, Some(100));
            }
            _ => panic!("expected Announce"),
        }
    }

    #[test]
    fn parse_neighbor_prefixed_withdraw() {
        let cmd = parse_command("neighbor 192.0.2.1 withdraw route 10.0.0.0/24").unwrap();
        match cmd {
            Command::Withdraw { selector, route } => {
                assert_eq!(selector, NeighborSelector::Address("192.0.2.1".parse().unwrap()));
                assert_eq!(route.prefix, Some("10.0.0.0".parse().unwrap()));
            }
            _ => panic!("expected Withdraw"),
        }
    }

    #[test]
    fn parse_show_adj_rib() {
        let cmd = parse_command("show adj-rib out").unwrap();
        assert!(matches!(cmd, Command::ShowAdjRib { direction: RibDirection::Out, .. }));
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = parse_command("frobnicate everything").unwrap_err();
        assert!(matches!(err, ApiError::UnknownCommand(ref v) if v == "frobnicate"));
    }

    #[test]
    fn response_rendering_respects_silenced_ack_mode() {
        assert_eq!(Response::Done.render(ApiEncoding::Text, AckMode::Silenced), None);
        assert_eq!(
            Response::Error { message: "oops".into() }.render(ApiEncoding::Text, AckMode::Silenced),
            Some("error: oops".to_string())
        );
        assert_eq!(Response::Done.render(ApiEncoding::Text, AckMode::Enabled), Some("done".to_string()));
    }

    #[test]
    fn queue_tracks_watermarks() {
        let mut queue = OutgoingQueue::default();
        queue.push("x".repeat(10));
        assert!(!queue.over_high_watermark());
        assert!(queue.under_low_watermark());
    }
}
