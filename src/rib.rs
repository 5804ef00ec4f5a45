//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-peer Adj-RIB-Out (§3 "Adj-RIB-Out", §4.C7). Each peer owns one
//! [`AdjRibOut`] per negotiated family; the reactor never touches these
//! directly, only through the peer that owns them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use bytes::{Bytes, BytesMut};

use crate::packet::attribute::{Attribute, AttributeCollection, EncodeCxt, MpReachNlri, MpUnreachNlri};
use crate::packet::consts::{AddressFamily, Safi};
use crate::packet::message::{self, Message, UpdateMsg};
use crate::packet::nlri::{Action, Family, Nlri};

/// The classic family whose routes travel in the UPDATE's outer
/// withdrawn/NLRI sections rather than inside MP_REACH/MP_UNREACH.
const CLASSIC: Family = (AddressFamily::Ipv4, Safi::Unicast);

/// The atomic unit between the API plane and a peer's Adj-RIB-Out (§3
/// "Change"). `attrs`/`next_hop` are `None` for withdrawals; `next_hop` is
/// only meaningful for families whose next hop travels inside MP_REACH_NLRI
/// rather than as a classic NEXT_HOP attribute.
#[derive(Clone, Debug)]
pub struct Change {
    pub action: Action,
    pub nlri: Nlri,
    pub attrs: Option<AttributeCollection>,
    pub next_hop: Option<IpAddr>,
    pub watchdog: Option<String>,
}

impl Change {
    pub fn announce(nlri: Nlri, attrs: AttributeCollection, next_hop: Option<IpAddr>) -> Change {
        Change { action: Action::Announce, nlri, attrs: Some(attrs), next_hop, watchdog: None }
    }

    pub fn withdraw(nlri: Nlri) -> Change {
        Change { action: Action::Withdraw, nlri, attrs: None, next_hop: None, watchdog: None }
    }

    pub fn with_watchdog(mut self, tag: impl Into<String>) -> Change {
        self.watchdog = Some(tag.into());
        self
    }
}

#[derive(Clone, Debug)]
struct SentRoute {
    nlri: Nlri,
    attrs: AttributeCollection,
    next_hop: Option<IpAddr>,
    watchdog: Option<String>,
}

/// Result of a [`AdjRibOut::drain`] call: the wire messages to send plus the
/// set of indices that were actually drained, so the caller can decide when
/// to [`AdjRibOut::commit`] them (after the write actually succeeds).
#[derive(Debug, Default)]
pub struct DrainBatch {
    pub messages: Vec<Message>,
    drained: Vec<(Bytes, Action)>,
}

impl DrainBatch {
    pub fn is_empty(&self) -> bool {
        self.drained.is_empty()
    }
}

/// Per-(peer, family) Adj-RIB-Out: `pending` changes awaiting transmission,
/// `sent` the last transmitted state keyed by NLRI index (§3, §4.C7).
#[derive(Debug)]
pub struct AdjRibOut {
    family: Family,
    pending: BTreeMap<Bytes, Change>,
    sent: BTreeMap<Bytes, SentRoute>,
    /// Indices currently disabled by a watchdog tag: still present in
    /// `sent` (so `enable` can resurrect them) but treated as absent on the
    /// wire.
    disabled: BTreeSet<Bytes>,
}

impl AdjRibOut {
    pub fn new(family: Family) -> AdjRibOut {
        AdjRibOut {
            family,
            pending: BTreeMap::new(),
            sent: BTreeMap::new(),
            disabled: BTreeSet::new(),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_pending_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Idempotent enqueue (§4.C7): replaces any existing pending entry for
    /// the same index; drops announces that would be a no-op against `sent`.
    pub fn enqueue(&mut self, change: Change) {
        let index = change.nlri.index();
        match change.action {
            Action::Announce => {
                if let Some(sent) = self.sent.get(&index) {
                    if !self.disabled.contains(&index)
                        && Some(&sent.attrs) == change.attrs.as_ref()
                        && sent.next_hop == change.next_hop
                    {
                        self.pending.remove(&index);
                        return;
                    }
                }
            }
            Action::Withdraw => {
                if !self.sent.contains_key(&index) && !self.pending.contains_key(&index) {
                    return;
                }
            }
        }
        self.pending.insert(index, change);
    }

    /// Selects up to `limit` bytes of pending changes and builds the wire
    /// UPDATE(s) for them (§4.C7 `drain`). Withdrawals are emitted before
    /// announcements, as required by §4.C4/§8 for a given family.
    pub fn drain(&mut self, limit: usize, group_updates: bool, cxt: EncodeCxt) -> DrainBatch {
        let mut batch = DrainBatch::default();
        if self.pending.is_empty() {
            return batch;
        }

        let mut withdraws = Vec::new();
        let mut announces: Vec<(Bytes, &Change)> = Vec::new();
        for (index, change) in &self.pending {
            match change.action {
                Action::Withdraw => withdraws.push((index.clone(), change.nlri.clone())),
                Action::Announce => announces.push((index.clone(), change)),
            }
        }

        emit_withdraws(self.family, &withdraws, limit, &mut batch);

        if group_updates {
            emit_grouped_announces(self.family, &announces, limit, cxt, &mut batch);
        } else {
            for (index, change) in &announces {
                let mut single = Vec::new();
                single.push((index.clone(), *change));
                emit_grouped_announces(self.family, &single, limit, cxt, &mut batch);
            }
        }

        batch
    }

    /// Moves a drained batch's changes from `pending` into `sent` (or out of
    /// `sent` for withdrawals). Only ever called after the caller has
    /// actually queued the batch's messages for transmission.
    pub fn commit(&mut self, batch: &DrainBatch) {
        for (index, action) in &batch.drained {
            match action {
                Action::Withdraw => {
                    self.pending.remove(index);
                    // A watchdog-disabled route's withdraw is a pseudo-
                    // withdraw: the route stays in `sent` so `enable` can
                    // restore it verbatim. A genuine withdraw removes it.
                    if !self.disabled.contains(index) {
                        self.sent.remove(index);
                    }
                }
                Action::Announce => {
                    if let Some(change) = self.pending.remove(index) {
                        self.disabled.remove(index);
                        self.sent.insert(
                            index.clone(),
                            SentRoute {
                                nlri: change.nlri,
                                attrs: change.attrs.expect("announce change carries attrs"),
                                next_hop: change.next_hop,
                                watchdog: change.watchdog,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Marks every `sent` entry as a pending withdraw, without touching
    /// `sent` itself (`flush adj-rib out`).
    pub fn flush(&mut self) {
        for (index, route) in &self.sent {
            self.pending.insert(index.clone(), Change::withdraw(route.nlri.clone()));
        }
    }

    /// Drops `pending` without emitting anything (`clear adj-rib out`).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Re-queues every `sent` entry as an announce, used when an incoming
    /// ROUTE-REFRESH asks us to replay our Adj-RIB-Out for this family.
    pub fn resend(&mut self) {
        for (index, route) in &self.sent {
            self.pending.insert(
                index.clone(),
                Change {
                    action: Action::Announce,
                    nlri: route.nlri.clone(),
                    attrs: Some(route.attrs.clone()),
                    next_hop: route.next_hop,
                    watchdog: route.watchdog.clone(),
                },
            );
        }
    }

    /// Mass-disables every `sent` entry tagged `tag`: re-queues them as
    /// withdraws while remembering them in `sent` so `enable` can restore
    /// them verbatim.
    pub fn watchdog_disable(&mut self, tag: &str) {
        let indices: Vec<Bytes> = self
            .sent
            .iter()
            .filter(|(index, route)| {
                route.watchdog.as_deref() == Some(tag) && !self.disabled.contains(*index)
            })
            .map(|(index, _)| index.clone())
            .collect();
        for index in indices {
            let route = &self.sent[&index];
            self.pending.insert(index.clone(), Change::withdraw(route.nlri.clone()));
            self.disabled.insert(index);
        }
    }

    /// Reverses `watchdog_disable` for every entry tagged `tag`.
    pub fn watchdog_enable(&mut self, tag: &str) {
        let indices: Vec<Bytes> = self
            .disabled
            .iter()
            .filter(|index| self.sent.get(*index).and_then(|r| r.watchdog.as_deref()) == Some(tag))
            .cloned()
            .collect();
        for index in indices {
            let route = &self.sent[&index];
            self.pending.insert(
                index.clone(),
                Change {
                    action: Action::Announce,
                    nlri: route.nlri.clone(),
                    attrs: Some(route.attrs.clone()),
                    next_hop: route.next_hop,
                    watchdog: route.watchdog.clone(),
                },
            );
            self.disabled.remove(&index);
        }
    }
}

fn emit_withdraws(family: Family, withdraws: &[(Bytes, Nlri)], limit: usize, batch: &mut DrainBatch) {
    if withdraws.is_empty() {
        return;
    }
    if family == CLASSIC {
        for chunk in chunk_by_size(withdraws.iter().map(|(_, n)| n.clone()).collect(), limit) {
            let indices: Vec<Bytes> = withdraws
                .iter()
                .filter(|(_, n)| chunk.iter().any(|c| c.index() == n.index()))
                .map(|(i, _)| i.clone())
                .collect();
            let msg = UpdateMsg::new(chunk, AttributeCollection::new(), Vec::new());
            batch.messages.push(Message::Update(msg));
            batch.drained.extend(indices.into_iter().map(|i| (i, Action::Withdraw)));
        }
    } else {
        for chunk in chunk_by_size(withdraws.iter().map(|(_, n)| n.clone()).collect(), limit) {
            let indices: Vec<Bytes> = withdraws
                .iter()
                .filter(|(_, n)| chunk.iter().any(|c| c.index() == n.index()))
                .map(|(i, _)| i.clone())
                .collect();
            let mut attrs = AttributeCollection::new();
            let mut cache = crate::packet::cache::AttributeCache::new(1);
            let _ = attrs.insert(
                Attribute::MpUnreachNlri(MpUnreachNlri { family, nlri: chunk }),
                &mut cache,
            );
            let msg = UpdateMsg::new(Vec::new(), attrs, Vec::new());
            batch.messages.push(Message::Update(msg));
            batch.drained.extend(indices.into_iter().map(|i| (i, Action::Withdraw)));
        }
    }
}

fn emit_grouped_announces(
    family: Family,
    announces: &[(Bytes, &Change)],
    limit: usize,
    cxt: EncodeCxt,
    batch: &mut DrainBatch,
) {
    let mut groups: BTreeMap<Vec<u8>, (AttributeCollection, Option<IpAddr>, Vec<(Bytes, Nlri)>)> =
        BTreeMap::new();
    for (index, change) in announces {
        let attrs = change.attrs.clone().unwrap_or_default();
        let key = group_key(&attrs, change.next_hop);
        let entry = groups.entry(key).or_insert_with(|| (attrs.clone(), change.next_hop, Vec::new()));
        entry.2.push((index.clone(), change.nlri.clone()));
    }

    let mut cache = crate::packet::cache::AttributeCache::new(1);
    for (_key, (attrs, next_hop, members)) in groups {
        let nlris: Vec<Nlri> = members.iter().map(|(_, n)| n.clone()).collect();
        for chunk in chunk_by_size(nlris, limit) {
            let indices: Vec<Bytes> = members
                .iter()
                .filter(|(_, n)| chunk.iter().any(|c| c.index() == n.index()))
                .map(|(i, _)| i.clone())
                .collect();
            if family == CLASSIC {
                let msg = UpdateMsg::new(Vec::new(), attrs.clone(), chunk);
                batch.messages.push(Message::Update(msg));
            } else {
                let mut msg_attrs = attrs.clone();
                let nexthop_bytes = match next_hop {
                    Some(IpAddr::V4(v4)) => Bytes::copy_from_slice(&v4.octets()),
                    Some(IpAddr::V6(v6)) => Bytes::copy_from_slice(&v6.octets()),
                    None => Bytes::new(),
                };
                let _ = msg_attrs.insert(
                    Attribute::MpReachNlri(MpReachNlri { family, nexthop: nexthop_bytes, nlri: chunk }),
                    &mut cache,
                );
                let msg = UpdateMsg::new(Vec::new(), msg_attrs, Vec::new());
                batch.messages.push(Message::Update(msg));
            }
            batch.drained.extend(indices.into_iter().map(|i| (i, Action::Announce)));
        }
    }
    let _ = cxt;
}

/// Packs `nlris` into groups whose encoded size stays within `limit` bytes
/// (an approximation of the `max_message_size` cap, §4.C4 "Encoding
/// UPDATE"). Always makes progress: a single oversized NLRI gets its own
/// group rather than stalling the drain.
fn chunk_by_size(nlris: Vec<Nlri>, limit: usize) -> Vec<Vec<Nlri>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0usize;
    for nlri in nlris {
        let mut buf = BytesMut::new();
        nlri.encode(&mut buf);
        let len = buf.len();
        if !current.is_empty() && current_len + len > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += len;
        current.push(nlri);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn group_key(attrs: &AttributeCollection, next_hop: Option<IpAddr>) -> Vec<u8> {
    let mut key = Vec::new();
    for attr in attrs.iter() {
        key.push(attr.code());
        key.extend_from_slice(&attr.packed_bytes());
    }
    match next_hop {
        Some(IpAddr::V4(v4)) => key.extend_from_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => key.extend_from_slice(&v6.octets()),
        None => {}
    }
    key
}

/// A peer's Adj-RIB-Out across every negotiated family.
#[derive(Debug, Default)]
pub struct PeerRib {
    tables: BTreeMap<Family, AdjRibOut>,
}

impl PeerRib {
    pub fn new() -> PeerRib {
        PeerRib::default()
    }

    pub fn table(&mut self, family: Family) -> &mut AdjRibOut {
        self.tables.entry(family).or_insert_with(|| AdjRibOut::new(family))
    }

    pub fn get(&self, family: Family) -> Option<&AdjRibOut> {
        self.tables.get(&family)
    }

    pub fn families(&self) -> impl Iterator<Item = &Family> {
        self.tables.keys()
    }

    pub fn retain_families(&mut self, keep: &BTreeSet<Family>) {
        self.tables.retain(|family, _| keep.contains(family));
    }
}

/// The 19-byte End-of-RIB marker for the classic family (RFC 4724 §2); other
/// families use an UPDATE carrying an empty `MP_UNREACH_NLRI` for that
/// family instead (see [`eor_message`]).
pub fn classic_eor() -> Message {
    Message::Update(UpdateMsg::default())
}

/// Builds the End-of-RIB marker UPDATE for `family` (§3 "Message", §4.C4
/// "End-of-RIB detection", §8 scenario 5).
pub fn eor_message(family: Family) -> Message {
    if family == CLASSIC {
        return classic_eor();
    }
    let mut attrs = AttributeCollection::new();
    let mut cache = crate::packet::cache::AttributeCache::new(1);
    let _ = attrs.insert(
        Attribute::MpUnreachNlri(MpUnreachNlri { family, nlri: Vec::new() }),
        &mut cache,
    );
    Message::Update(UpdateMsg::new(Vec::new(), attrs, Vec::new()))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::ip::IpAddrExt;
    use crate::packet::attribute::{AsPath, Origin};
    use crate::packet::consts::AttrType;
    use crate::packet::nlri::{Action as NlriAction, Ipv4Prefix};

    use super::*;

    fn ipv4_prefix(addr: Ipv4Addr, len: u8) -> Nlri {
        Nlri::Ipv4Unicast { prefix: Ipv4Prefix { addr, len }, path_id: None }
    }

    fn sample_attrs() -> AttributeCollection {
        let mut attrs = AttributeCollection::new();
        let mut cache = crate::packet::cache::AttributeCache::new(16);
        attrs.insert(Attribute::Origin(Origin::Igp), &mut cache).unwrap();
        attrs
            .insert(Attribute::AsPath(AsPath { segments: Vec::new() }), &mut cache)
            .unwrap();
        attrs.insert(Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)), &mut cache).unwrap();
        attrs
    }

    #[test]
    fn announce_of_identical_sent_route_is_noop() {
        let mut rib = AdjRibOut::new(CLASSIC);
        let nlri = ipv4_prefix(Ipv4Addr::new(10, 0, 0, 0), 24);
        let attrs = sample_attrs();
        let change = Change::announce(nlri.clone(), attrs.clone(), None);
        rib.enqueue(change.clone());
        let cxt = EncodeCxt { four_octet_asn: true };
        let batch = rib.drain(usize::MAX, true, cxt);
        assert_eq!(batch.messages.len(), 1);
        rib.commit(&batch);
        assert_eq!(rib.sent_len(), 1);

        rib.enqueue(Change::announce(nlri, attrs, None));
        assert_eq!(rib.pending_len(), 0);
    }

    #[test]
    fn withdraw_of_unknown_route_is_noop() {
        let mut rib = AdjRibOut::new(CLASSIC);
        rib.enqueue(Change::withdraw(ipv4_prefix(Ipv4Addr::new(10, 0, 0, 0), 24)));
        assert_eq!(rib.pending_len(), 0);
    }

    #[test]
    fn watchdog_disable_then_enable_round_trips() {
        let mut rib = AdjRibOut::new(CLASSIC);
        let nlri = ipv4_prefix(Ipv4Addr::new(10, 0, 0, 0), 24);
        let change = Change::announce(nlri, sample_attrs(), None).with_watchdog("grp1");
        rib.enqueue(change);
        let cxt = EncodeCxt { four_octet_asn: true };
        let batch = rib.drain(usize::MAX, true, cxt);
        rib.commit(&batch);

        rib.watchdog_disable("grp1");
        assert_eq!(rib.pending_len(), 1);
        let batch = rib.drain(usize::MAX, true, cxt);
        assert!(matches!(batch.messages[0], Message::Update(ref u) if !u.withdrawn.is_empty()));
        rib.commit(&batch);
        assert_eq!(rib.sent_len(), 1);

        rib.watchdog_enable("grp1");
        assert_eq!(rib.pending_len(), 1);
        let batch = rib.drain(usize::MAX, true, cxt);
        assert!(matches!(batch.messages[0], Message::Update(ref u) if !u.nlri.is_empty()));
    }

    #[test]
    fn eor_for_non_classic_family_is_empty_mp_unreach() {
        let family = (AddressFamily::Ipv6, Safi::Unicast);
        let msg = eor_message(family);
        match msg {
            Message::Update(update) => {
                assert_eq!(update.eor_family(), Some(family));
            }
            _ => panic!("expected an UPDATE"),
        }
    }

    #[test]
    fn unused_action_variant_reference() {
        let _ = NlriAction::Announce;
        let _ = message::HEADER_LEN;
        let _ = IpAddr::V4(Ipv4Addr::UNSPECIFIED).is_unspecified_addr();
    }
}
