//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Adj-RIB-Out invariants (§3 "Adj-RIB-Out", §4.C7): idempotent enqueue,
//! drain/commit, flush, and watchdog-driven mass disable/enable.

use std::net::Ipv4Addr;

use exabgp_core::packet::attribute::{Attribute, AttributeCollection, EncodeCxt};
use exabgp_core::packet::cache::AttributeCache;
use exabgp_core::packet::consts::{AddressFamily, Origin, Safi};
use exabgp_core::packet::nlri::{Ipv4Prefix, Nlri};
use exabgp_core::rib::{AdjRibOut, Change};

const CXT: EncodeCxt = EncodeCxt { four_octet_asn: true };

fn nlri(a: u8, b: u8, c: u8, d: u8, len: u8) -> Nlri {
    Nlri::Ipv4Unicast {
        prefix: Ipv4Prefix { len, addr: Ipv4Addr::new(a, b, c, d) },
        path_id: None,
    }
}

fn attrs(cache: &mut AttributeCache) -> AttributeCollection {
    let mut attrs = AttributeCollection::new();
    attrs.insert(Attribute::Origin(Origin::Igp), cache).unwrap();
    attrs.insert(Attribute::AsPath(Default::default()), cache).unwrap();
    attrs
}

#[test]
fn announce_drains_and_commits_into_sent() {
    let mut cache = AttributeCache::new(64);
    let mut rib = AdjRibOut::new((AddressFamily::Ipv4, Safi::Unicast));
    let change = Change::announce(nlri(10, 0, 0, 0, 24), attrs(&mut cache), None);
    rib.enqueue(change);
    assert_eq!(rib.pending_len(), 1);

    let batch = rib.drain(4096, true, CXT);
    assert!(!batch.is_empty());
    assert_eq!(batch.messages.len(), 1);
    rib.commit(&batch);

    assert_eq!(rib.pending_len(), 0);
    assert_eq!(rib.sent_len(), 1);
}

#[test]
fn redundant_announce_against_sent_state_is_a_no_op() {
    let mut cache = AttributeCache::new(64);
    let mut rib = AdjRibOut::new((AddressFamily::Ipv4, Safi::Unicast));
    let route_attrs = attrs(&mut cache);
    rib.enqueue(Change::announce(nlri(10, 0, 0, 0, 24), route_attrs.clone(), None));
    let batch = rib.drain(4096, true, CXT);
    rib.commit(&batch);
    assert_eq!(rib.sent_len(), 1);

    // Re-announcing the exact same route/attrs/next-hop must not create a
    // pending change (§4.C7 idempotent enqueue).
    rib.enqueue(Change::announce(nlri(10, 0, 0, 0, 24), route_attrs, None));
    assert_eq!(rib.pending_len(), 0);
}

#[test]
fn withdraw_of_unknown_route_is_dropped() {
    let mut rib = AdjRibOut::new((AddressFamily::Ipv4, Safi::Unicast));
    rib.enqueue(Change::withdraw(nlri(10, 0, 0, 0, 24)));
    assert_eq!(rib.pending_len(), 0);
}

#[test]
fn flush_requeues_every_sent_route_as_a_withdraw() {
    let mut cache = AttributeCache::new(64);
    let mut rib = AdjRibOut::new((AddressFamily::Ipv4, Safi::Unicast));
    rib.enqueue(Change::announce(nlri(10, 0, 0, 0, 24), attrs(&mut cache), None));
    rib.enqueue(Change::announce(nlri(10, 0, 1, 0, 24), attrs(&mut cache), None));
    let batch = rib.drain(4096, true, CXT);
    rib.commit(&batch);
    assert_eq!(rib.sent_len(), 2);

    rib.flush();
    assert_eq!(rib.pending_len(), 2);
    let batch = rib.drain(4096, true, CXT);
    rib.commit(&batch);
    assert_eq!(rib.sent_len(), 0);
}

#[test]
fn watchdog_disable_then_enable_round_trips_the_route() {
    let mut cache = AttributeCache::new(64);
    let mut rib = AdjRibOut::new((AddressFamily::Ipv4, Safi::Unicast));
    let change = Change::announce(nlri(10, 0, 0, 0, 24), attrs(&mut cache), None)
        .with_watchdog("maintenance");
    rib.enqueue(change);
    let batch = rib.drain(4096, true, CXT);
    rib.commit(&batch);
    assert_eq!(rib.sent_len(), 1);

    rib.watchdog_disable("maintenance");
    assert_eq!(rib.pending_len(), 1);
    let batch = rib.drain(4096, true, CXT);
    assert!(!batch.is_empty());
    rib.commit(&batch);
    // The route stays in `sent` (disabled), not withdrawn from the table.
    assert_eq!(rib.sent_len(), 1);

    rib.watchdog_enable("maintenance");
    assert_eq!(rib.pending_len(), 1);
}
