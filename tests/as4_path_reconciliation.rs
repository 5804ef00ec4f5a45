//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! RFC 6793 §4.2.3 AS4_PATH/AS4_AGGREGATOR reconciliation, exercised at the
//! UPDATE message boundary: a two-octet-ASN session carrying AS_TRANS plus
//! AS4_PATH/AS4_AGGREGATOR must come out of decode with a single merged
//! AS_PATH/AGGREGATOR and no trace of the AS4 attributes.

use bytes::BytesMut;
use const_addrs::ip4;
use exabgp_core::packet::attribute::{
    Aggregator, Attribute, AsPath, AsPathSegment, AttributeCollection, DecodeCxt, EncodeCxt,
};
use exabgp_core::packet::cache::AttributeCache;
use exabgp_core::packet::consts::{AsPathSegmentType, AttrType, Origin};
use exabgp_core::packet::message::UpdateMsg;
use exabgp_core::packet::nlri::{Ipv4Prefix, Nlri};

fn sequence(members: &[u32]) -> AsPath {
    AsPath {
        segments: vec![AsPathSegment { seg_type: AsPathSegmentType::Sequence, members: members.to_vec() }],
    }
}

#[test]
fn decode_folds_as4_path_and_as4_aggregator_into_as2_attributes() {
    let mut cache = AttributeCache::new(64);
    let mut attrs = AttributeCollection::new();
    attrs.insert(Attribute::Origin(Origin::Igp), &mut cache).unwrap();
    attrs.insert(Attribute::AsPath(sequence(&[23456, 23456])), &mut cache).unwrap();
    attrs.insert(Attribute::NextHop(ip4!("192.0.2.1")), &mut cache).unwrap();
    attrs
        .insert(Attribute::As4Path(sequence(&[65001, 65002])), &mut cache)
        .unwrap();
    attrs
        .insert(
            Attribute::Aggregator(Aggregator { asn: 23456, identifier: ip4!("192.0.2.1") }),
            &mut cache,
        )
        .unwrap();
    attrs
        .insert(
            Attribute::As4Aggregator(Aggregator { asn: 4_200_000_000, identifier: ip4!("192.0.2.1") }),
            &mut cache,
        )
        .unwrap();

    let nlri = Nlri::Ipv4Unicast { prefix: Ipv4Prefix { len: 24, addr: ip4!("198.51.100.0") }, path_id: None };
    let msg = UpdateMsg::new(Vec::new(), attrs, vec![nlri]);

    let mut buf = BytesMut::new();
    msg.encode(&mut buf, EncodeCxt { four_octet_asn: false });

    let dcxt = DecodeCxt { four_octet_asn: false, peer_as: 65002, is_external: true, ..Default::default() };
    let decoded = UpdateMsg::decode(buf.freeze(), &dcxt, &mut cache).unwrap();

    assert!(decoded.attrs.get_type(AttrType::As4Path).is_none());
    assert!(decoded.attrs.get_type(AttrType::As4Aggregator).is_none());

    match decoded.attrs.get_type(AttrType::AsPath).unwrap() {
        Attribute::AsPath(path) => assert_eq!(*path, sequence(&[65001, 65002])),
        other => panic!("expected AsPath, got {other:?}"),
    }
    match decoded.attrs.get_type(AttrType::Aggregator).unwrap() {
        Attribute::Aggregator(agg) => {
            assert_eq!(agg.asn, 4_200_000_000);
            assert_eq!(agg.identifier, ip4!("192.0.2.1"));
        }
        other => panic!("expected Aggregator, got {other:?}"),
    }
}

#[test]
fn decode_is_a_no_op_when_as4_attributes_are_absent() {
    let mut cache = AttributeCache::new(64);
    let mut attrs = AttributeCollection::new();
    attrs.insert(Attribute::Origin(Origin::Igp), &mut cache).unwrap();
    attrs.insert(Attribute::AsPath(sequence(&[65010])), &mut cache).unwrap();
    attrs.insert(Attribute::NextHop(ip4!("192.0.2.1")), &mut cache).unwrap();

    let nlri = Nlri::Ipv4Unicast { prefix: Ipv4Prefix { len: 24, addr: ip4!("198.51.100.0") }, path_id: None };
    let msg = UpdateMsg::new(Vec::new(), attrs, vec![nlri]);

    let mut buf = BytesMut::new();
    msg.encode(&mut buf, EncodeCxt { four_octet_asn: false });

    let dcxt = DecodeCxt { four_octet_asn: false, peer_as: 65010, is_external: true, ..Default::default() };
    let decoded = UpdateMsg::decode(buf.freeze(), &dcxt, &mut cache).unwrap();

    match decoded.attrs.get_type(AttrType::AsPath).unwrap() {
        Attribute::AsPath(path) => assert_eq!(*path, sequence(&[65010])),
        other => panic!("expected AsPath, got {other:?}"),
    }
}
