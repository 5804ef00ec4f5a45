//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Attribute codec (§4.C2). Each attribute is a variant of the closed
//! [`Attribute`] sum type rather than a registered class; construction from
//! wire bytes stores the packed form (via [`Attribute::packed_bytes`]) so
//! that re-packing a canonical attribute is byte-identical to what was
//! received. [`AttributeCollection`] is the ordered, type-keyed set that
//! makes up the attribute block of an UPDATE.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::ip::AddressFamily;
use crate::packet::consts::{
    AigpType, AsPathSegmentType, AttrFlags, AttrType, Origin, Safi,
};
use crate::packet::error::AttrError;
use crate::packet::nlri::{Family, Nlri};

pub const ATTR_MIN_LEN: u16 = 3;
pub const ATTR_MIN_LEN_EXT: u16 = 4;

/// Per-attribute contract: how a second occurrence of the same type code in
/// one UPDATE is handled (§3 "Attribute", §4.C2 table).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DuplicatePolicy {
    Forbidden,
    Merge,
    LastWins,
}

/// How a single attribute's decode failure is handled (§4.C2 table, §7).
pub use crate::packet::error::AttrError as ParseErrorPolicy;

/// AS_PATH / AS4_PATH segment.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AsPathSegment {
    pub seg_type: AsPathSegmentType,
    pub members: Vec<u32>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AsPath {
    pub segments: Vec<AsPathSegment>,
}

impl AsPath {
    pub fn first_asn(&self) -> Option<u32> {
        self.segments
            .first()
            .filter(|s| s.seg_type == AsPathSegmentType::Sequence)
            .and_then(|s| s.members.first().copied())
    }

    pub fn path_length(&self) -> u32 {
        self.segments
            .iter()
            .map(|s| match s.seg_type {
                AsPathSegmentType::Set => 1,
                AsPathSegmentType::Sequence => s.members.len(),
                // RFC 5065 §5.3: CONFED segments are not counted.
                AsPathSegmentType::ConfedSequence | AsPathSegmentType::ConfedSet => 0,
            })
            .sum::<usize>() as u32
    }

    pub fn prepend(&mut self, asn: u32) {
        if let Some(seg) = self.segments.first_mut()
            && seg.seg_type == AsPathSegmentType::Sequence
            && seg.members.len() < 255
        {
            seg.members.insert(0, asn);
        } else {
            self.segments.insert(
                0,
                AsPathSegment { seg_type: AsPathSegmentType::Sequence, members: vec![asn] },
            );
        }
    }

    /// Reconciles an AS_PATH received from a non-AS4-capable peer with the
    /// AS4_PATH attribute it carried alongside (RFC 6793 §4.2.3). Per the
    /// RFC, if AS4_PATH is no longer than AS_PATH the new path is the
    /// leading `path_length(AS_PATH) - path_length(AS4_PATH)` AS numbers of
    /// AS_PATH followed by AS4_PATH in full; otherwise AS4_PATH is malformed
    /// relative to AS_PATH and is ignored.
    pub fn reconcile_as4(&self, as4: &AsPath) -> AsPath {
        let as4_len = as4.path_length();
        if as4_len == 0 {
            return self.clone();
        }
        let as2_len = self.path_length();
        if as2_len < as4_len {
            return self.clone();
        }

        let mut remaining = as2_len - as4_len;
        let mut segments = Vec::new();
        for seg in &self.segments {
            match seg.seg_type {
                AsPathSegmentType::ConfedSequence | AsPathSegmentType::ConfedSet => {
                    segments.push(seg.clone());
                }
                AsPathSegmentType::Set => {
                    if remaining == 0 {
                        break;
                    }
                    segments.push(seg.clone());
                    remaining -= 1;
                }
                AsPathSegmentType::Sequence => {
                    if remaining == 0 {
                        break;
                    }
                    if seg.members.len() <= remaining as usize {
                        remaining -= seg.members.len() as u32;
                        segments.push(seg.clone());
                    } else {
                        segments.push(AsPathSegment {
                            seg_type: AsPathSegmentType::Sequence,
                            members: seg.members[..remaining as usize].to_vec(),
                        });
                        remaining = 0;
                    }
                }
            }
        }
        segments.extend(as4.segments.iter().cloned());
        AsPath { segments }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Aggregator {
    pub asn: u32,
    pub identifier: Ipv4Addr,
}

impl Aggregator {
    /// Reconciles an AGGREGATOR received with `AS_TRANS` against the
    /// AS4_AGGREGATOR carried alongside it (RFC 6793 §4.2.3): the real ASN
    /// wins, the router ID is unchanged.
    pub fn reconcile_as4(&self, as4: &Aggregator) -> Aggregator {
        if self.asn == u32::from(crate::packet::consts::AS_TRANS) {
            *as4
        } else {
            *self
        }
    }
}

/// PMSI Tunnel attribute (RFC 6514).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PmsiTunnel {
    pub flags: u8,
    pub tunnel_type: u8,
    pub label: crate::ip::Label,
    pub identifier: Bytes,
}

/// BGP Prefix-SID sub-TLVs (RFC 8669, RFC 9252 for SRv6 services).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PrefixSidSubTlv {
    LabelIndex(u32),
    OriginatorSrgb(Vec<(u32, u8)>),
    Srv6L3Service(Bytes),
    Srv6L2Service(Bytes),
    Unknown { sub_type: u8, value: Bytes },
}

/// MP_REACH_NLRI (§4.C2 table, type 14): the next hop carried here, not per
/// NLRI, for every multiprotocol family.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MpReachNlri {
    pub family: Family,
    pub nexthop: Bytes,
    pub nlri: Vec<Nlri>,
}

/// MP_UNREACH_NLRI (type 15).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MpUnreachNlri {
    pub family: Family,
    pub nlri: Vec<Nlri>,
}

/// The closed sum type over every path attribute this core understands.
/// `Unknown` preserves the exact bytes received so that unknown optional
/// transitive attributes survive a re-pack with the PARTIAL flag set
/// (§4.C4 "Unknown optional transitive").
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Attribute {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    Med(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    Communities(Vec<u32>),
    OriginatorId(Ipv4Addr),
    ClusterList(Vec<Ipv4Addr>),
    MpReachNlri(MpReachNlri),
    MpUnreachNlri(MpUnreachNlri),
    ExtCommunities(Vec<[u8; 8]>),
    As4Path(AsPath),
    As4Aggregator(Aggregator),
    PmsiTunnel(PmsiTunnel),
    Extv6Community(Vec<[u8; 20]>),
    Aigp(u64),
    BgpLs(Bytes),
    LargeCommunities(Vec<(u32, u32, u32)>),
    BgpPrefixSid(Vec<PrefixSidSubTlv>),
    Unknown { code: u8, flags: AttrFlags, value: Bytes },
}

/// Context needed to encode attributes whose wire form depends on the
/// negotiated session (ASN width).
#[derive(Clone, Copy, Debug)]
pub struct EncodeCxt {
    pub four_octet_asn: bool,
}

/// Context needed to decode attributes whose interpretation depends on the
/// negotiated session or the peer's configuration (§4.C2 "ASN width per
/// negotiated", first-AS check for eBGP).
#[derive(Clone, Debug, Default)]
pub struct DecodeCxt {
    pub four_octet_asn: bool,
    pub peer_as: u32,
    pub is_external: bool,
    /// Families for which the peer negotiated ADD-PATH on receive, per
    /// `Negotiated::add_path_mode` (§4.C5). Populated by the message codec
    /// before decoding UPDATE attributes; `Attribute::decode` itself stays
    /// free of the `Negotiated` type.
    pub add_path_families: std::collections::BTreeSet<Family>,
}

// ===== impl Attribute =====

impl Attribute {
    pub fn code(&self) -> u8 {
        match self {
            Attribute::Origin(..) => AttrType::Origin as u8,
            Attribute::AsPath(..) => AttrType::AsPath as u8,
            Attribute::NextHop(..) => AttrType::Nexthop as u8,
            Attribute::Med(..) => AttrType::Med as u8,
            Attribute::LocalPref(..) => AttrType::LocalPref as u8,
            Attribute::AtomicAggregate => AttrType::AtomicAggregate as u8,
            Attribute::Aggregator(..) => AttrType::Aggregator as u8,
            Attribute::Communities(..) => AttrType::Communities as u8,
            Attribute::OriginatorId(..) => AttrType::OriginatorId as u8,
            Attribute::ClusterList(..) => AttrType::ClusterList as u8,
            Attribute::MpReachNlri(..) => AttrType::MpReachNlri as u8,
            Attribute::MpUnreachNlri(..) => AttrType::MpUnreachNlri as u8,
            Attribute::ExtCommunities(..) => AttrType::ExtCommunities as u8,
            Attribute::As4Path(..) => AttrType::As4Path as u8,
            Attribute::As4Aggregator(..) => AttrType::As4Aggregator as u8,
            Attribute::PmsiTunnel(..) => AttrType::PmsiTunnel as u8,
            Attribute::Extv6Community(..) => AttrType::Extv6Community as u8,
            Attribute::Aigp(..) => AttrType::Aigp as u8,
            Attribute::BgpLs(..) => AttrType::BgpLs as u8,
            Attribute::LargeCommunities(..) => AttrType::LargeCommunity as u8,
            Attribute::BgpPrefixSid(..) => AttrType::BgpPrefixSid as u8,
            Attribute::Unknown { code, .. } => *code,
        }
    }

    /// The flags this attribute is required to carry on the wire (§4.C2
    /// "Flags required" column). `Unknown` keeps whatever flags were
    /// received, with PARTIAL forced on for optional transitive ones.
    pub fn flags(&self) -> AttrFlags {
        use Attribute::*;
        match self {
            Origin(..) | AsPath(..) | NextHop(..) | AtomicAggregate => {
                AttrFlags::TRANSITIVE
            }
            LocalPref(..) => AttrFlags::empty(),
            Med(..) => AttrFlags::OPTIONAL,
            Aggregator(..) | Communities(..) | ExtCommunities(..) | As4Path(..)
            | As4Aggregator(..) | PmsiTunnel(..) | Extv6Community(..)
            | LargeCommunities(..) | BgpPrefixSid(..) => {
                AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE
            }
            OriginatorId(..) | ClusterList(..) | MpReachNlri(..) | MpUnreachNlri(..)
            | Aigp(..) | BgpLs(..) => AttrFlags::OPTIONAL,
            Unknown { flags, .. } => *flags,
        }
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        match self {
            Attribute::Communities(..)
            | Attribute::ExtCommunities(..)
            | Attribute::Extv6Community(..)
            | Attribute::LargeCommunities(..) => DuplicatePolicy::Merge,
            Attribute::OriginatorId(..) | Attribute::ClusterList(..) => {
                DuplicatePolicy::LastWins
            }
            _ => DuplicatePolicy::Forbidden,
        }
    }

    /// §4.C2 table "Parse error" column, keyed purely on the attribute type
    /// (used when the *type* is recognized but the *value* fails to parse).
    pub fn parse_error_policy(code: AttrType) -> ParseErrorPolicy {
        match code {
            AttrType::AsPath | AttrType::MpReachNlri | AttrType::MpUnreachNlri => {
                ParseErrorPolicy::Reset
            }
            AttrType::As4Path | AttrType::As4Aggregator | AttrType::Aigp => {
                ParseErrorPolicy::Discard
            }
            AttrType::BgpLs => ParseErrorPolicy::AttributeDiscard,
            _ => ParseErrorPolicy::Withdraw,
        }
    }

    /// Merges another occurrence of the same type into `self`, per the
    /// "merge" duplicate policy (communities variants only).
    pub fn merge(&mut self, other: Attribute) {
        use itertools::Itertools;

        match (self, other) {
            (Attribute::Communities(a), Attribute::Communities(b)) => {
                *a = a.drain(..).chain(b).unique().collect();
            }
            (Attribute::ExtCommunities(a), Attribute::ExtCommunities(b)) => {
                *a = a.drain(..).chain(b).unique().collect();
            }
            (Attribute::Extv6Community(a), Attribute::Extv6Community(b)) => {
                *a = a.drain(..).chain(b).unique().collect();
            }
            (Attribute::LargeCommunities(a), Attribute::LargeCommunities(b)) => {
                *a = a.drain(..).chain(b).unique().collect();
            }
            _ => {}
        }
    }

    /// The packed value bytes (without flags/type/length header), used as
    /// the second half of the attribute cache key (§3 "content-addressed").
    pub fn packed_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_value(&mut buf, EncodeCxt { four_octet_asn: true });
        buf.freeze()
    }

    fn encode_value(&self, buf: &mut BytesMut, cxt: EncodeCxt) {
        match self {
            Attribute::Origin(origin) => buf.put_u8(origin.to_u8().unwrap()),
            Attribute::AsPath(path) => {
                for seg in &path.segments {
                    buf.put_u8(seg.seg_type as u8);
                    buf.put_u8(seg.members.len() as u8);
                    for asn in &seg.members {
                        encode_asn(buf, *asn, cxt.four_octet_asn);
                    }
                }
            }
            // AS4_PATH always carries 4-octet ASNs, regardless of the
            // session's negotiated width (RFC 6793 §4.2.2).
            Attribute::As4Path(path) => {
                for seg in &path.segments {
                    buf.put_u8(seg.seg_type as u8);
                    buf.put_u8(seg.members.len() as u8);
                    for asn in &seg.members {
                        encode_asn(buf, *asn, true);
                    }
                }
            }
            Attribute::NextHop(addr) => buf.put_slice(&addr.octets()),
            Attribute::Med(v) | Attribute::LocalPref(v) => buf.put_u32(*v),
            Attribute::AtomicAggregate => {}
            Attribute::Aggregator(agg) => {
                encode_asn(buf, agg.asn, cxt.four_octet_asn);
                buf.put_slice(&agg.identifier.octets());
            }
            Attribute::As4Aggregator(agg) => {
                encode_asn(buf, agg.asn, true);
                buf.put_slice(&agg.identifier.octets());
            }
            Attribute::Communities(list) => {
                for v in list {
                    buf.put_u32(*v);
                }
            }
            Attribute::OriginatorId(addr) => buf.put_slice(&addr.octets()),
            Attribute::ClusterList(list) => {
                for addr in list {
                    buf.put_slice(&addr.octets());
                }
            }
            Attribute::MpReachNlri(mp) => {
                buf.put_u16(mp.family.0.afi());
                buf.put_u8(mp.family.1.to_u8().unwrap());
                buf.put_u8(mp.nexthop.len() as u8);
                buf.put_slice(&mp.nexthop);
                buf.put_u8(0);
                for nlri in &mp.nlri {
                    nlri.clone().encode_into(buf, mp.family);
                }
            }
            Attribute::MpUnreachNlri(mp) => {
                buf.put_u16(mp.family.0.afi());
                buf.put_u8(mp.family.1.to_u8().unwrap());
                for nlri in &mp.nlri {
                    nlri.clone().encode_into(buf, mp.family);
                }
            }
            Attribute::ExtCommunities(list) => {
                for v in list {
                    buf.put_slice(v);
                }
            }
            Attribute::PmsiTunnel(pmsi) => {
                buf.put_u8(pmsi.flags);
                buf.put_u8(pmsi.tunnel_type);
                pmsi.label.encode(buf);
                buf.put_slice(&pmsi.identifier);
            }
            Attribute::Extv6Community(list) => {
                for v in list {
                    buf.put_slice(v);
                }
            }
            Attribute::Aigp(metric) => {
                buf.put_u8(AigpType::Aigp as u8);
                buf.put_u16(11);
                buf.put_u64(*metric);
            }
            Attribute::BgpLs(raw) => buf.put_slice(raw),
            Attribute::LargeCommunities(list) => {
                for (g, l1, l2) in list {
                    buf.put_u32(*g);
                    buf.put_u32(*l1);
                    buf.put_u32(*l2);
                }
            }
            Attribute::BgpPrefixSid(tlvs) => {
                for tlv in tlvs {
                    encode_prefix_sid_tlv(buf, tlv);
                }
            }
            Attribute::Unknown { value, .. } => buf.put_slice(value),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, cxt: EncodeCxt) {
        let mut flags = self.flags();
        let mut value = BytesMut::new();
        self.encode_value(&mut value, cxt);
        if value.len() > 255 {
            flags.insert(AttrFlags::EXTENDED);
        }
        buf.put_u8(flags.bits());
        buf.put_u8(self.code());
        if flags.contains(AttrFlags::EXTENDED) {
            buf.put_u16(value.len() as u16);
        } else {
            buf.put_u8(value.len() as u8);
        }
        buf.put_slice(&value);
    }

    /// Decodes a single attribute value given its declared type/flags.
    /// Returns `Err` with the policy that applies when the value itself is
    /// malformed; the caller (message codec) decides the fallback action.
    pub fn decode(
        attr_type_raw: u8,
        flags: AttrFlags,
        mut value: Bytes,
        cxt: &DecodeCxt,
    ) -> Result<Attribute, AttrError> {
        let Some(attr_type) = AttrType::from_u8(attr_type_raw) else {
            return Ok(Attribute::Unknown {
                code: attr_type_raw,
                flags: flags | AttrFlags::PARTIAL,
                value,
            });
        };
        let policy = Attribute::parse_error_policy(attr_type);
        let result = (|| -> Result<Attribute, AttrError> {
            Ok(match attr_type {
                AttrType::Origin => {
                    let raw = value.try_get_u8().map_err(|_| policy)?;
                    let origin = Origin::from_u8(raw).ok_or(policy)?;
                    Attribute::Origin(origin)
                }
                AttrType::AsPath | AttrType::As4Path => {
                    let four_octet = cxt.four_octet_asn || attr_type == AttrType::As4Path;
                    let mut segments = Vec::new();
                    while value.remaining() > 0 {
                        let seg_type_raw = value.try_get_u8().map_err(|_| policy)?;
                        let seg_type = AsPathSegmentType::from_u8(seg_type_raw)
                            .ok_or(AttrError::Reset)?;
                        let count = value.try_get_u8().map_err(|_| policy)? as usize;
                        let mut members = Vec::with_capacity(count);
                        for _ in 0..count {
                            members.push(decode_asn(&mut value, four_octet).map_err(|_| policy)?);
                        }
                        segments.push(AsPathSegment { seg_type, members });
                    }
                    let path = AsPath { segments };
                    if attr_type == AttrType::AsPath
                        && cxt.is_external
                        && path.first_asn() != Some(cxt.peer_as)
                    {
                        return Err(AttrError::Withdraw);
                    }
                    if attr_type == AttrType::AsPath {
                        Attribute::AsPath(path)
                    } else {
                        Attribute::As4Path(path)
                    }
                }
                AttrType::Nexthop => {
                    if value.remaining() != 4 {
                        return Err(policy);
                    }
                    Attribute::NextHop(Ipv4Addr::from(value.get_u32()))
                }
                AttrType::Med => {
                    if value.remaining() != 4 {
                        return Err(policy);
                    }
                    Attribute::Med(value.get_u32())
                }
                AttrType::LocalPref => {
                    if value.remaining() != 4 {
                        return Err(policy);
                    }
                    Attribute::LocalPref(value.get_u32())
                }
                AttrType::AtomicAggregate => {
                    if value.remaining() != 0 {
                        return Err(policy);
                    }
                    Attribute::AtomicAggregate
                }
                AttrType::Aggregator | AttrType::As4Aggregator => {
                    let four_octet =
                        cxt.four_octet_asn || attr_type == AttrType::As4Aggregator;
                    let asn = decode_asn(&mut value, four_octet).map_err(|_| policy)?;
                    if value.remaining() != 4 {
                        return Err(policy);
                    }
                    let identifier = Ipv4Addr::from(value.get_u32());
                    let agg = Aggregator { asn, identifier };
                    if attr_type == AttrType::Aggregator {
                        Attribute::Aggregator(agg)
                    } else {
                        Attribute::As4Aggregator(agg)
                    }
                }
                AttrType::Communities => {
                    if value.remaining() % 4 != 0 {
                        return Err(policy);
                    }
                    let mut list = Vec::new();
                    while value.remaining() > 0 {
                        list.push(value.get_u32());
                    }
                    Attribute::Communities(list)
                }
                AttrType::OriginatorId => {
                    if value.remaining() != 4 {
                        return Err(policy);
                    }
                    Attribute::OriginatorId(Ipv4Addr::from(value.get_u32()))
                }
                AttrType::ClusterList => {
                    if value.remaining() % 4 != 0 {
                        return Err(policy);
                    }
                    let mut list = Vec::new();
                    while value.remaining() > 0 {
                        list.push(Ipv4Addr::from(value.get_u32()));
                    }
                    Attribute::ClusterList(list)
                }
                AttrType::MpReachNlri => {
                    if value.remaining() < 5 {
                        return Err(policy);
                    }
                    let afi_raw = value.get_u16();
                    let afi = AddressFamily::from_afi(afi_raw).ok_or(policy)?;
                    let safi_raw = value.get_u8();
                    let safi = Safi::from_u8(safi_raw).ok_or(policy)?;
                    let family = (afi, safi);
                    let nh_len = value.try_get_u8().map_err(|_| policy)? as usize;
                    if value.remaining() < nh_len + 1 {
                        return Err(policy);
                    }
                    let nexthop = value.copy_to_bytes(nh_len);
                    // Reserved (SNPA count) octet.
                    value.advance(1);
                    let nlri = Nlri::decode_many(&mut value, family, cxt.add_path(family))
                        .map_err(|_| policy)?;
                    Attribute::MpReachNlri(MpReachNlri { family, nexthop, nlri })
                }
                AttrType::MpUnreachNlri => {
                    if value.remaining() < 3 {
                        return Err(policy);
                    }
                    let afi = AddressFamily::from_afi(value.get_u16()).ok_or(policy)?;
                    let safi = Safi::from_u8(value.get_u8()).ok_or(policy)?;
                    let family = (afi, safi);
                    let nlri = Nlri::decode_many(&mut value, family, cxt.add_path(family))
                        .map_err(|_| policy)?;
                    Attribute::MpUnreachNlri(MpUnreachNlri { family, nlri })
                }
                AttrType::ExtCommunities => {
                    if value.remaining() % 8 != 0 {
                        return Err(policy);
                    }
                    let mut list = Vec::new();
                    while value.remaining() > 0 {
                        let mut v = [0u8; 8];
                        value.copy_to_slice(&mut v);
                        list.push(v);
                    }
                    Attribute::ExtCommunities(list)
                }
                AttrType::PmsiTunnel => {
                    if value.remaining() < 5 {
                        return Err(policy);
                    }
                    let flags = value.get_u8();
                    let tunnel_type = value.get_u8();
                    let label = crate::ip::Label::decode(&mut value);
                    let identifier = value.copy_to_bytes(value.remaining());
                    Attribute::PmsiTunnel(PmsiTunnel { flags, tunnel_type, label, identifier })
                }
                AttrType::Extv6Community => {
                    if value.remaining() % 20 != 0 {
                        return Err(policy);
                    }
                    let mut list = Vec::new();
                    while value.remaining() > 0 {
                        let mut v = [0u8; 20];
                        value.copy_to_slice(&mut v);
                        list.push(v);
                    }
                    Attribute::Extv6Community(list)
                }
                AttrType::Aigp => {
                    let mut metric = None;
                    while value.remaining() >= 3 {
                        let tlv_type = value.get_u8();
                        let tlv_len = value.get_u16() as usize;
                        if value.remaining() < tlv_len.saturating_sub(3) {
                            return Err(policy);
                        }
                        let body_len = tlv_len.saturating_sub(3);
                        let body = value.copy_to_bytes(body_len);
                        if tlv_type == AigpType::Aigp as u8 && body.len() == 8 {
                            metric = Some(u64::from_be_bytes(body.as_ref().try_into().unwrap()));
                        }
                    }
                    Attribute::Aigp(metric.unwrap_or(0))
                }
                AttrType::BgpLs => Attribute::BgpLs(value.clone()),
                AttrType::LargeCommunity => {
                    if value.remaining() % 12 != 0 {
                        return Err(policy);
                    }
                    let mut list = Vec::new();
                    while value.remaining() > 0 {
                        list.push((value.get_u32(), value.get_u32(), value.get_u32()));
                    }
                    Attribute::LargeCommunities(list)
                }
                AttrType::BgpPrefixSid => {
                    let mut tlvs = Vec::new();
                    while value.remaining() >= 3 {
                        let sub_type = value.get_u8();
                        let len = value.get_u16() as usize;
                        if value.remaining() < len {
                            return Err(policy);
                        }
                        let mut body = value.copy_to_bytes(len);
                        tlvs.push(decode_prefix_sid_tlv(sub_type, &mut body));
                    }
                    Attribute::BgpPrefixSid(tlvs)
                }
                AttrType::Otc => {
                    if value.remaining() != 4 {
                        return Err(policy);
                    }
                    Attribute::Unknown { code: attr_type_raw, flags, value: value.clone() }
                }
            })
        })();
        result.map_err(|_| policy)
    }
}

fn encode_prefix_sid_tlv(buf: &mut BytesMut, tlv: &PrefixSidSubTlv) {
    match tlv {
        PrefixSidSubTlv::LabelIndex(index) => {
            buf.put_u8(1);
            buf.put_u16(7);
            buf.put_u8(0);
            buf.put_u16(0);
            buf.put_u32(*index);
        }
        PrefixSidSubTlv::OriginatorSrgb(ranges) => {
            buf.put_u8(3);
            buf.put_u16((2 + ranges.len() * 6) as u16);
            buf.put_u16(0);
            for (base, range) in ranges {
                buf.put_u8(((*base >> 16) & 0xFF) as u8);
                buf.put_u8(((*base >> 8) & 0xFF) as u8);
                buf.put_u8((*base & 0xFF) as u8);
                buf.put_u8(*range);
                buf.put_u8(0);
                buf.put_u8(0);
            }
        }
        PrefixSidSubTlv::Srv6L3Service(raw) => {
            buf.put_u8(5);
            buf.put_u16(raw.len() as u16);
            buf.put_slice(raw);
        }
        PrefixSidSubTlv::Srv6L2Service(raw) => {
            buf.put_u8(6);
            buf.put_u16(raw.len() as u16);
            buf.put_slice(raw);
        }
        PrefixSidSubTlv::Unknown { sub_type, value } => {
            buf.put_u8(*sub_type);
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
        }
    }
}

fn decode_prefix_sid_tlv(sub_type: u8, body: &mut Bytes) -> PrefixSidSubTlv {
    match sub_type {
        1 if body.remaining() >= 7 => {
            body.advance(3);
            PrefixSidSubTlv::LabelIndex(body.get_u32())
        }
        3 => {
            if body.remaining() >= 2 {
                body.advance(2);
            }
            let mut ranges = Vec::new();
            while body.remaining() >= 6 {
                let b0 = body.get_u8() as u32;
                let b1 = body.get_u8() as u32;
                let b2 = body.get_u8() as u32;
                let base = (b0 << 16) | (b1 << 8) | b2;
                let range = body.get_u8();
                body.advance(2);
                ranges.push((base, range));
            }
            PrefixSidSubTlv::OriginatorSrgb(ranges)
        }
        5 => PrefixSidSubTlv::Srv6L3Service(body.copy_to_bytes(body.remaining())),
        6 => PrefixSidSubTlv::Srv6L2Service(body.copy_to_bytes(body.remaining())),
        _ => PrefixSidSubTlv::Unknown { sub_type, value: body.copy_to_bytes(body.remaining()) },
    }
}

fn encode_asn(buf: &mut BytesMut, asn: u32, four_octet: bool) {
    if four_octet {
        buf.put_u32(asn);
    } else {
        buf.put_u16(asn as u16);
    }
}

fn decode_asn(buf: &mut Bytes, four_octet: bool) -> Result<u32, ()> {
    if four_octet {
        if buf.remaining() < 4 {
            return Err(());
        }
        Ok(buf.get_u32())
    } else {
        if buf.remaining() < 2 {
            return Err(());
        }
        Ok(buf.get_u16() as u32)
    }
}

impl DecodeCxt {
    pub(crate) fn add_path(&self, family: Family) -> bool {
        self.add_path_families.contains(&family)
    }
}

/// Ordered, type-keyed set of distinct attributes (§3 "AttributeCollection").
/// Ordering is insertion order of parsing and is preserved on re-pack.
#[derive(Clone, Debug, Default, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AttributeCollection {
    order: Vec<u8>,
    map: BTreeMap<u8, Arc<Attribute>>,
}

impl AttributeCollection {
    pub fn new() -> AttributeCollection {
        AttributeCollection::default()
    }

    /// Inserts `attr`, applying its duplicate policy against any existing
    /// attribute of the same type code.
    pub fn insert(
        &mut self,
        attr: Attribute,
        cache: &mut crate::packet::cache::AttributeCache,
    ) -> Result<(), AttrError> {
        let code = attr.code();
        match self.map.get(&code) {
            None => {
                self.order.push(code);
                self.map.insert(code, cache.intern(attr));
            }
            Some(existing) => match attr.duplicate_policy() {
                DuplicatePolicy::Forbidden => return Err(AttrError::Reset),
                DuplicatePolicy::LastWins => {
                    self.map.insert(code, cache.intern(attr));
                }
                DuplicatePolicy::Merge => {
                    let mut merged = (**existing).clone();
                    merged.merge(attr);
                    self.map.insert(code, cache.intern(merged));
                }
            },
        }
        Ok(())
    }

    pub fn get(&self, code: u8) -> Option<&Attribute> {
        self.map.get(&code).map(|a| a.as_ref())
    }

    pub fn get_type(&self, attr_type: AttrType) -> Option<&Attribute> {
        self.get(attr_type as u8)
    }

    pub fn remove(&mut self, code: u8) {
        if self.map.remove(&code).is_some() {
            self.order.retain(|c| *c != code);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.order.iter().filter_map(|code| self.map.get(code)).map(|a| a.as_ref())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Folds AS4_PATH/AS4_AGGREGATOR into AS_PATH/AGGREGATOR per RFC 6793
    /// §4.2.3 and drops the AS4 attributes afterwards. Only meaningful when
    /// the session negotiated two-octet ASNs; callers skip this for
    /// AS4-capable sessions, where no AS4_PATH/AS4_AGGREGATOR should have
    /// been sent in the first place.
    pub fn reconcile_as4(&mut self, cache: &mut crate::packet::cache::AttributeCache) {
        if let (Some(Attribute::AsPath(as2)), Some(Attribute::As4Path(as4))) =
            (self.get_type(AttrType::AsPath), self.get_type(AttrType::As4Path))
        {
            let merged = as2.reconcile_as4(as4);
            self.map.insert(
                AttrType::AsPath as u8,
                cache.intern(Attribute::AsPath(merged)),
            );
        }
        self.remove(AttrType::As4Path as u8);

        if let (Some(Attribute::Aggregator(agg2)), Some(Attribute::As4Aggregator(agg4))) =
            (self.get_type(AttrType::Aggregator), self.get_type(AttrType::As4Aggregator))
        {
            let merged = agg2.reconcile_as4(agg4);
            self.map.insert(
                AttrType::Aggregator as u8,
                cache.intern(Attribute::Aggregator(merged)),
            );
        }
        self.remove(AttrType::As4Aggregator as u8);
    }

    pub fn mp_reach(&self) -> Option<&MpReachNlri> {
        match self.get_type(AttrType::MpReachNlri) {
            Some(Attribute::MpReachNlri(mp)) => Some(mp),
            _ => None,
        }
    }

    pub fn mp_unreach(&self) -> Option<&MpUnreachNlri> {
        match self.get_type(AttrType::MpUnreachNlri) {
            Some(Attribute::MpUnreachNlri(mp)) => Some(mp),
            _ => None,
        }
    }

    /// RFC 7606-mandated mandatory well-known check: ORIGIN, AS_PATH and
    /// NEXT_HOP must be present on an announced IPv4-unicast route.
    pub fn has_mandatory_well_known(&self, needs_nexthop: bool) -> bool {
        self.get_type(AttrType::Origin).is_some()
            && self.get_type(AttrType::AsPath).is_some()
            && (!needs_nexthop || self.get_type(AttrType::Nexthop).is_some())
    }

    pub fn encode(&self, buf: &mut BytesMut, cxt: EncodeCxt) {
        for code in &self.order {
            if let Some(attr) = self.map.get(code) {
                attr.encode(buf, cxt);
            }
        }
    }

    pub fn next_hop(&self) -> Option<IpAddr> {
        match self.get_type(AttrType::Nexthop) {
            Some(Attribute::NextHop(addr)) => Some(IpAddr::V4(*addr)),
            _ => self.mp_reach().map(|mp| nexthop_from_bytes(&mp.nexthop)),
        }
    }
}

fn nexthop_from_bytes(bytes: &Bytes) -> IpAddr {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes[..4]);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 | 32 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            IpAddr::V6(std::net::Ipv6Addr::from(octets))
        }
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::cache::AttributeCache;

    fn cxt() -> DecodeCxt {
        DecodeCxt {
            four_octet_asn: true,
            peer_as: 65001,
            is_external: false,
            add_path_families: Default::default(),
        }
    }

    #[test]
    fn origin_round_trip() {
        let attr = Attribute::Origin(Origin::Igp);
        let mut buf = BytesMut::new();
        attr.encode(&mut buf, EncodeCxt { four_octet_asn: true });
        let mut rd = buf.freeze();
        let flags = AttrFlags::from_bits_truncate(rd.get_u8());
        let _type = rd.get_u8();
        let len = rd.get_u8() as usize;
        let value = rd.copy_to_bytes(len);
        let decoded = Attribute::decode(AttrType::Origin as u8, flags, value, &cxt()).unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn as_path_missing_first_as_triggers_withdraw_for_ebgp() {
        let path = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![65002],
            }],
        };
        let attr = Attribute::AsPath(path);
        let mut buf = BytesMut::new();
        attr.encode(&mut buf, EncodeCxt { four_octet_asn: true });
        let mut rd = buf.freeze();
        let flags = AttrFlags::from_bits_truncate(rd.get_u8());
        rd.get_u8();
        let len = rd.get_u8() as usize;
        let value = rd.copy_to_bytes(len);
        let mut c = cxt();
        c.is_external = true;
        c.peer_as = 99999;
        let result = Attribute::decode(AttrType::AsPath as u8, flags, value, &c);
        assert_eq!(result, Err(AttrError::Withdraw));
    }

    #[test]
    fn attribute_collection_preserves_insertion_order() {
        let mut cache = AttributeCache::new(16);
        let mut attrs = AttributeCollection::new();
        attrs.insert(Attribute::Med(10), &mut cache).unwrap();
        attrs.insert(Attribute::Origin(Origin::Igp), &mut cache).unwrap();
        let codes: Vec<u8> = attrs.iter().map(|a| a.code()).collect();
        assert_eq!(codes, vec![AttrType::Med as u8, AttrType::Origin as u8]);
    }

    #[test]
    fn forbidden_duplicate_is_session_reset() {
        let mut cache = AttributeCache::new(16);
        let mut attrs = AttributeCollection::new();
        attrs.insert(Attribute::Origin(Origin::Igp), &mut cache).unwrap();
        let result = attrs.insert(Attribute::Origin(Origin::Egp), &mut cache);
        assert_eq!(result, Err(AttrError::Reset));
    }

    #[test]
    fn communities_merge_on_duplicate() {
        let mut cache = AttributeCache::new(16);
        let mut attrs = AttributeCollection::new();
        attrs.insert(Attribute::Communities(vec![1]), &mut cache).unwrap();
        attrs.insert(Attribute::Communities(vec![2]), &mut cache).unwrap();
        match attrs.get_type(AttrType::Communities).unwrap() {
            Attribute::Communities(list) => assert_eq!(list, &vec![1, 2]),
            _ => panic!("expected Communities"),
        }
    }

    #[test]
    fn as_path_reconciles_as4_path() {
        // AS_PATH: AS_TRANS AS_TRANS 65010, AS4_PATH: 65001 65002 65010.
        let as2 = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![23456, 23456, 65010],
            }],
        };
        let as4 = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![65001, 65002, 65010],
            }],
        };
        let merged = as2.reconcile_as4(&as4);
        assert_eq!(
            merged,
            AsPath {
                segments: vec![AsPathSegment {
                    seg_type: AsPathSegmentType::Sequence,
                    members: vec![65001, 65002, 65010],
                }],
            }
        );
    }

    #[test]
    fn as_path_reconcile_keeps_leading_hop_when_as4_shorter() {
        // AS_PATH has an extra leading hop that an old BGP4 speaker
        // prepended after the AS4 border; AS4_PATH only covers the tail.
        let as2 = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![65099, 23456, 65010],
            }],
        };
        let as4 = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![65002, 65010],
            }],
        };
        let merged = as2.reconcile_as4(&as4);
        assert_eq!(
            merged,
            AsPath {
                segments: vec![AsPathSegment {
                    seg_type: AsPathSegmentType::Sequence,
                    members: vec![65099, 65002, 65010],
                }],
            }
        );
    }

    #[test]
    fn as_path_reconcile_ignores_longer_as4_path() {
        let as2 = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![23456],
            }],
        };
        let as4 = AsPath {
            segments: vec![AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: vec![65001, 65002],
            }],
        };
        let merged = as2.reconcile_as4(&as4);
        assert_eq!(merged, as2);
    }

    #[test]
    fn aggregator_reconciles_as4_aggregator() {
        let agg2 = Aggregator { asn: 23456, identifier: Ipv4Addr::new(1, 2, 3, 4) };
        let agg4 = Aggregator { asn: 4_200_000_000, identifier: Ipv4Addr::new(1, 2, 3, 4) };
        assert_eq!(agg2.reconcile_as4(&agg4), agg4);

        let agg2_native = Aggregator { asn: 65010, identifier: Ipv4Addr::new(1, 2, 3, 4) };
        assert_eq!(agg2_native.reconcile_as4(&agg4), agg2_native);
    }

    #[test]
    fn attribute_collection_folds_as4_attributes_and_drops_them() {
        let mut cache = AttributeCache::new(16);
        let mut attrs = AttributeCollection::new();
        attrs
            .insert(
                Attribute::AsPath(AsPath {
                    segments: vec![AsPathSegment {
                        seg_type: AsPathSegmentType::Sequence,
                        members: vec![23456],
                    }],
                }),
                &mut cache,
            )
            .unwrap();
        attrs
            .insert(
                Attribute::As4Path(AsPath {
                    segments: vec![AsPathSegment {
                        seg_type: AsPathSegmentType::Sequence,
                        members: vec![65001],
                    }],
                }),
                &mut cache,
            )
            .unwrap();

        attrs.reconcile_as4(&mut cache);

        assert!(attrs.get_type(AttrType::As4Path).is_none());
        match attrs.get_type(AttrType::AsPath).unwrap() {
            Attribute::AsPath(path) => assert_eq!(path.first_asn(), Some(65001)),
            _ => panic!("expected AsPath"),
        }
    }
}
