//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! NLRI codec (§4.C3). Every family supported by this core is a variant of
//! the closed [`Nlri`] sum type; dispatch is always on `(AFI, SAFI)`, never
//! on a registered class. Each variant knows how to pack itself, how to
//! parse itself back out of a buffer, and how to compute its Adj-RIB-Out
//! `index` — the stable, per-family-unique byte string used for dedup.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::ip::{AddressFamily, EthernetSegmentId, Label, MacAddress, PathId, RouteDistinguisher};
use crate::packet::consts::{EvpnRouteType, McastVpnRouteType, Safi};
use crate::packet::error::DecodeError;

/// An IPv4 or IPv6 prefix: `(bit length, address)`. Only the leading
/// `ceil(length / 8)` bytes of `addr` are meaningful; trailing bits beyond
/// `length` are canonically zero so that `pack(parse(x)) == x`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv4Prefix {
    pub len: u8,
    pub addr: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Ipv6Prefix {
    pub len: u8,
    pub addr: Ipv6Addr,
}

impl Ipv4Prefix {
    pub fn decode(buf: &mut impl Buf) -> Result<Ipv4Prefix, DecodeError> {
        let len = buf.try_get_u8()?;
        let nbytes = len.div_ceil(8) as usize;
        if nbytes > 4 || buf.remaining() < nbytes {
            return Err(DecodeError::ReadOutOfBounds);
        }
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets[..nbytes]);
        Ok(Ipv4Prefix { len, addr: Ipv4Addr::from(octets) })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len);
        let nbytes = self.len.div_ceil(8) as usize;
        buf.put_slice(&self.addr.octets()[..nbytes]);
    }

    fn index_bytes(&self) -> Vec<u8> {
        let nbytes = self.len.div_ceil(8) as usize;
        let mut v = vec![self.len];
        v.extend_from_slice(&self.addr.octets()[..nbytes]);
        v
    }
}

impl Ipv6Prefix {
    pub fn decode(buf: &mut impl Buf) -> Result<Ipv6Prefix, DecodeError> {
        let len = buf.try_get_u8()?;
        let nbytes = len.div_ceil(8) as usize;
        if nbytes > 16 || buf.remaining() < nbytes {
            return Err(DecodeError::ReadOutOfBounds);
        }
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets[..nbytes]);
        Ok(Ipv6Prefix { len, addr: Ipv6Addr::from(octets) })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len);
        let nbytes = self.len.div_ceil(8) as usize;
        buf.put_slice(&self.addr.octets()[..nbytes]);
    }

    fn index_bytes(&self) -> Vec<u8> {
        let nbytes = self.len.div_ceil(8) as usize;
        let mut v = vec![self.len];
        v.extend_from_slice(&self.addr.octets()[..nbytes]);
        v
    }
}

/// EVPN route-type-specific payload (RFC 7432 / RFC 9136). Route types
/// beyond the five specified ones are kept opaque.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum EvpnRoute {
    EthernetAutoDiscovery {
        rd: RouteDistinguisher,
        esi: EthernetSegmentId,
        tag: u32,
        label: Label,
    },
    MacIpAdvertisement {
        rd: RouteDistinguisher,
        esi: EthernetSegmentId,
        tag: u32,
        mac: MacAddress,
        ip: Option<std::net::IpAddr>,
        label1: Label,
        label2: Option<Label>,
    },
    InclusiveMulticastEthernetTag {
        rd: RouteDistinguisher,
        tag: u32,
        originator: std::net::IpAddr,
    },
    EthernetSegment {
        rd: RouteDistinguisher,
        esi: EthernetSegmentId,
        originator: std::net::IpAddr,
    },
    IpPrefix {
        rd: RouteDistinguisher,
        esi: EthernetSegmentId,
        tag: u32,
        prefix_len: u8,
        prefix: std::net::IpAddr,
        gateway: std::net::IpAddr,
        label: Label,
    },
    Unknown { route_type: u8, value: Bytes },
}

/// MCAST-VPN route-type-specific payload (RFC 6514).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum McastVpnRoute {
    IntraAsIPmsiAd { rd: RouteDistinguisher, originator: std::net::IpAddr },
    InterAsIPmsiAd { rd: RouteDistinguisher, source_as: u32 },
    SPmsiAd {
        rd: RouteDistinguisher,
        source: std::net::IpAddr,
        source_len: u8,
        group: std::net::IpAddr,
        group_len: u8,
        originator: std::net::IpAddr,
    },
    LeafAd { route_key: Bytes },
    SourceActiveAd {
        rd: RouteDistinguisher,
        source: std::net::IpAddr,
        source_len: u8,
        group: std::net::IpAddr,
        group_len: u8,
    },
    SharedTreeJoin {
        rd: RouteDistinguisher,
        source_as: u32,
        source: std::net::IpAddr,
        source_len: u8,
        group: std::net::IpAddr,
        group_len: u8,
    },
    SourceTreeJoin {
        rd: RouteDistinguisher,
        source_as: u32,
        source: std::net::IpAddr,
        source_len: u8,
        group: std::net::IpAddr,
        group_len: u8,
    },
}

/// A single FlowSpec component (type + operator/value bytes), kept in its
/// packed wire form: interpreting the operator chain is a policy-engine
/// concern outside this core.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct FlowSpecComponent {
    pub component_type: u8,
    pub value: Bytes,
}

/// BGP-LS NLRI (RFC 7752bis), kept as a dispatched-but-opaque TLV block:
/// the descriptor/attribute sub-TLVs are topology-database concerns the
/// peer engine does not interpret, only forwards.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct BgpLsNlri {
    pub nlri_type: u16,
    pub protocol_id: u8,
    pub identifier: u64,
    pub descriptors: Bytes,
}

/// BGP-MUP NLRI (draft-mpmz-bess-mup-safi).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MupNlri {
    pub arch_type: u8,
    pub route_type: u16,
    pub value: Bytes,
}

/// VPLS NLRI (RFC 4761/6074), fixed 19-byte layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct VplsNlri {
    pub rd: RouteDistinguisher,
    pub ve_id: u16,
    pub label_block_offset: u16,
    pub label_block_size: u16,
    pub label_base: Label,
}

/// Action associated with a change to an NLRI (§3 "NLRI" / "Change").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Action {
    Announce,
    Withdraw,
}

/// The closed sum type over every (AFI, SAFI) NLRI wire representation this
/// core understands (§4.C3).
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
#[skip_serializing_none]
pub enum Nlri {
    Ipv4Unicast { prefix: Ipv4Prefix, path_id: Option<PathId> },
    Ipv6Unicast { prefix: Ipv6Prefix, path_id: Option<PathId> },
    Ipv4Multicast { prefix: Ipv4Prefix, path_id: Option<PathId> },
    Ipv6Multicast { prefix: Ipv6Prefix, path_id: Option<PathId> },
    Ipv4LabeledUnicast { prefix: Ipv4Prefix, labels: Vec<Label>, path_id: Option<PathId> },
    Ipv6LabeledUnicast { prefix: Ipv6Prefix, labels: Vec<Label>, path_id: Option<PathId> },
    Ipv4L3vpn { rd: RouteDistinguisher, prefix: Ipv4Prefix, labels: Vec<Label>, path_id: Option<PathId> },
    Ipv6L3vpn { rd: RouteDistinguisher, prefix: Ipv6Prefix, labels: Vec<Label>, path_id: Option<PathId> },
    Vpls(VplsNlri),
    Evpn(EvpnRoute),
    Ipv4FlowSpec(Vec<FlowSpecComponent>),
    Ipv6FlowSpec(Vec<FlowSpecComponent>),
    Vpnv4FlowSpec { rd: RouteDistinguisher, components: Vec<FlowSpecComponent> },
    Ipv4McastVpn(McastVpnRoute),
    Ipv6McastVpn(McastVpnRoute),
    BgpLs(BgpLsNlri),
    Rtc { origin_as: u32, route_target: [u8; 8] },
    Ipv4Mup(MupNlri),
    Ipv6Mup(MupNlri),
}

pub type Family = (AddressFamily, Safi);

impl Nlri {
    pub fn family(&self) -> Family {
        use AddressFamily::*;
        match self {
            Nlri::Ipv4Unicast { .. } => (Ipv4, Safi::Unicast),
            Nlri::Ipv6Unicast { .. } => (Ipv6, Safi::Unicast),
            Nlri::Ipv4Multicast { .. } => (Ipv4, Safi::Multicast),
            Nlri::Ipv6Multicast { .. } => (Ipv6, Safi::Multicast),
            Nlri::Ipv4LabeledUnicast { .. } => (Ipv4, Safi::LabeledUnicast),
            Nlri::Ipv6LabeledUnicast { .. } => (Ipv6, Safi::LabeledUnicast),
            Nlri::Ipv4L3vpn { .. } => (Ipv4, Safi::LabeledVpn),
            Nlri::Ipv6L3vpn { .. } => (Ipv6, Safi::LabeledVpn),
            Nlri::Vpls(..) => (Ipv4, Safi::Vpls),
            Nlri::Evpn(..) => (Ipv4, Safi::Evpn),
            Nlri::Ipv4FlowSpec(..) => (Ipv4, Safi::Ipv4FlowSpec),
            Nlri::Ipv6FlowSpec(..) => (Ipv6, Safi::Ipv4FlowSpec),
            Nlri::Vpnv4FlowSpec { .. } => (Ipv4, Safi::Vpnv4FlowSpec),
            Nlri::Ipv4McastVpn(..) => (Ipv4, Safi::MulticastVpn),
            Nlri::Ipv6McastVpn(..) => (Ipv6, Safi::MulticastVpn),
            Nlri::BgpLs(..) => (Ipv4, Safi::BgpLs),
            Nlri::Rtc { .. } => (Ipv4, Safi::RouteTarget),
            Nlri::Ipv4Mup(..) => (Ipv4, Safi::Mup),
            Nlri::Ipv6Mup(..) => (Ipv6, Safi::Mup),
        }
    }

    pub fn path_id(&self) -> Option<PathId> {
        match self {
            Nlri::Ipv4Unicast { path_id, .. }
            | Nlri::Ipv6Unicast { path_id, .. }
            | Nlri::Ipv4Multicast { path_id, .. }
            | Nlri::Ipv6Multicast { path_id, .. }
            | Nlri::Ipv4LabeledUnicast { path_id, .. }
            | Nlri::Ipv6LabeledUnicast { path_id, .. }
            | Nlri::Ipv4L3vpn { path_id, .. }
            | Nlri::Ipv6L3vpn { path_id, .. } => *path_id,
            _ => None,
        }
    }

    /// Stable, per-family-unique index used for Adj-RIB-Out dedup (§3, §4.C3
    /// "Deterministic index"). Labels are deliberately excluded for labeled
    /// families: re-announcing the same prefix with a different label
    /// replaces the prior entry rather than creating a second one.
    pub fn index(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Nlri::Ipv4Unicast { prefix, path_id }
            | Nlri::Ipv4Multicast { prefix, path_id } => {
                encode_path_id(&mut buf, *path_id);
                buf.put_slice(&prefix.index_bytes());
            }
            Nlri::Ipv6Unicast { prefix, path_id }
            | Nlri::Ipv6Multicast { prefix, path_id } => {
                encode_path_id(&mut buf, *path_id);
                buf.put_slice(&prefix.index_bytes());
            }
            Nlri::Ipv4LabeledUnicast { prefix, path_id, .. } => {
                encode_path_id(&mut buf, *path_id);
                buf.put_slice(&prefix.index_bytes());
            }
            Nlri::Ipv6LabeledUnicast { prefix, path_id, .. } => {
                encode_path_id(&mut buf, *path_id);
                buf.put_slice(&prefix.index_bytes());
            }
            Nlri::Ipv4L3vpn { rd, prefix, path_id, .. } => {
                encode_path_id(&mut buf, *path_id);
                rd.encode(&mut buf);
                buf.put_slice(&prefix.index_bytes());
            }
            Nlri::Ipv6L3vpn { rd, prefix, path_id, .. } => {
                encode_path_id(&mut buf, *path_id);
                rd.encode(&mut buf);
                buf.put_slice(&prefix.index_bytes());
            }
            Nlri::Vpls(vpls) => {
                vpls.rd.encode(&mut buf);
                buf.put_u16(vpls.ve_id);
            }
            Nlri::Evpn(route) => {
                buf.put_slice(&evpn_index_bytes(route));
            }
            Nlri::Ipv4FlowSpec(components) | Nlri::Ipv6FlowSpec(components) => {
                buf.put_slice(&flowspec_index_bytes(components));
            }
            Nlri::Vpnv4FlowSpec { rd, components } => {
                rd.encode(&mut buf);
                buf.put_slice(&flowspec_index_bytes(components));
            }
            Nlri::Ipv4McastVpn(route) | Nlri::Ipv6McastVpn(route) => {
                buf.put_slice(&mcast_vpn_index_bytes(route));
            }
            Nlri::BgpLs(ls) => {
                buf.put_u16(ls.nlri_type);
                buf.put_u64(ls.identifier);
                buf.put_slice(&ls.descriptors);
            }
            Nlri::Rtc { origin_as, route_target } => {
                buf.put_u32(*origin_as);
                buf.put_slice(route_target);
            }
            Nlri::Ipv4Mup(mup) | Nlri::Ipv6Mup(mup) => {
                buf.put_u16(mup.route_type);
                buf.put_slice(&mup.value);
            }
        }
        buf.freeze()
    }

    /// Packs this NLRI onto the wire for the given family. `family` is not
    /// consulted (each variant already knows its own layout); it is taken
    /// so callers iterating a family-homogeneous NLRI list don't need to
    /// match on the variant themselves.
    pub fn encode_into(&self, buf: &mut BytesMut, _family: Family) {
        self.encode(buf)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Nlri::Ipv4Unicast { prefix, path_id } | Nlri::Ipv4Multicast { prefix, path_id } => {
                encode_path_id(buf, *path_id);
                prefix.encode(buf);
            }
            Nlri::Ipv6Unicast { prefix, path_id } | Nlri::Ipv6Multicast { prefix, path_id } => {
                encode_path_id(buf, *path_id);
                prefix.encode(buf);
            }
            Nlri::Ipv4LabeledUnicast { prefix, labels, path_id } => {
                encode_path_id(buf, *path_id);
                encode_labeled_prefix(buf, labels, None, prefix.len, &prefix.addr.octets());
            }
            Nlri::Ipv6LabeledUnicast { prefix, labels, path_id } => {
                encode_path_id(buf, *path_id);
                encode_labeled_prefix(buf, labels, None, prefix.len, &prefix.addr.octets());
            }
            Nlri::Ipv4L3vpn { rd, prefix, labels, path_id } => {
                encode_path_id(buf, *path_id);
                encode_labeled_prefix(buf, labels, Some(rd), prefix.len, &prefix.addr.octets());
            }
            Nlri::Ipv6L3vpn { rd, prefix, labels, path_id } => {
                encode_path_id(buf, *path_id);
                encode_labeled_prefix(buf, labels, Some(rd), prefix.len, &prefix.addr.octets());
            }
            Nlri::Vpls(vpls) => encode_vpls(buf, vpls),
            Nlri::Evpn(route) => encode_evpn(buf, route),
            Nlri::Ipv4FlowSpec(components) | Nlri::Ipv6FlowSpec(components) => {
                encode_flowspec(buf, components);
            }
            Nlri::Vpnv4FlowSpec { rd, components } => {
                rd.encode(buf);
                encode_flowspec(buf, components);
            }
            Nlri::Ipv4McastVpn(route) | Nlri::Ipv6McastVpn(route) => {
                encode_mcast_vpn(buf, route);
            }
            Nlri::BgpLs(ls) => encode_bgpls(buf, ls),
            Nlri::Rtc { origin_as, route_target } => encode_rtc(buf, *origin_as, route_target),
            Nlri::Ipv4Mup(mup) | Nlri::Ipv6Mup(mup) => encode_mup(buf, mup),
        }
    }

    /// Parses every NLRI in `buf` for a single `family`, consuming it fully.
    /// Used both for the classic NLRI field of UPDATE and for the NLRI
    /// portion of MP_REACH_NLRI / MP_UNREACH_NLRI.
    pub fn decode_many(
        buf: &mut Bytes,
        family: Family,
        add_path: bool,
    ) -> Result<Vec<Nlri>, DecodeError> {
        let mut result = Vec::new();
        while buf.has_remaining() {
            result.push(Nlri::decode_one(buf, family, add_path)?);
        }
        Ok(result)
    }

    fn decode_one(buf: &mut Bytes, family: Family, add_path: bool) -> Result<Nlri, DecodeError> {
        let path_id = if add_path {
            if buf.remaining() < 4 {
                return Err(DecodeError::ReadOutOfBounds);
            }
            Some(PathId::decode(buf))
        } else {
            None
        };
        use AddressFamily::*;
        match family {
            (Ipv4, Safi::Unicast) => {
                Ok(Nlri::Ipv4Unicast { prefix: Ipv4Prefix::decode(buf)?, path_id })
            }
            (Ipv6, Safi::Unicast) => {
                Ok(Nlri::Ipv6Unicast { prefix: Ipv6Prefix::decode(buf)?, path_id })
            }
            (Ipv4, Safi::Multicast) => {
                Ok(Nlri::Ipv4Multicast { prefix: Ipv4Prefix::decode(buf)?, path_id })
            }
            (Ipv6, Safi::Multicast) => {
                Ok(Nlri::Ipv6Multicast { prefix: Ipv6Prefix::decode(buf)?, path_id })
            }
            (Ipv4, Safi::LabeledUnicast) => {
                let (labels, prefix) = decode_labeled_ipv4(buf)?;
                Ok(Nlri::Ipv4LabeledUnicast { prefix, labels, path_id })
            }
            (Ipv6, Safi::LabeledUnicast) => {
                let (labels, prefix) = decode_labeled_ipv6(buf)?;
                Ok(Nlri::Ipv6LabeledUnicast { prefix, labels, path_id })
            }
            (Ipv4, Safi::LabeledVpn) => {
                let (labels, rd, prefix) = decode_labeled_vpn_ipv4(buf)?;
                Ok(Nlri::Ipv4L3vpn { rd, prefix, labels, path_id })
            }
            (Ipv6, Safi::LabeledVpn) => {
                let (labels, rd, prefix) = decode_labeled_vpn_ipv6(buf)?;
                Ok(Nlri::Ipv6L3vpn { rd, prefix, labels, path_id })
            }
            (Ipv4, Safi::Vpls) => Ok(Nlri::Vpls(decode_vpls(buf)?)),
            (_, Safi::Evpn) => Ok(Nlri::Evpn(decode_evpn(buf)?)),
            (Ipv4, Safi::Ipv4FlowSpec) => Ok(Nlri::Ipv4FlowSpec(decode_flowspec(buf)?)),
            (Ipv6, Safi::Ipv4FlowSpec) => Ok(Nlri::Ipv6FlowSpec(decode_flowspec(buf)?)),
            (Ipv4, Safi::Vpnv4FlowSpec) => {
                if buf.remaining() < RouteDistinguisher::LENGTH {
                    return Err(DecodeError::ReadOutOfBounds);
                }
                let rd = RouteDistinguisher::decode(buf);
                let components = decode_flowspec(buf)?;
                Ok(Nlri::Vpnv4FlowSpec { rd, components })
            }
            (Ipv4, Safi::MulticastVpn) => Ok(Nlri::Ipv4McastVpn(decode_mcast_vpn(buf)?)),
            (Ipv6, Safi::MulticastVpn) => Ok(Nlri::Ipv6McastVpn(decode_mcast_vpn(buf)?)),
            (_, Safi::BgpLs) => Ok(Nlri::BgpLs(decode_bgpls(buf)?)),
            (Ipv4, Safi::RouteTarget) => {
                let (origin_as, route_target) = decode_rtc(buf)?;
                Ok(Nlri::Rtc { origin_as, route_target })
            }
            (Ipv4, Safi::Mup) => Ok(Nlri::Ipv4Mup(decode_mup(buf)?)),
            (Ipv6, Safi::Mup) => Ok(Nlri::Ipv6Mup(decode_mup(buf)?)),
            _ => Err(DecodeError::ReadOutOfBounds),
        }
    }
}

fn decode_ip_by_bitlen(buf: &mut Bytes, bits: u8) -> Result<IpAddr, DecodeError> {
    match bits {
        32 => {
            if buf.remaining() < 4 {
                return Err(DecodeError::ReadOutOfBounds);
            }
            Ok(IpAddr::V4(Ipv4Addr::from(buf.get_u32())))
        }
        128 => {
            if buf.remaining() < 16 {
                return Err(DecodeError::ReadOutOfBounds);
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
    }
}

fn decode_ip_remaining(buf: &mut Bytes) -> Result<IpAddr, DecodeError> {
    match buf.remaining() {
        4 => Ok(IpAddr::V4(Ipv4Addr::from(buf.get_u32()))),
        16 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(DecodeError::ReadOutOfBounds),
    }
}

fn decode_labels(buf: &mut Bytes, remaining_bits: &mut u16) -> Result<Vec<Label>, DecodeError> {
    let mut labels = Vec::new();
    loop {
        if *remaining_bits < 24 {
            break;
        }
        if buf.remaining() < 3 {
            return Err(DecodeError::ReadOutOfBounds);
        }
        let label = Label::decode(buf);
        *remaining_bits -= 24;
        let stop = label.is_bottom_of_stack() || label.value() == Label::WITHDRAW.value();
        labels.push(label);
        if stop {
            break;
        }
    }
    Ok(labels)
}

fn decode_labeled_ipv4(buf: &mut Bytes) -> Result<(Vec<Label>, Ipv4Prefix), DecodeError> {
    let mut bits = buf.try_get_u8()? as u16;
    let labels = decode_labels(buf, &mut bits)?;
    let nbytes = bits.div_ceil(8) as usize;
    if nbytes > 4 || buf.remaining() < nbytes {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets[..nbytes]);
    Ok((labels, Ipv4Prefix { len: bits as u8, addr: Ipv4Addr::from(octets) }))
}

fn decode_labeled_ipv6(buf: &mut Bytes) -> Result<(Vec<Label>, Ipv6Prefix), DecodeError> {
    let mut bits = buf.try_get_u8()? as u16;
    let labels = decode_labels(buf, &mut bits)?;
    let nbytes = bits.div_ceil(8) as usize;
    if nbytes > 16 || buf.remaining() < nbytes {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets[..nbytes]);
    Ok((labels, Ipv6Prefix { len: bits as u8, addr: Ipv6Addr::from(octets) }))
}

fn decode_labeled_vpn_ipv4(
    buf: &mut Bytes,
) -> Result<(Vec<Label>, RouteDistinguisher, Ipv4Prefix), DecodeError> {
    let mut bits = buf.try_get_u8()? as u16;
    let labels = decode_labels(buf, &mut bits)?;
    let rd_bits = (RouteDistinguisher::LENGTH * 8) as u16;
    if bits < rd_bits || buf.remaining() < RouteDistinguisher::LENGTH {
        return Err(DecodeError::ReadOutOfBounds);
    }
    bits -= rd_bits;
    let rd = RouteDistinguisher::decode(buf);
    let nbytes = bits.div_ceil(8) as usize;
    if nbytes > 4 || buf.remaining() < nbytes {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets[..nbytes]);
    Ok((labels, rd, Ipv4Prefix { len: bits as u8, addr: Ipv4Addr::from(octets) }))
}

fn decode_labeled_vpn_ipv6(
    buf: &mut Bytes,
) -> Result<(Vec<Label>, RouteDistinguisher, Ipv6Prefix), DecodeError> {
    let mut bits = buf.try_get_u8()? as u16;
    let labels = decode_labels(buf, &mut bits)?;
    let rd_bits = (RouteDistinguisher::LENGTH * 8) as u16;
    if bits < rd_bits || buf.remaining() < RouteDistinguisher::LENGTH {
        return Err(DecodeError::ReadOutOfBounds);
    }
    bits -= rd_bits;
    let rd = RouteDistinguisher::decode(buf);
    let nbytes = bits.div_ceil(8) as usize;
    if nbytes > 16 || buf.remaining() < nbytes {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets[..nbytes]);
    Ok((labels, rd, Ipv6Prefix { len: bits as u8, addr: Ipv6Addr::from(octets) }))
}

fn encode_labeled_prefix(
    buf: &mut BytesMut,
    labels: &[Label],
    rd: Option<&RouteDistinguisher>,
    host_bits: u8,
    host_octets: &[u8],
) {
    let rd_bits = rd.map_or(0, |_| (RouteDistinguisher::LENGTH * 8) as u16);
    let total_bits = labels.len() as u16 * 24 + rd_bits + host_bits as u16;
    buf.put_u8(total_bits as u8);
    for label in labels {
        label.encode(buf);
    }
    if let Some(rd) = rd {
        rd.encode(buf);
    }
    let nbytes = (host_bits as usize).div_ceil(8);
    buf.put_slice(&host_octets[..nbytes]);
}

fn decode_vpls(buf: &mut Bytes) -> Result<VplsNlri, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let _len = buf.get_u16();
    if buf.remaining() < RouteDistinguisher::LENGTH + 9 {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let rd = RouteDistinguisher::decode(buf);
    let ve_id = buf.get_u16();
    let label_block_offset = buf.get_u16();
    let label_block_size = buf.get_u16();
    let label_base = Label::decode(buf);
    Ok(VplsNlri { rd, ve_id, label_block_offset, label_block_size, label_base })
}

fn encode_vpls(buf: &mut BytesMut, vpls: &VplsNlri) {
    buf.put_u16((RouteDistinguisher::LENGTH + 9) as u16);
    vpls.rd.encode(buf);
    buf.put_u16(vpls.ve_id);
    buf.put_u16(vpls.label_block_offset);
    buf.put_u16(vpls.label_block_size);
    vpls.label_base.encode(buf);
}

fn decode_evpn(buf: &mut Bytes) -> Result<EvpnRoute, DecodeError> {
    let route_type = buf.try_get_u8()?;
    let len = buf.try_get_u8()? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut body = buf.copy_to_bytes(len);
    Ok(match EvpnRouteType::from_u8(route_type) {
        Some(EvpnRouteType::EthernetAutoDiscovery) if body.remaining() >= 23 => {
            let rd = RouteDistinguisher::decode(&mut body);
            let esi = EthernetSegmentId::decode(&mut body);
            let tag = body.get_u32();
            let label = Label::decode(&mut body);
            EvpnRoute::EthernetAutoDiscovery { rd, esi, tag, label }
        }
        Some(EvpnRouteType::MacIpAdvertisement) if body.remaining() >= 25 => {
            let rd = RouteDistinguisher::decode(&mut body);
            let esi = EthernetSegmentId::decode(&mut body);
            let tag = body.get_u32();
            let _mac_bits = body.get_u8();
            let mac = MacAddress::decode(&mut body);
            let ip_bits = body.get_u8();
            let ip = match ip_bits {
                0 => None,
                bits => Some(decode_ip_by_bitlen(&mut body, bits)?),
            };
            let label1 = Label::decode(&mut body);
            let label2 = if body.remaining() >= 3 { Some(Label::decode(&mut body)) } else { None };
            EvpnRoute::MacIpAdvertisement { rd, esi, tag, mac, ip, label1, label2 }
        }
        Some(EvpnRouteType::InclusiveMulticastEthernetTag) if body.remaining() >= 13 => {
            let rd = RouteDistinguisher::decode(&mut body);
            let tag = body.get_u32();
            let ip_bits = body.get_u8();
            let originator = decode_ip_by_bitlen(&mut body, ip_bits)?;
            EvpnRoute::InclusiveMulticastEthernetTag { rd, tag, originator }
        }
        Some(EvpnRouteType::EthernetSegment) if body.remaining() >= 19 => {
            let rd = RouteDistinguisher::decode(&mut body);
            let esi = EthernetSegmentId::decode(&mut body);
            let ip_bits = body.get_u8();
            let originator = decode_ip_by_bitlen(&mut body, ip_bits)?;
            EvpnRoute::EthernetSegment { rd, esi, originator }
        }
        Some(EvpnRouteType::IpPrefix) if body.remaining() >= 34 => {
            let rd = RouteDistinguisher::decode(&mut body);
            let esi = EthernetSegmentId::decode(&mut body);
            let tag = body.get_u32();
            let prefix_len = body.get_u8();
            let is_v6 = len >= 58;
            let (prefix, gateway) = if is_v6 {
                let mut p = [0u8; 16];
                body.copy_to_slice(&mut p);
                let mut g = [0u8; 16];
                body.copy_to_slice(&mut g);
                (IpAddr::V6(Ipv6Addr::from(p)), IpAddr::V6(Ipv6Addr::from(g)))
            } else {
                let p = body.get_u32();
                let g = body.get_u32();
                (IpAddr::V4(Ipv4Addr::from(p)), IpAddr::V4(Ipv4Addr::from(g)))
            };
            let label = Label::decode(&mut body);
            EvpnRoute::IpPrefix { rd, esi, tag, prefix_len, prefix, gateway, label }
        }
        _ => EvpnRoute::Unknown { route_type, value: body },
    })
}

fn encode_evpn(buf: &mut BytesMut, route: &EvpnRoute) {
    let mut body = BytesMut::new();
    let route_type = match route {
        EvpnRoute::EthernetAutoDiscovery { rd, esi, tag, label } => {
            rd.encode(&mut body);
            esi.encode(&mut body);
            body.put_u32(*tag);
            label.encode(&mut body);
            EvpnRouteType::EthernetAutoDiscovery as u8
        }
        EvpnRoute::MacIpAdvertisement { rd, esi, tag, mac, ip, label1, label2 } => {
            rd.encode(&mut body);
            esi.encode(&mut body);
            body.put_u32(*tag);
            body.put_u8(48);
            mac.encode(&mut body);
            match ip {
                Some(IpAddr::V4(a)) => {
                    body.put_u8(32);
                    body.put_slice(&a.octets());
                }
                Some(IpAddr::V6(a)) => {
                    body.put_u8(128);
                    body.put_slice(&a.octets());
                }
                None => body.put_u8(0),
            }
            label1.encode(&mut body);
            if let Some(label2) = label2 {
                label2.encode(&mut body);
            }
            EvpnRouteType::MacIpAdvertisement as u8
        }
        EvpnRoute::InclusiveMulticastEthernetTag { rd, tag, originator } => {
            rd.encode(&mut body);
            body.put_u32(*tag);
            put_ip_with_len(&mut body, *originator);
            EvpnRouteType::InclusiveMulticastEthernetTag as u8
        }
        EvpnRoute::EthernetSegment { rd, esi, originator } => {
            rd.encode(&mut body);
            esi.encode(&mut body);
            put_ip_with_len(&mut body, *originator);
            EvpnRouteType::EthernetSegment as u8
        }
        EvpnRoute::IpPrefix { rd, esi, tag, prefix_len, prefix, gateway, label } => {
            rd.encode(&mut body);
            esi.encode(&mut body);
            body.put_u32(*tag);
            body.put_u8(*prefix_len);
            put_ip(&mut body, *prefix);
            put_ip(&mut body, *gateway);
            label.encode(&mut body);
            EvpnRouteType::IpPrefix as u8
        }
        EvpnRoute::Unknown { route_type, value } => {
            body.put_slice(value);
            *route_type
        }
    };
    buf.put_u8(route_type);
    buf.put_u8(body.len() as u8);
    buf.put_slice(&body);
}

fn put_ip_with_len(buf: &mut BytesMut, ip: IpAddr) {
    match ip {
        IpAddr::V4(a) => {
            buf.put_u8(32);
            buf.put_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            buf.put_u8(128);
            buf.put_slice(&a.octets());
        }
    }
}

fn decode_mcast_vpn(buf: &mut Bytes) -> Result<McastVpnRoute, DecodeError> {
    let route_type = buf.try_get_u8()?;
    let len = buf.try_get_u8()? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut body = buf.copy_to_bytes(len);
    Ok(match McastVpnRouteType::from_u8(route_type) {
        Some(McastVpnRouteType::IntraAsIPmsiAd) if body.remaining() >= RouteDistinguisher::LENGTH => {
            let rd = RouteDistinguisher::decode(&mut body);
            let originator = decode_ip_remaining(&mut body)?;
            McastVpnRoute::IntraAsIPmsiAd { rd, originator }
        }
        Some(McastVpnRouteType::InterAsIPmsiAd)
            if body.remaining() >= RouteDistinguisher::LENGTH + 4 =>
        {
            let rd = RouteDistinguisher::decode(&mut body);
            let source_as = body.get_u32();
            McastVpnRoute::InterAsIPmsiAd { rd, source_as }
        }
        Some(McastVpnRouteType::SPmsiAd) if body.remaining() >= RouteDistinguisher::LENGTH + 2 => {
            let rd = RouteDistinguisher::decode(&mut body);
            let source_len = body.get_u8();
            let source = decode_ip_by_bitlen(&mut body, source_len)?;
            let group_len = body.get_u8();
            let group = decode_ip_by_bitlen(&mut body, group_len)?;
            let originator = decode_ip_remaining(&mut body)?;
            McastVpnRoute::SPmsiAd { rd, source, source_len, group, group_len, originator }
        }
        Some(McastVpnRouteType::LeafAd) => McastVpnRoute::LeafAd { route_key: body },
        Some(McastVpnRouteType::SourceActiveAd)
            if body.remaining() >= RouteDistinguisher::LENGTH + 2 =>
        {
            let rd = RouteDistinguisher::decode(&mut body);
            let source_len = body.get_u8();
            let source = decode_ip_by_bitlen(&mut body, source_len)?;
            let group_len = body.get_u8();
            let group = decode_ip_by_bitlen(&mut body, group_len)?;
            McastVpnRoute::SourceActiveAd { rd, source, source_len, group, group_len }
        }
        Some(McastVpnRouteType::SharedTreeJoin)
            if body.remaining() >= RouteDistinguisher::LENGTH + 6 =>
        {
            let rd = RouteDistinguisher::decode(&mut body);
            let source_as = body.get_u32();
            let source_len = body.get_u8();
            let source = decode_ip_by_bitlen(&mut body, source_len)?;
            let group_len = body.get_u8();
            let group = decode_ip_by_bitlen(&mut body, group_len)?;
            McastVpnRoute::SharedTreeJoin { rd, source_as, source, source_len, group, group_len }
        }
        Some(McastVpnRouteType::SourceTreeJoin)
            if body.remaining() >= RouteDistinguisher::LENGTH + 6 =>
        {
            let rd = RouteDistinguisher::decode(&mut body);
            let source_as = body.get_u32();
            let source_len = body.get_u8();
            let source = decode_ip_by_bitlen(&mut body, source_len)?;
            let group_len = body.get_u8();
            let group = decode_ip_by_bitlen(&mut body, group_len)?;
            McastVpnRoute::SourceTreeJoin { rd, source_as, source, source_len, group, group_len }
        }
        _ => return Err(DecodeError::ReadOutOfBounds),
    })
}

fn encode_mcast_vpn(buf: &mut BytesMut, route: &McastVpnRoute) {
    let mut body = BytesMut::new();
    let route_type = match route {
        McastVpnRoute::IntraAsIPmsiAd { rd, originator } => {
            rd.encode(&mut body);
            put_ip(&mut body, *originator);
            McastVpnRouteType::IntraAsIPmsiAd as u8
        }
        McastVpnRoute::InterAsIPmsiAd { rd, source_as } => {
            rd.encode(&mut body);
            body.put_u32(*source_as);
            McastVpnRouteType::InterAsIPmsiAd as u8
        }
        McastVpnRoute::SPmsiAd { rd, source, source_len, group, group_len, originator } => {
            rd.encode(&mut body);
            body.put_u8(*source_len);
            put_ip(&mut body, *source);
            body.put_u8(*group_len);
            put_ip(&mut body, *group);
            put_ip(&mut body, *originator);
            McastVpnRouteType::SPmsiAd as u8
        }
        McastVpnRoute::LeafAd { route_key } => {
            body.put_slice(route_key);
            McastVpnRouteType::LeafAd as u8
        }
        McastVpnRoute::SourceActiveAd { rd, source, source_len, group, group_len } => {
            rd.encode(&mut body);
            body.put_u8(*source_len);
            put_ip(&mut body, *source);
            body.put_u8(*group_len);
            put_ip(&mut body, *group);
            McastVpnRouteType::SourceActiveAd as u8
        }
        McastVpnRoute::SharedTreeJoin { rd, source_as, source, source_len, group, group_len } => {
            rd.encode(&mut body);
            body.put_u32(*source_as);
            body.put_u8(*source_len);
            put_ip(&mut body, *source);
            body.put_u8(*group_len);
            put_ip(&mut body, *group);
            McastVpnRouteType::SharedTreeJoin as u8
        }
        McastVpnRoute::SourceTreeJoin { rd, source_as, source, source_len, group, group_len } => {
            rd.encode(&mut body);
            body.put_u32(*source_as);
            body.put_u8(*source_len);
            put_ip(&mut body, *source);
            body.put_u8(*group_len);
            put_ip(&mut body, *group);
            McastVpnRouteType::SourceTreeJoin as u8
        }
    };
    buf.put_u8(route_type);
    buf.put_u8(body.len() as u8);
    buf.put_slice(&body);
}

/// Reads the RFC 5575 flowspec NLRI length prefix: one octet if the value
/// fits, else two with the top nibble forced to `0xF`.
fn decode_flowspec_len(buf: &mut Bytes) -> Result<usize, DecodeError> {
    let first = buf.try_get_u8()?;
    if first & 0xF0 == 0xF0 {
        let second = buf.try_get_u8()?;
        Ok((((first as usize) & 0x0F) << 8) | second as usize)
    } else {
        Ok(first as usize)
    }
}

fn decode_flowspec(buf: &mut Bytes) -> Result<Vec<FlowSpecComponent>, DecodeError> {
    let len = decode_flowspec_len(buf)?;
    if buf.remaining() < len {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut body = buf.copy_to_bytes(len);
    let mut components = Vec::new();
    while body.has_remaining() {
        let component_type = body.try_get_u8()?;
        let value = match component_type {
            1 | 2 => {
                let prefix_len = body.try_get_u8()?;
                let nbytes = prefix_len.div_ceil(8) as usize;
                if body.remaining() < nbytes {
                    return Err(DecodeError::ReadOutOfBounds);
                }
                let mut v = BytesMut::with_capacity(1 + nbytes);
                v.put_u8(prefix_len);
                v.put_slice(&body.copy_to_bytes(nbytes));
                v.freeze()
            }
            _ => {
                let mut v = BytesMut::new();
                loop {
                    let op = body.try_get_u8()?;
                    let value_len = 1usize << ((op >> 4) & 0x3);
                    if body.remaining() < value_len {
                        return Err(DecodeError::ReadOutOfBounds);
                    }
                    v.put_u8(op);
                    v.put_slice(&body.copy_to_bytes(value_len));
                    if op & 0x80 != 0 {
                        break;
                    }
                }
                v.freeze()
            }
        };
        components.push(FlowSpecComponent { component_type, value });
    }
    Ok(components)
}

fn encode_flowspec(buf: &mut BytesMut, components: &[FlowSpecComponent]) {
    let mut body = BytesMut::new();
    for c in components {
        body.put_u8(c.component_type);
        body.put_slice(&c.value);
    }
    if body.len() < 240 {
        buf.put_u8(body.len() as u8);
    } else {
        buf.put_u16(0xF000 | body.len() as u16);
    }
    buf.put_slice(&body);
}

fn decode_bgpls(buf: &mut Bytes) -> Result<BgpLsNlri, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let nlri_type = buf.get_u16();
    let total_len = buf.get_u16() as usize;
    if total_len < 9 || buf.remaining() < total_len {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let protocol_id = buf.get_u8();
    let identifier = buf.get_u64();
    let descriptors = buf.copy_to_bytes(total_len - 9);
    Ok(BgpLsNlri { nlri_type, protocol_id, identifier, descriptors })
}

fn encode_bgpls(buf: &mut BytesMut, ls: &BgpLsNlri) {
    buf.put_u16(ls.nlri_type);
    buf.put_u16((9 + ls.descriptors.len()) as u16);
    buf.put_u8(ls.protocol_id);
    buf.put_u64(ls.identifier);
    buf.put_slice(&ls.descriptors);
}

fn decode_rtc(buf: &mut Bytes) -> Result<(u32, [u8; 8]), DecodeError> {
    let prefix_bits = buf.try_get_u8()?;
    let nbytes = (prefix_bits as usize).div_ceil(8);
    if nbytes > 12 || buf.remaining() < nbytes {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let mut raw = [0u8; 12];
    buf.copy_to_slice(&mut raw[..nbytes]);
    let origin_as = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let mut route_target = [0u8; 8];
    route_target.copy_from_slice(&raw[4..12]);
    Ok((origin_as, route_target))
}

fn encode_rtc(buf: &mut BytesMut, origin_as: u32, route_target: &[u8; 8]) {
    buf.put_u8(96);
    buf.put_u32(origin_as);
    buf.put_slice(route_target);
}

fn decode_mup(buf: &mut Bytes) -> Result<MupNlri, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let arch_type = buf.get_u8();
    let route_type = buf.get_u16();
    let len = buf.try_get_u8()? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let value = buf.copy_to_bytes(len);
    Ok(MupNlri { arch_type, route_type, value })
}

fn encode_mup(buf: &mut BytesMut, mup: &MupNlri) {
    buf.put_u8(mup.arch_type);
    buf.put_u16(mup.route_type);
    buf.put_u8(mup.value.len() as u8);
    buf.put_slice(&mup.value);
}

fn encode_path_id(buf: &mut BytesMut, path_id: Option<PathId>) {
    if let Some(path_id) = path_id {
        path_id.encode(buf);
    }
}

fn evpn_index_bytes(route: &EvpnRoute) -> Vec<u8> {
    let mut buf = BytesMut::new();
    match route {
        EvpnRoute::EthernetAutoDiscovery { rd, esi, tag, .. } => {
            buf.put_u8(EvpnRouteType::EthernetAutoDiscovery as u8);
            rd.encode(&mut buf);
            esi.encode(&mut buf);
            buf.put_u32(*tag);
        }
        EvpnRoute::MacIpAdvertisement { rd, esi, tag, mac, ip, .. } => {
            buf.put_u8(EvpnRouteType::MacIpAdvertisement as u8);
            rd.encode(&mut buf);
            esi.encode(&mut buf);
            buf.put_u32(*tag);
            mac.encode(&mut buf);
            if let Some(ip) = ip {
                match ip {
                    std::net::IpAddr::V4(a) => buf.put_slice(&a.octets()),
                    std::net::IpAddr::V6(a) => buf.put_slice(&a.octets()),
                }
            }
        }
        EvpnRoute::InclusiveMulticastEthernetTag { rd, tag, .. } => {
            buf.put_u8(EvpnRouteType::InclusiveMulticastEthernetTag as u8);
            rd.encode(&mut buf);
            buf.put_u32(*tag);
        }
        EvpnRoute::EthernetSegment { rd, esi, .. } => {
            buf.put_u8(EvpnRouteType::EthernetSegment as u8);
            rd.encode(&mut buf);
            esi.encode(&mut buf);
        }
        EvpnRoute::IpPrefix { rd, esi, tag, prefix_len, prefix, .. } => {
            buf.put_u8(EvpnRouteType::IpPrefix as u8);
            rd.encode(&mut buf);
            esi.encode(&mut buf);
            buf.put_u32(*tag);
            buf.put_u8(*prefix_len);
            match prefix {
                std::net::IpAddr::V4(a) => buf.put_slice(&a.octets()),
                std::net::IpAddr::V6(a) => buf.put_slice(&a.octets()),
            }
        }
        EvpnRoute::Unknown { route_type, value } => {
            buf.put_u8(*route_type);
            buf.put_slice(value);
        }
    }
    buf.to_vec()
}

fn mcast_vpn_index_bytes(route: &McastVpnRoute) -> Vec<u8> {
    let mut buf = BytesMut::new();
    match route {
        McastVpnRoute::IntraAsIPmsiAd { rd, originator } => {
            buf.put_u8(McastVpnRouteType::IntraAsIPmsiAd as u8);
            rd.encode(&mut buf);
            put_ip(&mut buf, *originator);
        }
        McastVpnRoute::InterAsIPmsiAd { rd, source_as } => {
            buf.put_u8(McastVpnRouteType::InterAsIPmsiAd as u8);
            rd.encode(&mut buf);
            buf.put_u32(*source_as);
        }
        McastVpnRoute::SPmsiAd { rd, source, group, .. } => {
            buf.put_u8(McastVpnRouteType::SPmsiAd as u8);
            rd.encode(&mut buf);
            put_ip(&mut buf, *source);
            put_ip(&mut buf, *group);
        }
        McastVpnRoute::LeafAd { route_key } => {
            buf.put_u8(McastVpnRouteType::LeafAd as u8);
            buf.put_slice(route_key);
        }
        McastVpnRoute::SourceActiveAd { rd, source, group, .. } => {
            buf.put_u8(McastVpnRouteType::SourceActiveAd as u8);
            rd.encode(&mut buf);
            put_ip(&mut buf, *source);
            put_ip(&mut buf, *group);
        }
        McastVpnRoute::SharedTreeJoin { rd, source_as, source, group, .. } => {
            buf.put_u8(McastVpnRouteType::SharedTreeJoin as u8);
            rd.encode(&mut buf);
            buf.put_u32(*source_as);
            put_ip(&mut buf, *source);
            put_ip(&mut buf, *group);
        }
        McastVpnRoute::SourceTreeJoin { rd, source_as, source, group, .. } => {
            buf.put_u8(McastVpnRouteType::SourceTreeJoin as u8);
            rd.encode(&mut buf);
            buf.put_u32(*source_as);
            put_ip(&mut buf, *source);
            put_ip(&mut buf, *group);
        }
    }
    buf.to_vec()
}

fn put_ip(buf: &mut BytesMut, ip: std::net::IpAddr) {
    match ip {
        std::net::IpAddr::V4(a) => buf.put_slice(&a.octets()),
        std::net::IpAddr::V6(a) => buf.put_slice(&a.octets()),
    }
}

/// FlowSpec's canonical index: components sorted by type, per §4.C3.
fn flowspec_index_bytes(components: &[FlowSpecComponent]) -> Vec<u8> {
    let mut sorted: Vec<&FlowSpecComponent> = components.iter().collect();
    sorted.sort_by_key(|c| c.component_type);
    let mut buf = BytesMut::new();
    for c in sorted {
        buf.put_u8(c.component_type);
        buf.put_slice(&c.value);
    }
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_prefix_round_trip() {
        let prefix = Ipv4Prefix { len: 24, addr: Ipv4Addr::new(10, 0, 0, 0) };
        let mut buf = BytesMut::new();
        prefix.encode(&mut buf);
        assert_eq!(buf.len(), 4);
        let mut rd = buf.freeze();
        let decoded = Ipv4Prefix::decode(&mut rd).unwrap();
        assert_eq!(decoded, prefix);
    }

    #[test]
    fn ipv4_prefix_host_route() {
        let prefix = Ipv4Prefix { len: 32, addr: Ipv4Addr::new(192, 0, 2, 1) };
        let mut buf = BytesMut::new();
        prefix.encode(&mut buf);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn labeled_unicast_index_excludes_labels() {
        let prefix = Ipv4Prefix { len: 24, addr: Ipv4Addr::new(10, 0, 0, 0) };
        let a = Nlri::Ipv4LabeledUnicast {
            prefix,
            labels: vec![Label::new(100, true)],
            path_id: None,
        };
        let b = Nlri::Ipv4LabeledUnicast {
            prefix,
            labels: vec![Label::new(200, true)],
            path_id: None,
        };
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn labeled_unicast_round_trip() {
        let nlri = Nlri::Ipv4LabeledUnicast {
            prefix: Ipv4Prefix { len: 24, addr: Ipv4Addr::new(10, 0, 0, 0) },
            labels: vec![Label::new(100, true)],
            path_id: None,
        };
        let mut buf = BytesMut::new();
        nlri.encode(&mut buf);
        let mut rd = buf.freeze();
        let decoded = Nlri::decode_many(&mut rd, (AddressFamily::Ipv4, Safi::LabeledUnicast), false)
            .unwrap();
        assert_eq!(decoded, vec![nlri]);
    }

    #[test]
    fn l3vpn_round_trip_with_add_path() {
        let nlri = Nlri::Ipv4L3vpn {
            rd: RouteDistinguisher::Asn2(65000, 1),
            prefix: Ipv4Prefix { len: 32, addr: Ipv4Addr::new(192, 0, 2, 1) },
            labels: vec![Label::new(42, true)],
            path_id: Some(PathId(7)),
        };
        let mut buf = BytesMut::new();
        nlri.encode(&mut buf);
        let mut rd = buf.freeze();
        let decoded = Nlri::decode_many(&mut rd, (AddressFamily::Ipv4, Safi::LabeledVpn), true)
            .unwrap();
        assert_eq!(decoded, vec![nlri]);
    }

    #[test]
    fn flowspec_round_trip() {
        let components = vec![
            FlowSpecComponent { component_type: 1, value: Bytes::from_static(&[24, 10, 0, 0]) },
            FlowSpecComponent { component_type: 3, value: Bytes::from_static(&[0x81, 6]) },
        ];
        let nlri = Nlri::Ipv4FlowSpec(components);
        let mut buf = BytesMut::new();
        nlri.encode(&mut buf);
        let mut rd = buf.freeze();
        let decoded =
            Nlri::decode_many(&mut rd, (AddressFamily::Ipv4, Safi::Ipv4FlowSpec), false).unwrap();
        assert_eq!(decoded, vec![nlri]);
    }

    #[test]
    fn flowspec_index_is_order_independent() {
        let a = Nlri::Ipv4FlowSpec(vec![
            FlowSpecComponent { component_type: 3, value: Bytes::from_static(&[1]) },
            FlowSpecComponent { component_type: 1, value: Bytes::from_static(&[2]) },
        ]);
        let b = Nlri::Ipv4FlowSpec(vec![
            FlowSpecComponent { component_type: 1, value: Bytes::from_static(&[2]) },
            FlowSpecComponent { component_type: 3, value: Bytes::from_static(&[1]) },
        ]);
        assert_eq!(a.index(), b.index());
    }
}
