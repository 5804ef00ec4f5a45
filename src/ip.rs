//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Wire primitives shared by every other module: AFI/SAFI-adjacent address
//! family tagging, route distinguishers, MPLS labels, path identifiers,
//! Ethernet Segment Identifiers and MAC addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

// ===== AddressFamily =====

/// The IP address family of an AFI, independent of the SAFI.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The two-octet AFI wire value (RFC 3232 IANA "Address Family Numbers").
    pub const fn afi(&self) -> u16 {
        match self {
            AddressFamily::Ipv4 => 1,
            AddressFamily::Ipv6 => 2,
        }
    }

    pub const fn from_afi(afi: u16) -> Option<AddressFamily> {
        match afi {
            1 => Some(AddressFamily::Ipv4),
            2 => Some(AddressFamily::Ipv6),
            _ => None,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Extension trait that tags a concrete `IpAddr` with its `AddressFamily`.
pub trait IpAddrExt {
    fn address_family(&self) -> AddressFamily;
    fn is_unspecified_addr(&self) -> bool;
}

impl IpAddrExt for IpAddr {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn is_unspecified_addr(&self) -> bool {
        match self {
            IpAddr::V4(addr) => *addr == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(addr) => *addr == Ipv6Addr::UNSPECIFIED,
        }
    }
}

// ===== Route Distinguisher (RFC 4364 §4.2) =====

/// An 8-byte Route Distinguisher used to disambiguate VPN address families.
///
/// Three type encodings are legal on the wire: Type 0 (2-octet ASN + 4-octet
/// number), Type 1 (4-octet IPv4 address + 2-octet number) and Type 2
/// (4-octet ASN + 2-octet number).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum RouteDistinguisher {
    Asn2(u16, u32),
    Ipv4(Ipv4Addr, u16),
    Asn4(u32, u16),
}

impl RouteDistinguisher {
    pub const LENGTH: usize = 8;

    pub fn decode(buf: &mut impl Buf) -> RouteDistinguisher {
        let rd_type = buf.get_u16();
        match rd_type {
            0 => {
                let asn = buf.get_u16();
                let number = buf.get_u32();
                RouteDistinguisher::Asn2(asn, number)
            }
            1 => {
                let addr = Ipv4Addr::from(buf.get_u32());
                let number = buf.get_u16();
                RouteDistinguisher::Ipv4(addr, number)
            }
            _ => {
                let asn = buf.get_u32();
                let number = buf.get_u16();
                RouteDistinguisher::Asn4(asn, number)
            }
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            RouteDistinguisher::Asn2(asn, number) => {
                buf.put_u16(0);
                buf.put_u16(*asn);
                buf.put_u32(*number);
            }
            RouteDistinguisher::Ipv4(addr, number) => {
                buf.put_u16(1);
                buf.put_u32((*addr).into());
                buf.put_u16(*number);
            }
            RouteDistinguisher::Asn4(asn, number) => {
                buf.put_u16(2);
                buf.put_u32(*asn);
                buf.put_u16(*number);
            }
        }
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDistinguisher::Asn2(asn, number) => write!(f, "{asn}:{number}"),
            RouteDistinguisher::Ipv4(addr, number) => write!(f, "{addr}:{number}"),
            RouteDistinguisher::Asn4(asn, number) => write!(f, "{asn}:{number}"),
        }
    }
}

// ===== MPLS label =====

/// A single 3-octet MPLS label stack entry: a 20-bit label value, 3-bit
/// traffic class/experimental field and a 1-bit bottom-of-stack marker.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Label(u32);

impl Label {
    /// The reserved "Implicit NULL" label used by labeled-unicast withdraws.
    pub const IMPLICIT_NULL: Label = Label(3 << 4);
    pub const WITHDRAW: Label = Label(0x80_00_00);

    pub fn new(value: u32, bottom_of_stack: bool) -> Label {
        Label((value << 4) | if bottom_of_stack { 1 } else { 0 })
    }

    pub fn value(&self) -> u32 {
        self.0 >> 4
    }

    pub fn is_bottom_of_stack(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn decode(buf: &mut impl Buf) -> Label {
        let b0 = buf.get_u8() as u32;
        let b1 = buf.get_u8() as u32;
        let b2 = buf.get_u8() as u32;
        Label((b0 << 16) | (b1 << 8) | b2)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let raw = self.0;
        buf.put_u8(((raw >> 16) & 0xFF) as u8);
        buf.put_u8(((raw >> 8) & 0xFF) as u8);
        buf.put_u8((raw & 0xFF) as u8);
    }
}

// ===== ADD-PATH path identifier =====

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct PathId(pub u32);

impl PathId {
    pub fn decode(buf: &mut impl Buf) -> PathId {
        PathId(buf.get_u32())
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.0);
    }
}

// ===== Ethernet Segment Identifier (RFC 7432 §3) =====

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct EthernetSegmentId(pub [u8; 10]);

impl EthernetSegmentId {
    pub const LENGTH: usize = 10;

    pub fn decode(buf: &mut impl Buf) -> EthernetSegmentId {
        let mut esi = [0u8; Self::LENGTH];
        buf.copy_to_slice(&mut esi);
        EthernetSegmentId(esi)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

// ===== MAC address =====

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const LENGTH: usize = 6;

    pub fn decode(buf: &mut impl Buf) -> MacAddress {
        let mut mac = [0u8; Self::LENGTH];
        buf.copy_to_slice(&mut mac);
        MacAddress(mac)
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trip() {
        let label = Label::new(1000, true);
        let mut buf = bytes::BytesMut::new();
        label.encode(&mut buf);
        assert_eq!(buf.len(), 3);
        let mut rd = buf.freeze();
        let decoded = Label::decode(&mut rd);
        assert_eq!(decoded.value(), 1000);
        assert!(decoded.is_bottom_of_stack());
    }

    #[test]
    fn rd_round_trip_all_types() {
        for rd in [
            RouteDistinguisher::Asn2(65000, 100),
            RouteDistinguisher::Ipv4(Ipv4Addr::new(192, 0, 2, 1), 200),
            RouteDistinguisher::Asn4(4_200_000_000, 300),
        ] {
            let mut buf = bytes::BytesMut::new();
            rd.encode(&mut buf);
            assert_eq!(buf.len(), RouteDistinguisher::LENGTH);
            let mut rdr = buf.freeze();
            assert_eq!(RouteDistinguisher::decode(&mut rdr), rd);
        }
    }
}
