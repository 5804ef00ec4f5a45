//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Capability negotiation (§4.C5). Capabilities are carried in OPEN optional
//! parameters; this module defines the wire representation of each
//! supported capability and the `Negotiated` session agreement derived by
//! intersecting a local `offered` set against a remote `received` set.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, BufMut, Bytes};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::packet::consts::{AddPathMode, CapabilityCode, Safi};
use crate::ip::AddressFamily;

pub type Family = (AddressFamily, Safi);

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct AddPathTuple {
    pub afi: AddressFamily,
    pub safi: Safi,
    pub mode: AddPathMode,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct GracefulRestartAf {
    pub afi: AddressFamily,
    pub safi: Safi,
    pub forwarding_state_preserved: bool,
}

/// A single BGP capability as carried in an OPEN optional parameter.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(enum_as_inner::EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Capability {
    MultiProtocol { afi: AddressFamily, safi: Safi },
    RouteRefresh,
    RouteRefreshCisco,
    ExtendedNextHop(Vec<(AddressFamily, Safi, AddressFamily)>),
    ExtendedMessage,
    Operational,
    GracefulRestart {
        restart_flag: bool,
        restart_time: u16,
        families: Vec<GracefulRestartAf>,
    },
    FourOctetAsNumber { asn: u32 },
    AddPath(BTreeSet<AddPathTuple>),
    EnhancedRouteRefresh,
    Hostname { hostname: String, domain: String },
    SoftwareVersion(String),
    LongLivedGracefulRestart(Vec<(AddressFamily, Safi, u8, u32)>),
    Unknown { code: u8, value: Bytes },
}

/// The subset of `Capability` that is meaningful after a session has been
/// negotiated (stripped of raw unknown-capability bytes).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NegotiatedCapability {
    MultiProtocol(AddressFamily, Safi),
    RouteRefresh,
    ExtendedMessage,
    FourOctetAsNumber(u32),
    AddPath(AddPathTuple),
    EnhancedRouteRefresh,
}

/// The derived, immutable per-session agreement produced by capability
/// intersection (§3 "Negotiated").
#[derive(Clone, Debug)]
pub struct Negotiated {
    pub four_octet_asn: bool,
    pub remote_asn: u32,
    pub families: BTreeSet<Family>,
    pub add_path: BTreeMap<Family, AddPathMode>,
    pub route_refresh: bool,
    pub enhanced_route_refresh: bool,
    pub max_message_size: usize,
    pub holdtime: u16,
}

// ===== impl Capability =====

impl Capability {
    pub fn code(&self) -> u8 {
        match self {
            Capability::MultiProtocol { .. } => CapabilityCode::MultiProtocol as u8,
            Capability::RouteRefresh => CapabilityCode::RouteRefresh as u8,
            Capability::RouteRefreshCisco => CapabilityCode::RouteRefreshCisco as u8,
            Capability::ExtendedNextHop(..) => CapabilityCode::ExtendedNextHop as u8,
            Capability::ExtendedMessage => CapabilityCode::ExtendedMessage as u8,
            Capability::Operational => CapabilityCode::Operational as u8,
            Capability::GracefulRestart { .. } => CapabilityCode::GracefulRestart as u8,
            Capability::FourOctetAsNumber { .. } => {
                CapabilityCode::FourOctetAsNumber as u8
            }
            Capability::AddPath(..) => CapabilityCode::AddPath as u8,
            Capability::EnhancedRouteRefresh => {
                CapabilityCode::EnhancedRouteRefresh as u8
            }
            Capability::Hostname { .. } => CapabilityCode::Hostname as u8,
            Capability::SoftwareVersion(..) => CapabilityCode::SoftwareVersion as u8,
            Capability::LongLivedGracefulRestart(..) => {
                CapabilityCode::LongLivedGracefulRestart as u8
            }
            Capability::Unknown { code, .. } => *code,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.code());
        let mut value = bytes::BytesMut::new();
        match self {
            Capability::MultiProtocol { afi, safi } => {
                value.put_u16(afi.afi());
                value.put_u8(0);
                value.put_u8(safi.to_u8().unwrap());
            }
            Capability::RouteRefresh
            | Capability::RouteRefreshCisco
            | Capability::ExtendedMessage
            | Capability::Operational
            | Capability::EnhancedRouteRefresh => {}
            Capability::ExtendedNextHop(tuples) => {
                for (afi, safi, nh_afi) in tuples {
                    value.put_u16(afi.afi());
                    value.put_u16(safi.to_u16().unwrap());
                    value.put_u16(nh_afi.afi());
                }
            }
            Capability::GracefulRestart {
                restart_flag,
                restart_time,
                families,
            } => {
                let flags: u16 = if *restart_flag { 0x8000 } else { 0 };
                value.put_u16(flags | (*restart_time & 0x0FFF));
                for af in families {
                    value.put_u16(af.afi.afi());
                    value.put_u8(af.safi.to_u8().unwrap());
                    value.put_u8(if af.forwarding_state_preserved { 0x80 } else { 0 });
                }
            }
            Capability::FourOctetAsNumber { asn } => value.put_u32(*asn),
            Capability::AddPath(tuples) => {
                for tuple in tuples {
                    value.put_u16(tuple.afi.afi());
                    value.put_u8(tuple.safi.to_u8().unwrap());
                    value.put_u8(tuple.mode.to_u8().unwrap());
                }
            }
            Capability::Hostname { hostname, domain } => {
                value.put_u8(hostname.len() as u8);
                value.put_slice(hostname.as_bytes());
                value.put_u8(domain.len() as u8);
                value.put_slice(domain.as_bytes());
            }
            Capability::SoftwareVersion(version) => {
                value.put_u8(version.len() as u8);
                value.put_slice(version.as_bytes());
            }
            Capability::LongLivedGracefulRestart(families) => {
                for (afi, safi, flags, time) in families {
                    value.put_u16(afi.afi());
                    value.put_u8(safi.to_u8().unwrap());
                    value.put_u8(*flags);
                    // 24-bit restart time.
                    value.put_u8(((*time >> 16) & 0xFF) as u8);
                    value.put_u8(((*time >> 8) & 0xFF) as u8);
                    value.put_u8((*time & 0xFF) as u8);
                }
            }
            Capability::Unknown { value: raw, .. } => value.put_slice(raw),
        }
        buf.put_u8(value.len() as u8);
        buf.put_slice(&value);
    }

    pub fn decode(code: u8, mut value: Bytes) -> Option<Capability> {
        let cap = match CapabilityCode::from_u8(code) {
            Some(CapabilityCode::MultiProtocol) if value.remaining() >= 4 => {
                let afi = AddressFamily::from_afi(value.get_u16())?;
                value.advance(1);
                let safi = Safi::from_u8(value.get_u8())?;
                Capability::MultiProtocol { afi, safi }
            }
            Some(CapabilityCode::RouteRefresh) => Capability::RouteRefresh,
            Some(CapabilityCode::RouteRefreshCisco) => Capability::RouteRefreshCisco,
            Some(CapabilityCode::ExtendedNextHop) => {
                let mut tuples = Vec::new();
                while value.remaining() >= 6 {
                    let afi = AddressFamily::from_afi(value.get_u16())?;
                    let safi = Safi::from_u16(value.get_u16())?;
                    let nh_afi = AddressFamily::from_afi(value.get_u16())?;
                    tuples.push((afi, safi, nh_afi));
                }
                Capability::ExtendedNextHop(tuples)
            }
            Some(CapabilityCode::ExtendedMessage) => Capability::ExtendedMessage,
            Some(CapabilityCode::Operational) => Capability::Operational,
            Some(CapabilityCode::GracefulRestart) if value.remaining() >= 2 => {
                let flags = value.get_u16();
                let restart_flag = flags & 0x8000 != 0;
                let restart_time = flags & 0x0FFF;
                let mut families = Vec::new();
                while value.remaining() >= 4 {
                    let afi = AddressFamily::from_afi(value.get_u16())?;
                    let safi = Safi::from_u8(value.get_u8())?;
                    let af_flags = value.get_u8();
                    families.push(GracefulRestartAf {
                        afi,
                        safi,
                        forwarding_state_preserved: af_flags & 0x80 != 0,
                    });
                }
                Capability::GracefulRestart {
                    restart_flag,
                    restart_time,
                    families,
                }
            }
            Some(CapabilityCode::FourOctetAsNumber) if value.remaining() >= 4 => {
                Capability::FourOctetAsNumber {
                    asn: value.get_u32(),
                }
            }
            Some(CapabilityCode::AddPath) => {
                let mut tuples = BTreeSet::new();
                while value.remaining() >= 4 {
                    let afi = AddressFamily::from_afi(value.get_u16())?;
                    let safi = Safi::from_u8(value.get_u8())?;
                    let mode = AddPathMode::from_u8(value.get_u8())?;
                    tuples.insert(AddPathTuple { afi, safi, mode });
                }
                Capability::AddPath(tuples)
            }
            Some(CapabilityCode::EnhancedRouteRefresh) => {
                Capability::EnhancedRouteRefresh
            }
            Some(CapabilityCode::Hostname) => {
                let hlen = value.get_u8() as usize;
                let hostname =
                    String::from_utf8_lossy(&value.copy_to_bytes(hlen)).into_owned();
                let dlen = value.get_u8() as usize;
                let domain =
                    String::from_utf8_lossy(&value.copy_to_bytes(dlen)).into_owned();
                Capability::Hostname { hostname, domain }
            }
            Some(CapabilityCode::SoftwareVersion) => {
                let len = value.get_u8() as usize;
                let version =
                    String::from_utf8_lossy(&value.copy_to_bytes(len)).into_owned();
                Capability::SoftwareVersion(version)
            }
            Some(CapabilityCode::LongLivedGracefulRestart) => {
                let mut families = Vec::new();
                while value.remaining() >= 7 {
                    let afi = AddressFamily::from_afi(value.get_u16())?;
                    let safi = Safi::from_u8(value.get_u8())?;
                    let flags = value.get_u8();
                    let time = ((value.get_u8() as u32) << 16)
                        | ((value.get_u8() as u32) << 8)
                        | (value.get_u8() as u32);
                    families.push((afi, safi, flags, time));
                }
                Capability::LongLivedGracefulRestart(families)
            }
            _ => Capability::Unknown { code, value },
        };
        Some(cap)
    }
}

// ===== impl Negotiated =====

impl Negotiated {
    /// Intersects locally offered capabilities against the remote's
    /// received set, per §4.C5. `local_holdtime`/`remote_holdtime` are the
    /// values carried in the two OPEN messages (not capabilities).
    pub fn compute(
        offered: &[Capability],
        received: &[Capability],
        local_holdtime: u16,
        remote_holdtime: u16,
    ) -> Negotiated {
        let local_as4 = offered
            .iter()
            .find_map(|c| match c {
                Capability::FourOctetAsNumber { asn } => Some(*asn),
                _ => None,
            });
        let remote_as4 = received.iter().find_map(|c| match c {
            Capability::FourOctetAsNumber { asn } => Some(*asn),
            _ => None,
        });
        let four_octet_asn = local_as4.is_some() && remote_as4.is_some();

        let local_families: BTreeSet<Family> = offered
            .iter()
            .filter_map(|c| match c {
                Capability::MultiProtocol { afi, safi } => Some((*afi, *safi)),
                _ => None,
            })
            .collect();
        let remote_families: BTreeSet<Family> = received
            .iter()
            .filter_map(|c| match c {
                Capability::MultiProtocol { afi, safi } => Some((*afi, *safi)),
                _ => None,
            })
            .collect();
        let families: BTreeSet<Family> = local_families
            .intersection(&remote_families)
            .copied()
            .collect();

        let local_add_path: BTreeMap<Family, AddPathMode> = offered
            .iter()
            .filter_map(|c| match c {
                Capability::AddPath(tuples) => Some(tuples),
                _ => None,
            })
            .flatten()
            .map(|t| ((t.afi, t.safi), t.mode))
            .collect();
        let remote_add_path: BTreeMap<Family, AddPathMode> = received
            .iter()
            .filter_map(|c| match c {
                Capability::AddPath(tuples) => Some(tuples),
                _ => None,
            })
            .flatten()
            .map(|t| ((t.afi, t.safi), t.mode))
            .collect();
        let mut add_path = BTreeMap::new();
        for (family, local_mode) in &local_add_path {
            if let Some(remote_mode) = remote_add_path.get(family) {
                if let Some(mode) = add_path_and(*local_mode, *remote_mode) {
                    add_path.insert(*family, mode);
                }
            }
        }

        let local_rr = offered.iter().any(|c| {
            matches!(c, Capability::RouteRefresh | Capability::RouteRefreshCisco)
        });
        let remote_rr = received.iter().any(|c| {
            matches!(c, Capability::RouteRefresh | Capability::RouteRefreshCisco)
        });
        let local_err = offered
            .iter()
            .any(|c| matches!(c, Capability::EnhancedRouteRefresh));
        let remote_err = received
            .iter()
            .any(|c| matches!(c, Capability::EnhancedRouteRefresh));

        let local_ext_msg = offered
            .iter()
            .any(|c| matches!(c, Capability::ExtendedMessage));
        let remote_ext_msg = received
            .iter()
            .any(|c| matches!(c, Capability::ExtendedMessage));
        let max_message_size = if local_ext_msg && remote_ext_msg {
            super::consts::EXTENDED_MAX_MSG_LEN
        } else {
            super::consts::DFLT_MAX_MSG_LEN
        };

        Negotiated {
            four_octet_asn,
            remote_asn: remote_as4.unwrap_or(0),
            families,
            add_path,
            route_refresh: local_rr && remote_rr,
            enhanced_route_refresh: local_err && remote_err,
            max_message_size,
            holdtime: local_holdtime.min(remote_holdtime),
        }
    }

    pub fn add_path_mode(&self, family: Family) -> Option<AddPathMode> {
        self.add_path.get(&family).copied()
    }
}

fn add_path_and(a: AddPathMode, b: AddPathMode) -> Option<AddPathMode> {
    let send = matches!(a, AddPathMode::Send | AddPathMode::ReceiveSend)
        && matches!(b, AddPathMode::Receive | AddPathMode::ReceiveSend);
    let receive = matches!(a, AddPathMode::Receive | AddPathMode::ReceiveSend)
        && matches!(b, AddPathMode::Send | AddPathMode::ReceiveSend);
    match (send, receive) {
        (true, true) => Some(AddPathMode::ReceiveSend),
        (true, false) => Some(AddPathMode::Send),
        (false, true) => Some(AddPathMode::Receive),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiprotocol_round_trip() {
        let cap = Capability::MultiProtocol {
            afi: AddressFamily::Ipv6,
            safi: Safi::Unicast,
        };
        let mut buf = bytes::BytesMut::new();
        cap.encode(&mut buf);
        let mut rd = buf.freeze();
        let code = rd.get_u8();
        let len = rd.get_u8() as usize;
        let value = rd.copy_to_bytes(len);
        assert_eq!(Capability::decode(code, value), Some(cap));
    }

    #[test]
    fn as4_intersection_requires_both_sides() {
        let offered = vec![Capability::FourOctetAsNumber { asn: 4_200_000_000 }];
        let received = vec![];
        let negotiated = Negotiated::compute(&offered, &received, 180, 180);
        assert!(!negotiated.four_octet_asn);
    }

    #[test]
    fn family_intersection() {
        let offered = vec![
            Capability::MultiProtocol {
                afi: AddressFamily::Ipv4,
                safi: Safi::Unicast,
            },
            Capability::MultiProtocol {
                afi: AddressFamily::Ipv6,
                safi: Safi::Unicast,
            },
        ];
        let received = vec![Capability::MultiProtocol {
            afi: AddressFamily::Ipv4,
            safi: Safi::Unicast,
        }];
        let negotiated = Negotiated::compute(&offered, &received, 180, 180);
        assert_eq!(negotiated.families.len(), 1);
        assert!(negotiated.families.contains(&(AddressFamily::Ipv4, Safi::Unicast)));
    }
}
