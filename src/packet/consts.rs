//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

pub use crate::ip::AddressFamily;

pub const BGP_VERSION: u8 = 4;
pub const AS_TRANS: u16 = 23456;

/// Default maximum BGP message size (RFC 4271 §4). Raised to 65535 when the
/// Extended Message capability (RFC 8654) is negotiated by both sides.
pub const DFLT_MAX_MSG_LEN: usize = 4096;
pub const EXTENDED_MAX_MSG_LEN: usize = 65535;

// BGP Message Types.
//
// IANA registry:
// https://www.iana.org/assignments/bgp-parameters/bgp-parameters.xhtml#bgp-parameters-1
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    // RFC 2918
    RouteRefresh = 5,
}

// BGP OPEN Optional Parameter Types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum OpenParamType {
    // RFC 5492
    Capabilities = 2,
}

/// Marker byte that introduces an RFC 9072 extended-length optional
/// parameter block (signalled by `OPT_PARM_LEN == 255`).
pub const EXTENDED_OPT_PARAM_MARKER: u8 = 255;
pub const EXTENDED_OPT_PARAM_EXT_MARKER: u8 = 255;

// Capability Codes.
//
// IANA registry:
// https://www.iana.org/assignments/capability-codes/capability-codes.xhtml#capability-codes-2
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum CapabilityCode {
    // RFC 2858
    MultiProtocol = 1,
    // RFC 2918
    RouteRefresh = 2,
    // RFC 8950
    ExtendedNextHop = 5,
    // RFC 8654
    ExtendedMessage = 6,
    // draft-ietf-idr-bgp-operational / RFC 9687 registry entry
    Operational = 11,
    // RFC 4724
    GracefulRestart = 64,
    // RFC 6793
    FourOctetAsNumber = 65,
    // RFC 7911
    AddPath = 69,
    // RFC 7313
    EnhancedRouteRefresh = 70,
    // draft-walton-bgp-hostname-capability
    Hostname = 73,
    // draft-abraitis-bgp-version-capability
    SoftwareVersion = 75,
    // RFC 9494
    LongLivedGracefulRestart = 129,
    // RFC 2918 legacy code used by some implementations
    RouteRefreshCisco = 128,
}

// Send/Receive value for a per-AFI/SAFI instance of the ADD-PATH Capability.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AddPathMode {
    Receive = 1,
    Send = 2,
    ReceiveSend = 3,
}

// BGP Error (Notification) Codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum ErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
    // RFC 7313
    RouteRefreshMessageError = 7,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum MessageHeaderErrorSubcode {
    Unspecific = 0,
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum OpenMessageErrorSubcode {
    Unspecific = 0,
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptParam = 4,
    UnacceptableHoldTime = 6,
    // RFC 5492
    UnsupportedCapability = 7,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum UpdateMessageErrorSubcode {
    Unspecific = 0,
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    InvalidNexthopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum FsmErrorSubcode {
    UnexpectedMessageInOpenSent = 1,
    UnexpectedMessageInOpenConfirm = 2,
    UnexpectedMessageInEstablished = 3,
}

// BGP Cease NOTIFICATION message subcodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum CeaseSubcode {
    MaximumNumberofPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeConfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
    // RFC 8538
    HardReset = 9,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum RouteRefreshErrorSubcode {
    InvalidMessageLength = 1,
}

/// RFC 7313 ROUTE-REFRESH "reserved" octet: beyond the plain request (0),
/// this byte signals Begin/End-of-Route-Refresh markers when Enhanced
/// Route Refresh is negotiated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum RouteRefreshSubtype {
    Request = 0,
    BoRR = 1,
    EoRR = 2,
}

// Address Family Identifiers (AFI).
pub type Afi = AddressFamily;

// Subsequent Address Family Identifiers (SAFI).
//
// IANA registry:
// https://www.iana.org/assignments/safi-namespace/safi-namespace.xhtml#safi-namespace-2
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
    LabeledUnicast = 4,
    MulticastVpn = 5,
    Pseudowire = 6,
    TunnelEncap = 7,
    McastVpls = 8,
    Tunnel = 64,
    Vpls = 65,
    Mdt = 66,
    V4OverV6 = 67,
    V6OverV4 = 68,
    L1VpnAutoDiscovery = 69,
    Evpn = 70,
    BgpLs = 71,
    BgpLsVpn = 72,
    SrTe = 73,
    SdWanCapabilities = 74,
    LabeledVpn = 128,
    MulticastMplsVpn = 129,
    RouteTarget = 132,
    Ipv4FlowSpec = 133,
    Vpnv4FlowSpec = 134,
    VpnAutoDiscovery = 140,
    // BGP-MUP (draft-mpmz-bess-mup-safi)
    Mup = 142,
}

// BGP Path Attribute Flags.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct AttrFlags: u8 {
        const OPTIONAL = 0x80;
        const TRANSITIVE = 0x40;
        const PARTIAL = 0x20;
        const EXTENDED = 0x10;
    }
}

// BGP Path Attribute Types.
//
// IANA registry:
// https://www.iana.org/assignments/bgp-parameters/bgp-parameters.xhtml#bgp-parameters-2
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AttrType {
    Origin = 1,
    AsPath = 2,
    Nexthop = 3,
    Med = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
    // RFC 1997
    Communities = 8,
    // RFC 4456
    OriginatorId = 9,
    ClusterList = 10,
    // RFC 4760
    MpReachNlri = 14,
    MpUnreachNlri = 15,
    // RFC 4360
    ExtCommunities = 16,
    // RFC 6793
    As4Path = 17,
    As4Aggregator = 18,
    // RFC 6514
    PmsiTunnel = 22,
    // RFC 5701
    Extv6Community = 25,
    // RFC 7311
    Aigp = 26,
    // RFC-ietf-idr-rfc7752bis
    BgpLs = 29,
    // RFC 8092
    LargeCommunity = 32,
    // RFC 9234
    Otc = 35,
    // RFC 8669
    BgpPrefixSid = 40,
}

// BGP Origin.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AsPathSegmentType {
    Set = 1,
    Sequence = 2,
    ConfedSequence = 3,
    ConfedSet = 4,
}

// BGP Well-known Communities.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
#[repr(u32)]
pub enum WellKnownCommunities {
    NoExport = 0xFFFF_FF01,
    NoAdvertise = 0xFFFF_FF02,
    NoExportSubconfed = 0xFFFF_FF03,
}

// BGP AIGP TLV Types (RFC 7311).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AigpType {
    Aigp = 1,
}

// EVPN route types (RFC 7432 / RFC 9136).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum EvpnRouteType {
    EthernetAutoDiscovery = 1,
    MacIpAdvertisement = 2,
    InclusiveMulticastEthernetTag = 3,
    EthernetSegment = 4,
    IpPrefix = 5,
}

// MCAST-VPN route types (RFC 6514).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum McastVpnRouteType {
    IntraAsIPmsiAd = 1,
    InterAsIPmsiAd = 2,
    SPmsiAd = 3,
    LeafAd = 4,
    SourceActiveAd = 5,
    SharedTreeJoin = 6,
    SourceTreeJoin = 7,
}

// BGP-LS NLRI types (RFC-ietf-idr-rfc7752bis).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum BgpLsNlriType {
    Node = 1,
    Link = 2,
    Ipv4TopologyPrefix = 3,
    Ipv6TopologyPrefix = 4,
    SrV6Sid = 6,
}
