//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Message codec (§4.C4, the anchor of the UPDATE contract).
//!
//! ```text
//! MARKER(16, all-ones) | LENGTH(2) | TYPE(1) | BODY
//! ```
//!
//! [`Message::decode`] tolerates a partial frame: it returns `Ok(None)`
//! until `buf` holds a complete message and never consumes a partial one,
//! so callers can feed it directly from a non-blocking socket read.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::ip::AddressFamily;
use crate::packet::attribute::{Attribute, AttributeCollection, DecodeCxt, EncodeCxt};
use crate::packet::cache::AttributeCache;
use crate::packet::capability::Capability;
use crate::packet::consts::{
    AttrFlags, CeaseSubcode, ErrorCode, MessageType, OpenParamType, RouteRefreshSubtype, Safi,
    EXTENDED_OPT_PARAM_EXT_MARKER, EXTENDED_OPT_PARAM_MARKER,
};
use crate::packet::error::{
    AttrError, DecodeError, MessageHeaderError, OpenMessageError, RouteRefreshError,
    UpdateMessageError,
};
use crate::packet::nlri::{Family, Nlri};

/// The all-ones BGP marker.
pub const MARKER: [u8; 16] = [0xFF; 16];

/// `MARKER(16) + LENGTH(2) + TYPE(1)`.
pub const HEADER_LEN: usize = 19;

/// The shortest legal message is a KEEPALIVE: header, no body.
pub const MIN_LEN: u16 = HEADER_LEN as u16;

/// A single parsed BGP message.
#[derive(Clone, Debug, PartialEq)]
#[derive(enum_as_inner::EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Message {
    Open(OpenMsg),
    Update(UpdateMsg),
    Notification(NotificationMsg),
    Keepalive(KeepaliveMsg),
    RouteRefresh(RouteRefreshMsg),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Open(..) => MessageType::Open,
            Message::Update(..) => MessageType::Update,
            Message::Notification(..) => MessageType::Notification,
            Message::Keepalive(..) => MessageType::Keepalive,
            Message::RouteRefresh(..) => MessageType::RouteRefresh,
        }
    }

    /// Encodes a complete framed message, including the header.
    pub fn encode(&self, buf: &mut BytesMut, cxt: EncodeCxt) {
        let mut body = BytesMut::new();
        match self {
            Message::Open(msg) => msg.encode(&mut body),
            Message::Update(msg) => msg.encode(&mut body, cxt),
            Message::Notification(msg) => msg.encode(&mut body),
            Message::Keepalive(msg) => msg.encode(&mut body),
            Message::RouteRefresh(msg) => msg.encode(&mut body),
        }
        buf.put_slice(&MARKER);
        buf.put_u16((HEADER_LEN + body.len()) as u16);
        buf.put_u8(self.msg_type().to_u8().unwrap());
        buf.put_slice(&body);
    }

    /// Attempts to parse one frame from the front of `buf`. `max_message_size`
    /// is the negotiated ceiling (§4.C5 "Extended message"; 4096 until a
    /// session negotiates Extended Message, 65535 after). Returns `Ok(None)`
    /// without consuming anything when `buf` does not yet hold a full frame.
    pub fn decode(
        buf: &mut BytesMut,
        max_message_size: usize,
        dcxt: &DecodeCxt,
        cache: &mut AttributeCache,
    ) -> Result<Option<Message>, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if buf[..16] != MARKER {
            return Err(MessageHeaderError::ConnectionNotSynchronized.into());
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]) as usize;
        if length < HEADER_LEN || length > max_message_size {
            return Err(MessageHeaderError::BadMessageLength(length as u16).into());
        }
        if buf.len() < length {
            return Ok(None);
        }
        let msg_type_raw = buf[18];
        let mut frame = buf.split_to(length);
        frame.advance(HEADER_LEN);
        let body = frame.freeze();
        let msg_type = MessageType::from_u8(msg_type_raw)
            .ok_or(MessageHeaderError::BadMessageType(msg_type_raw))?;
        let message = match msg_type {
            MessageType::Open => Message::Open(OpenMsg::decode(body)?),
            MessageType::Update => Message::Update(UpdateMsg::decode(body, dcxt, cache)?),
            MessageType::Notification => Message::Notification(NotificationMsg::decode(body)?),
            MessageType::Keepalive => Message::Keepalive(KeepaliveMsg::decode(body)?),
            MessageType::RouteRefresh => {
                Message::RouteRefresh(RouteRefreshMsg::decode(body)?)
            }
        };
        Ok(Some(message))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Open(msg) => write!(f, "OPEN (as {}, holdtime {})", msg.my_as, msg.holdtime),
            Message::Update(msg) => write!(
                f,
                "UPDATE ({} withdrawn, {} attrs, {} nlri)",
                msg.withdrawn.len(),
                msg.attrs.len(),
                msg.nlri.len()
            ),
            Message::Notification(msg) => {
                write!(f, "NOTIFICATION ({}, {})", msg.error_code, msg.error_subcode)
            }
            Message::Keepalive(..) => write!(f, "KEEPALIVE"),
            Message::RouteRefresh(msg) => {
                write!(f, "ROUTE-REFRESH (afi {}, safi {})", msg.afi, msg.safi)
            }
        }
    }
}

// ===== OPEN =====

/// `VERSION(1) | MY_AS(2) | HOLD_TIME(2) | BGP_ID(4) | OPT_PARM_LEN(1) | OPT_PARMS`.
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct OpenMsg {
    pub version: u8,
    /// Wire AS2 field. Set to [`crate::packet::consts::AS_TRANS`] when the
    /// real ASN doesn't fit in 16 bits; the real value then rides in the
    /// Four-Octet AS Number capability.
    pub my_as: u16,
    pub holdtime: u16,
    pub identifier: Ipv4Addr,
    pub capabilities: Vec<Capability>,
}

impl OpenMsg {
    pub fn new(
        my_as: u16,
        holdtime: u16,
        identifier: Ipv4Addr,
        capabilities: Vec<Capability>,
    ) -> OpenMsg {
        OpenMsg { version: crate::packet::consts::BGP_VERSION, my_as, holdtime, identifier, capabilities }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u16(self.my_as);
        buf.put_u16(self.holdtime);
        buf.put_slice(&self.identifier.octets());

        // Capabilities ride inside one or more Type-2 optional parameters,
        // each capped at 255 bytes; the peer re-merges consecutive ones
        // (RFC 5492).
        let mut params = BytesMut::new();
        let mut chunk = BytesMut::new();
        for cap in &self.capabilities {
            let mut cap_bytes = BytesMut::new();
            cap.encode(&mut cap_bytes);
            if !chunk.is_empty() && chunk.len() + cap_bytes.len() > 255 {
                encode_capabilities_param(&mut params, &chunk);
                chunk.clear();
            }
            chunk.put_slice(&cap_bytes);
        }
        if !chunk.is_empty() {
            encode_capabilities_param(&mut params, &chunk);
        }

        if params.len() < EXTENDED_OPT_PARAM_MARKER as usize {
            buf.put_u8(params.len() as u8);
        } else {
            // RFC 9072: outer length 255 signals a following extended marker
            // and a 2-byte real length.
            buf.put_u8(EXTENDED_OPT_PARAM_MARKER);
            buf.put_u8(EXTENDED_OPT_PARAM_EXT_MARKER);
            buf.put_u16(params.len() as u16);
        }
        buf.put_slice(&params);
    }

    pub fn decode(mut body: Bytes) -> Result<OpenMsg, DecodeError> {
        let version = body.try_get_u8().map_err(OpenMessageError::from)?;
        if version != crate::packet::consts::BGP_VERSION {
            return Err(OpenMessageError::UnsupportedVersion(version).into());
        }
        let my_as = body.try_get_u16().map_err(OpenMessageError::from)?;
        let holdtime = body.try_get_u16().map_err(OpenMessageError::from)?;
        let identifier = Ipv4Addr::from(body.try_get_u32().map_err(OpenMessageError::from)?);

        let declared_len = body.try_get_u8().map_err(OpenMessageError::from)? as usize;
        let opt_parms_len = if declared_len == EXTENDED_OPT_PARAM_MARKER as usize {
            let marker = body.try_get_u8().map_err(OpenMessageError::from)?;
            if marker != EXTENDED_OPT_PARAM_EXT_MARKER {
                return Err(OpenMessageError::MalformedOptParam.into());
            }
            body.try_get_u16().map_err(OpenMessageError::from)? as usize
        } else {
            declared_len
        };
        if body.remaining() < opt_parms_len {
            return Err(OpenMessageError::MalformedOptParam.into());
        }
        let mut parms_buf = body.copy_to_bytes(opt_parms_len);

        let mut capabilities = Vec::new();
        while parms_buf.has_remaining() {
            if parms_buf.remaining() < 2 {
                return Err(OpenMessageError::MalformedOptParam.into());
            }
            let parm_type = parms_buf.get_u8();
            let parm_len = parms_buf.get_u8() as usize;
            if parms_buf.remaining() < parm_len {
                return Err(OpenMessageError::MalformedOptParam.into());
            }
            let mut value = parms_buf.copy_to_bytes(parm_len);
            if parm_type == OpenParamType::Capabilities as u8 {
                while value.has_remaining() {
                    if value.remaining() < 2 {
                        return Err(OpenMessageError::MalformedOptParam.into());
                    }
                    let code = value.get_u8();
                    let len = value.get_u8() as usize;
                    if value.remaining() < len {
                        return Err(OpenMessageError::MalformedOptParam.into());
                    }
                    let cap_value = value.copy_to_bytes(len);
                    // Unknown capability codes still round-trip as
                    // `Capability::Unknown`; only a malformed value bails out.
                    if let Some(cap) = Capability::decode(code, cap_value) {
                        capabilities.push(cap);
                    }
                }
            }
            // Non-capability optional parameters (e.g. the deprecated
            // Authentication Information parameter) are recorded nowhere.
        }

        Ok(OpenMsg { version, my_as, holdtime, identifier, capabilities })
    }
}

fn encode_capabilities_param(params: &mut BytesMut, chunk: &BytesMut) {
    params.put_u8(OpenParamType::Capabilities as u8);
    params.put_u8(chunk.len().min(255) as u8);
    params.put_slice(chunk);
}

// ===== UPDATE =====

/// `WDRAW_LEN(2) | WDRAW_ROUTES | PATH_ATTR_LEN(2) | PATH_ATTRS | NLRI`.
///
/// `withdrawn`/`nlri` hold only the classic IPv4-unicast routes carried in
/// the outer sections; every other family travels inside
/// [`AttributeCollection::mp_reach`]/[`AttributeCollection::mp_unreach`].
#[derive(Clone, Debug, Default, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct UpdateMsg {
    pub withdrawn: Vec<Nlri>,
    pub attrs: AttributeCollection,
    pub nlri: Vec<Nlri>,
    /// Set when an attribute's parse-error policy was `Withdraw` (§4.C2
    /// "Parse error" column). The attribute itself was dropped from
    /// `attrs`; the caller (peer/RIB layer) must treat every NLRI carried
    /// by this UPDATE as a withdrawal rather than an announcement, per
    /// RFC 7606.
    pub treat_as_withdraw: bool,
}

impl UpdateMsg {
    pub fn new(withdrawn: Vec<Nlri>, attrs: AttributeCollection, nlri: Vec<Nlri>) -> UpdateMsg {
        UpdateMsg { withdrawn, attrs, nlri, treat_as_withdraw: false }
    }

    /// An UPDATE with no withdrawn routes, no announced routes, and no
    /// attributes is the IPv4-unicast End-of-RIB marker (§4.C4).
    pub fn is_eor(&self) -> bool {
        self.withdrawn.is_empty() && self.nlri.is_empty() && self.attrs.is_empty()
    }

    /// The family this UPDATE signals End-of-RIB for, if any: either the
    /// classic empty UPDATE (IPv4 unicast) or a sole MP_UNREACH_NLRI whose
    /// NLRI section is empty (RFC 4724 multiprotocol EOR).
    pub fn eor_family(&self) -> Option<Family> {
        if self.is_eor() {
            return Some((AddressFamily::Ipv4, Safi::Unicast));
        }
        if self.withdrawn.is_empty() && self.nlri.is_empty() && self.attrs.len() == 1 {
            if let Some(mp) = self.attrs.mp_unreach() {
                if mp.nlri.is_empty() {
                    return Some(mp.family);
                }
            }
        }
        None
    }

    pub fn encode(&self, buf: &mut BytesMut, cxt: EncodeCxt) {
        let mut withdrawn_buf = BytesMut::new();
        for nlri in &self.withdrawn {
            nlri.encode(&mut withdrawn_buf);
        }
        buf.put_u16(withdrawn_buf.len() as u16);
        buf.put_slice(&withdrawn_buf);

        let mut attrs_buf = BytesMut::new();
        self.attrs.encode(&mut attrs_buf, cxt);
        buf.put_u16(attrs_buf.len() as u16);
        buf.put_slice(&attrs_buf);

        for nlri in &self.nlri {
            nlri.encode(buf);
        }
    }

    pub fn decode(
        body: Bytes,
        dcxt: &DecodeCxt,
        cache: &mut AttributeCache,
    ) -> Result<UpdateMsg, DecodeError> {
        let total_len = body.remaining();
        let mut body = body;
        if body.remaining() < 2 {
            return Err(UpdateMessageError::ReadOutOfBounds.into());
        }
        let wdraw_len = body.get_u16() as usize;
        if body.remaining() < wdraw_len {
            return Err(UpdateMessageError::MalformedAttributeList.into());
        }
        let mut wdraw_buf = body.copy_to_bytes(wdraw_len);

        if body.remaining() < 2 {
            return Err(UpdateMessageError::ReadOutOfBounds.into());
        }
        let attr_len = body.get_u16() as usize;
        if body.remaining() < attr_len {
            return Err(UpdateMessageError::MalformedAttributeList.into());
        }
        let mut attr_buf = body.copy_to_bytes(attr_len);
        let mut nlri_buf = body;

        if 2 + wdraw_len + 2 + attr_len + nlri_buf.remaining() != total_len {
            return Err(UpdateMessageError::MalformedAttributeList.into());
        }

        let classic: Family = (AddressFamily::Ipv4, Safi::Unicast);
        let classic_add_path = dcxt.add_path(classic);

        let withdrawn = Nlri::decode_many(&mut wdraw_buf, classic, classic_add_path)
            .map_err(|_| UpdateMessageError::InvalidNetworkField)?;

        let mut attrs = AttributeCollection::new();
        let mut treat_as_withdraw = false;
        while attr_buf.has_remaining() {
            if attr_buf.remaining() < 2 {
                return Err(UpdateMessageError::MalformedAttributeList.into());
            }
            let flags = AttrFlags::from_bits_truncate(attr_buf.get_u8());
            let attr_type_raw = attr_buf.get_u8();
            let len = if flags.contains(AttrFlags::EXTENDED) {
                if attr_buf.remaining() < 2 {
                    return Err(UpdateMessageError::MalformedAttributeList.into());
                }
                attr_buf.get_u16() as usize
            } else {
                if attr_buf.remaining() < 1 {
                    return Err(UpdateMessageError::MalformedAttributeList.into());
                }
                attr_buf.get_u8() as usize
            };
            if attr_buf.remaining() < len {
                return Err(UpdateMessageError::MalformedAttributeList.into());
            }
            let value = attr_buf.copy_to_bytes(len);
            match Attribute::decode(attr_type_raw, flags, value, dcxt) {
                Ok(attr) => {
                    if attrs.insert(attr, cache).is_err() {
                        // Only the Forbidden duplicate policy returns Err
                        // here, and it always means Reset.
                        return Err(UpdateMessageError::MalformedAttributeList.into());
                    }
                }
                Err(AttrError::Reset) => {
                    return Err(UpdateMessageError::MalformedAttributeList.into());
                }
                Err(AttrError::Withdraw) => treat_as_withdraw = true,
                Err(AttrError::Discard) | Err(AttrError::AttributeDiscard) => {}
            }
        }

        // RFC 6793 §4.2.3: a two-octet-ASN session may have carried
        // AS4_PATH/AS4_AGGREGATOR alongside the compatibility AS_PATH/
        // AGGREGATOR; fold them in and drop the AS4 attributes. An
        // AS4-capable session shouldn't send these, so skip the merge there.
        if !dcxt.four_octet_asn {
            attrs.reconcile_as4(cache);
        }

        let nlri = Nlri::decode_many(&mut nlri_buf, classic, classic_add_path)
            .map_err(|_| UpdateMessageError::InvalidNetworkField)?;

        Ok(UpdateMsg { withdrawn, attrs, nlri, treat_as_withdraw })
    }
}

// ===== NOTIFICATION =====

/// `CODE(1) | SUBCODE(1) | DATA(...)`.
#[derive(Clone, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct NotificationMsg {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Bytes,
}

impl NotificationMsg {
    pub fn new(error_code: ErrorCode, error_subcode: u8) -> NotificationMsg {
        NotificationMsg { error_code: error_code as u8, error_subcode, data: Bytes::new() }
    }

    pub fn with_data(error_code: ErrorCode, error_subcode: u8, data: Bytes) -> NotificationMsg {
        NotificationMsg { error_code: error_code as u8, error_subcode, data }
    }

    /// Builds a Cease/Administrative-Shutdown or Cease/Administrative-Reset
    /// NOTIFICATION carrying an RFC 8203 shutdown communication: a UTF-8
    /// string with a 1-byte length prefix, truncated to 255 bytes.
    pub fn shutdown_communication(subcode: CeaseSubcode, message: &str) -> NotificationMsg {
        debug_assert!(matches!(
            subcode,
            CeaseSubcode::AdministrativeShutdown | CeaseSubcode::AdministrativeReset
        ));
        let bytes = message.as_bytes();
        let len = bytes.len().min(255);
        let mut data = BytesMut::with_capacity(1 + len);
        data.put_u8(len as u8);
        data.put_slice(&bytes[..len]);
        NotificationMsg {
            error_code: ErrorCode::Cease as u8,
            error_subcode: subcode as u8,
            data: data.freeze(),
        }
    }

    /// Decodes the RFC 8203 shutdown communication carried in `data`, if
    /// this is a Cease/Administrative-Shutdown or -Reset NOTIFICATION that
    /// actually carries one.
    pub fn shutdown_message(&self) -> Option<String> {
        if self.error_code != ErrorCode::Cease as u8 {
            return None;
        }
        let is_shutdown_subcode = self.error_subcode == CeaseSubcode::AdministrativeShutdown as u8
            || self.error_subcode == CeaseSubcode::AdministrativeReset as u8;
        if !is_shutdown_subcode || self.data.is_empty() {
            return None;
        }
        let len = self.data[0] as usize;
        if self.data.len() < 1 + len {
            return None;
        }
        Some(String::from_utf8_lossy(&self.data[1..1 + len]).into_owned())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.error_code);
        buf.put_u8(self.error_subcode);
        buf.put_slice(&self.data);
    }

    pub fn decode(mut body: Bytes) -> Result<NotificationMsg, DecodeError> {
        if body.remaining() < 2 {
            return Err(MessageHeaderError::ReadOutOfBounds.into());
        }
        let error_code = body.get_u8();
        let error_subcode = body.get_u8();
        let data = body.copy_to_bytes(body.remaining());
        Ok(NotificationMsg { error_code, error_subcode, data })
    }
}

/// Maps a framing/parse failure onto the NOTIFICATION the peer should send
/// in response. Decode errors don't carry operator-facing text, so `data`
/// is left empty; use [`NotificationMsg::shutdown_communication`] for the
/// administrative-shutdown path.
impl From<DecodeError> for NotificationMsg {
    fn from(error: DecodeError) -> NotificationMsg {
        let (code, subcode) = error.notification_code();
        NotificationMsg::new(code, subcode)
    }
}

// ===== KEEPALIVE =====

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct KeepaliveMsg {}

impl KeepaliveMsg {
    pub fn new() -> KeepaliveMsg {
        KeepaliveMsg {}
    }

    pub fn encode(&self, _buf: &mut BytesMut) {}

    pub fn decode(_body: Bytes) -> Result<KeepaliveMsg, DecodeError> {
        Ok(KeepaliveMsg {})
    }
}

// ===== ROUTE-REFRESH =====

/// `AFI(2) | RESERVED(1) | SAFI(1)` (RFC 2918, extended by RFC 7313 to carry
/// Begin/End-of-Route-Refresh in the reserved octet).
#[derive(Clone, Copy, Debug, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteRefreshMsg {
    pub afi: u16,
    pub subtype: RouteRefreshSubtype,
    pub safi: u8,
}

impl RouteRefreshMsg {
    pub fn new(family: Family, subtype: RouteRefreshSubtype) -> RouteRefreshMsg {
        RouteRefreshMsg { afi: family.0.afi(), subtype, safi: family.1.to_u8().unwrap() }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.afi);
        buf.put_u8(self.subtype.to_u8().unwrap());
        buf.put_u8(self.safi);
    }

    pub fn decode(mut body: Bytes) -> Result<RouteRefreshMsg, DecodeError> {
        if body.remaining() != 4 {
            return Err(RouteRefreshError::InvalidMessageLength.into());
        }
        let afi = body.get_u16();
        let reserved = body.get_u8();
        let safi = body.get_u8();
        let subtype = RouteRefreshSubtype::from_u8(reserved)
            .ok_or(RouteRefreshError::InvalidMessageLength)?;
        Ok(RouteRefreshMsg { afi, subtype, safi })
    }

    pub fn family(&self) -> Option<Family> {
        let afi = AddressFamily::from_afi(self.afi)?;
        let safi = Safi::from_u8(self.safi)?;
        Some((afi, safi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::attribute::AsPath;
    use crate::packet::capability::Capability;
    use crate::packet::consts::Origin;
    use crate::packet::nlri::Ipv4Prefix;
    use std::net::Ipv4Addr;

    fn dcxt() -> DecodeCxt {
        DecodeCxt {
            four_octet_asn: true,
            peer_as: 65001,
            is_external: true,
            add_path_families: Default::default(),
        }
    }

    #[test]
    fn open_round_trip_with_extended_message_capability() {
        let open = OpenMsg::new(
            65001,
            180,
            Ipv4Addr::new(192, 0, 2, 1),
            vec![
                Capability::FourOctetAsNumber { asn: 65001 },
                Capability::ExtendedMessage,
                Capability::MultiProtocol { afi: AddressFamily::Ipv4, safi: Safi::Unicast },
            ],
        );
        let mut buf = BytesMut::new();
        open.encode(&mut buf);
        let decoded = OpenMsg::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, open);
    }

    #[test]
    fn keepalive_round_trip_via_message_decode() {
        let mut buf = BytesMut::new();
        Message::Keepalive(KeepaliveMsg::new())
            .encode(&mut buf, EncodeCxt { four_octet_asn: true });
        let mut cache = AttributeCache::new(16);
        let decoded = Message::decode(&mut buf, 4096, &dcxt(), &mut cache).unwrap().unwrap();
        assert_eq!(decoded, Message::Keepalive(KeepaliveMsg::new()));
        assert!(buf.is_empty());
    }

    #[test]
    fn message_decode_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        Message::Keepalive(KeepaliveMsg::new())
            .encode(&mut buf, EncodeCxt { four_octet_asn: true });
        let mut partial = buf.split_to(buf.len() - 1);
        let mut cache = AttributeCache::new(16);
        let result = Message::decode(&mut partial, 4096, &dcxt(), &mut cache).unwrap();
        assert!(result.is_none());
        assert_eq!(partial.len(), HEADER_LEN - 1);
    }

    #[test]
    fn update_round_trip_classic_ipv4_unicast() {
        let mut cache = AttributeCache::new(16);
        let mut attrs = AttributeCollection::new();
        attrs.insert(Attribute::Origin(Origin::Igp), &mut cache).unwrap();
        attrs
            .insert(
                Attribute::AsPath(AsPath {
                    segments: vec![crate::packet::attribute::AsPathSegment {
                        seg_type: crate::packet::consts::AsPathSegmentType::Sequence,
                        members: vec![65001],
                    }],
                }),
                &mut cache,
            )
            .unwrap();
        attrs.insert(Attribute::NextHop(Ipv4Addr::new(192, 0, 2, 1)), &mut cache).unwrap();
        let nlri = vec![Nlri::Ipv4Unicast {
            prefix: Ipv4Prefix { len: 24, addr: Ipv4Addr::new(203, 0, 113, 0) },
            path_id: None,
        }];
        let update = UpdateMsg::new(vec![], attrs, nlri);
        let mut buf = BytesMut::new();
        update.encode(&mut buf, EncodeCxt { four_octet_asn: true });
        let decoded = UpdateMsg::decode(buf.freeze(), &dcxt(), &mut cache).unwrap();
        assert_eq!(decoded.nlri, update.nlri);
        assert!(!decoded.is_eor());
        assert!(!decoded.treat_as_withdraw);
    }

    #[test]
    fn empty_update_is_eor() {
        let update = UpdateMsg::default();
        assert!(update.is_eor());
        assert_eq!(update.eor_family(), Some((AddressFamily::Ipv4, Safi::Unicast)));
    }

    #[test]
    fn as_path_withdraw_policy_marks_treat_as_withdraw() {
        let mut cache = AttributeCache::new(16);
        let path = AsPath {
            segments: vec![crate::packet::attribute::AsPathSegment {
                seg_type: crate::packet::consts::AsPathSegmentType::Sequence,
                members: vec![65002],
            }],
        };
        let attr = Attribute::AsPath(path);
        let mut attr_buf = BytesMut::new();
        attr.encode(&mut attr_buf, EncodeCxt { four_octet_asn: true });

        let mut body = BytesMut::new();
        body.put_u16(0);
        body.put_u16(attr_buf.len() as u16);
        body.put_slice(&attr_buf);
        let nlri = Nlri::Ipv4Unicast {
            prefix: Ipv4Prefix { len: 24, addr: Ipv4Addr::new(203, 0, 113, 0) },
            path_id: None,
        };
        nlri.encode(&mut body);

        let decoded = UpdateMsg::decode(body.freeze(), &dcxt(), &mut cache).unwrap();
        assert!(decoded.treat_as_withdraw);
        assert!(decoded.attrs.get_type(crate::packet::consts::AttrType::AsPath).is_none());
    }

    #[test]
    fn notification_shutdown_communication_round_trips() {
        let notif = NotificationMsg::shutdown_communication(
            CeaseSubcode::AdministrativeShutdown,
            "maintenance window",
        );
        assert_eq!(notif.shutdown_message().as_deref(), Some("maintenance window"));
    }

    #[test]
    fn decode_error_notification_carries_no_shutdown_text() {
        let notif: NotificationMsg = DecodeError::ReadOutOfBounds.into();
        assert!(notif.shutdown_message().is_none());
    }

    #[test]
    fn route_refresh_round_trip_with_eorr_subtype() {
        let msg = RouteRefreshMsg::new((AddressFamily::Ipv4, Safi::Unicast), RouteRefreshSubtype::EoRR);
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let decoded = RouteRefreshMsg::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.family(), Some((AddressFamily::Ipv4, Safi::Unicast)));
    }
}
