//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::TryGetError;
use serde::{Deserialize, Serialize};

use crate::packet::consts::{
    CeaseSubcode, ErrorCode, FsmErrorSubcode, MessageHeaderErrorSubcode,
    OpenMessageErrorSubcode, RouteRefreshErrorSubcode, UpdateMessageErrorSubcode,
};

/// BGP message decoding errors (§4.C4 framing / OPEN / UPDATE contracts).
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    ReadOutOfBounds,
    MessageHeader(MessageHeaderError),
    OpenMessage(OpenMessageError),
    UpdateMessage(UpdateMessageError),
    RouteRefreshMessage(RouteRefreshError),
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MessageHeaderError {
    ReadOutOfBounds,
    ConnectionNotSynchronized,
    BadMessageLength(u16),
    BadMessageType(u8),
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum OpenMessageError {
    ReadOutOfBounds,
    UnsupportedVersion(u8),
    BadPeerAs,
    BadBgpIdentifier,
    UnsupportedOptParam,
    UnacceptableHoldTime,
    UnsupportedCapability,
    MalformedOptParam,
}

// UPDATE message errors.
//
// Many errors originally specified by RFC 4271 were made obsolete by RFC
// 7606, which converts most per-attribute failures into treat-as-withdraw
// instead of a session reset; see `AttrError` below for that policy.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum UpdateMessageError {
    ReadOutOfBounds,
    MalformedAttributeList,
    UnrecognizedWellKnownAttribute,
    OptionalAttributeError,
    InvalidNetworkField,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RouteRefreshError {
    ReadOutOfBounds,
    InvalidMessageLength,
}

/// Per-attribute parse-error policy (§4.C2 contract table, §7). Extends the
/// teacher's three-way `{Discard, Withdraw, Reset}` split with a fourth
/// bucket: `AttributeDiscard` removes only the offending attribute and
/// keeps the rest of the UPDATE (BGP-LS, AIGP), as distinct from `Discard`
/// which applies to a whole duplicate occurrence of an attribute that is
/// otherwise valid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum AttrError {
    Discard,
    AttributeDiscard,
    Withdraw,
    Reset,
}

// ===== impl DecodeError =====

impl DecodeError {
    /// Maps a decode error onto the `(code, subcode)` pair carried in the
    /// resulting NOTIFICATION, per the table implied by §4.C4/§7.
    pub fn notification_code(&self) -> (ErrorCode, u8) {
        match self {
            DecodeError::ReadOutOfBounds => {
                (ErrorCode::MessageHeaderError, MessageHeaderErrorSubcode::Unspecific as u8)
            }
            DecodeError::MessageHeader(error) => {
                (ErrorCode::MessageHeaderError, error.subcode() as u8)
            }
            DecodeError::OpenMessage(error) => {
                (ErrorCode::OpenMessageError, error.subcode() as u8)
            }
            DecodeError::UpdateMessage(error) => {
                (ErrorCode::UpdateMessageError, error.subcode() as u8)
            }
            DecodeError::RouteRefreshMessage(error) => {
                (ErrorCode::RouteRefreshMessageError, error.subcode() as u8)
            }
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            DecodeError::MessageHeader(error) => error.fmt(f),
            DecodeError::OpenMessage(error) => error.fmt(f),
            DecodeError::UpdateMessage(error) => error.fmt(f),
            DecodeError::RouteRefreshMessage(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::ReadOutOfBounds
    }
}

impl From<MessageHeaderError> for DecodeError {
    fn from(error: MessageHeaderError) -> DecodeError {
        DecodeError::MessageHeader(error)
    }
}

impl From<OpenMessageError> for DecodeError {
    fn from(error: OpenMessageError) -> DecodeError {
        DecodeError::OpenMessage(error)
    }
}

impl From<UpdateMessageError> for DecodeError {
    fn from(error: UpdateMessageError) -> DecodeError {
        DecodeError::UpdateMessage(error)
    }
}

impl From<RouteRefreshError> for DecodeError {
    fn from(error: RouteRefreshError) -> DecodeError {
        DecodeError::RouteRefreshMessage(error)
    }
}

// ===== impl MessageHeaderError =====

impl MessageHeaderError {
    fn subcode(&self) -> MessageHeaderErrorSubcode {
        match self {
            MessageHeaderError::ReadOutOfBounds => MessageHeaderErrorSubcode::Unspecific,
            MessageHeaderError::ConnectionNotSynchronized => {
                MessageHeaderErrorSubcode::ConnectionNotSynchronized
            }
            MessageHeaderError::BadMessageLength(..) => {
                MessageHeaderErrorSubcode::BadMessageLength
            }
            MessageHeaderError::BadMessageType(..) => {
                MessageHeaderErrorSubcode::BadMessageType
            }
        }
    }
}

impl std::fmt::Display for MessageHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageHeaderError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            MessageHeaderError::ConnectionNotSynchronized => {
                write!(f, "connection not synchronized")
            }
            MessageHeaderError::BadMessageLength(len) => {
                write!(f, "invalid message length: {len}")
            }
            MessageHeaderError::BadMessageType(msg_type) => {
                write!(f, "invalid message type: {msg_type}")
            }
        }
    }
}

impl From<TryGetError> for MessageHeaderError {
    fn from(_error: TryGetError) -> MessageHeaderError {
        MessageHeaderError::ReadOutOfBounds
    }
}

// ===== impl OpenMessageError =====

impl OpenMessageError {
    fn subcode(&self) -> OpenMessageErrorSubcode {
        match self {
            OpenMessageError::ReadOutOfBounds => OpenMessageErrorSubcode::Unspecific,
            OpenMessageError::UnsupportedVersion(..) => {
                OpenMessageErrorSubcode::UnsupportedVersionNumber
            }
            OpenMessageError::BadPeerAs => OpenMessageErrorSubcode::BadPeerAs,
            OpenMessageError::BadBgpIdentifier => {
                OpenMessageErrorSubcode::BadBgpIdentifier
            }
            OpenMessageError::UnsupportedOptParam => {
                OpenMessageErrorSubcode::UnsupportedOptParam
            }
            OpenMessageError::UnacceptableHoldTime => {
                OpenMessageErrorSubcode::UnacceptableHoldTime
            }
            OpenMessageError::UnsupportedCapability => {
                OpenMessageErrorSubcode::UnsupportedCapability
            }
            OpenMessageError::MalformedOptParam => {
                OpenMessageErrorSubcode::UnsupportedOptParam
            }
        }
    }
}

impl std::fmt::Display for OpenMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OPEN message error: ")?;
        match self {
            OpenMessageError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            OpenMessageError::UnsupportedVersion(version) => {
                write!(f, "unsupported version number: {version}")
            }
            OpenMessageError::BadPeerAs => write!(f, "bad peer AS"),
            OpenMessageError::BadBgpIdentifier => write!(f, "bad BGP identifier"),
            OpenMessageError::UnsupportedOptParam => {
                write!(f, "unsupported optional parameter")
            }
            OpenMessageError::UnacceptableHoldTime => {
                write!(f, "unacceptable hold time")
            }
            OpenMessageError::UnsupportedCapability => {
                write!(f, "unsupported capability")
            }
            OpenMessageError::MalformedOptParam => {
                write!(f, "malformed optional parameter")
            }
        }
    }
}

impl From<TryGetError> for OpenMessageError {
    fn from(_error: TryGetError) -> OpenMessageError {
        OpenMessageError::ReadOutOfBounds
    }
}

// ===== impl UpdateMessageError =====

impl UpdateMessageError {
    fn subcode(&self) -> UpdateMessageErrorSubcode {
        match self {
            UpdateMessageError::ReadOutOfBounds => UpdateMessageErrorSubcode::Unspecific,
            UpdateMessageError::MalformedAttributeList => {
                UpdateMessageErrorSubcode::MalformedAttributeList
            }
            UpdateMessageError::UnrecognizedWellKnownAttribute => {
                UpdateMessageErrorSubcode::UnrecognizedWellKnownAttribute
            }
            UpdateMessageError::OptionalAttributeError => {
                UpdateMessageErrorSubcode::OptionalAttributeError
            }
            UpdateMessageError::InvalidNetworkField => {
                UpdateMessageErrorSubcode::InvalidNetworkField
            }
        }
    }
}

impl std::fmt::Display for UpdateMessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UPDATE message error: ")?;
        match self {
            UpdateMessageError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            UpdateMessageError::MalformedAttributeList => {
                write!(f, "malformed attribute list")
            }
            UpdateMessageError::UnrecognizedWellKnownAttribute => {
                write!(f, "unrecognized well-known attribute")
            }
            UpdateMessageError::OptionalAttributeError => {
                write!(f, "optional attribute error")
            }
            UpdateMessageError::InvalidNetworkField => {
                write!(f, "invalid network field")
            }
        }
    }
}

impl From<TryGetError> for UpdateMessageError {
    fn from(_error: TryGetError) -> UpdateMessageError {
        UpdateMessageError::ReadOutOfBounds
    }
}

// ===== impl RouteRefreshError =====

impl RouteRefreshError {
    fn subcode(&self) -> RouteRefreshErrorSubcode {
        match self {
            RouteRefreshError::ReadOutOfBounds
            | RouteRefreshError::InvalidMessageLength => {
                RouteRefreshErrorSubcode::InvalidMessageLength
            }
        }
    }
}

impl std::fmt::Display for RouteRefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ROUTE-REFRESH message error: ")?;
        match self {
            RouteRefreshError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            RouteRefreshError::InvalidMessageLength => {
                write!(f, "invalid message length")
            }
        }
    }
}

impl From<TryGetError> for RouteRefreshError {
    fn from(_error: TryGetError) -> RouteRefreshError {
        RouteRefreshError::ReadOutOfBounds
    }
}

// ===== impl AttrError =====

impl From<TryGetError> for AttrError {
    fn from(_error: TryGetError) -> AttrError {
        AttrError::Withdraw
    }
}

/// Collision-detection (RFC 4271 §6.8) and FSM unexpected-message
/// NOTIFICATION helper: the FSM subcode for a given state.
pub fn fsm_error_subcode_for_state(state: &crate::neighbor::fsm::State) -> FsmErrorSubcode {
    use crate::neighbor::fsm::State;
    match state {
        State::OpenSent => FsmErrorSubcode::UnexpectedMessageInOpenSent,
        State::OpenConfirm => FsmErrorSubcode::UnexpectedMessageInOpenConfirm,
        _ => FsmErrorSubcode::UnexpectedMessageInEstablished,
    }
}

pub const COLLISION_CEASE_SUBCODE: CeaseSubcode =
    CeaseSubcode::ConnectionCollisionResolution;
