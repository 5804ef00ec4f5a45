//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use tracing::{error, warn, warn_span};

use crate::packet::error::DecodeError;

/// Top-level error type for everything that can go wrong outside of a
/// single attribute/NLRI parse (those have their own narrower types in
/// `packet::error`, since their handling policy is per-attribute, not
/// uniform).
#[derive(Debug)]
pub enum Error {
    Io(IoError),
    NbrRx(IpAddr, NbrRxError),
    NbrBadAs(IpAddr, u32, u32),
    NbrBadIdentifier(IpAddr, Ipv4Addr),
    Api(ApiError),
    InstanceStart(Box<Error>),
}

/// I/O errors at the connection layer (§4.C6).
#[derive(Debug)]
pub enum IoError {
    TcpSocket(std::io::Error),
    TcpAccept(std::io::Error),
    TcpConnect(std::io::Error),
    TcpInfo(std::io::Error),
    TcpAuth(std::io::Error),
    TcpRecv(std::io::Error),
    TcpSend(std::io::Error),
}

/// Errors observed while receiving from an established or half-open peer
/// connection.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum NbrRxError {
    TcpConnClosed,
    MsgDecode(DecodeError),
}

/// Errors local to the API plane (§4.C10/§7): these are reported back to the
/// originating connection and never affect peer sessions.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ApiError {
    UnknownCommand(String),
    MalformedCommand(String),
    UnknownNeighbor(String),
    NoMatchingNeighbor,
    InvalidSelector(String),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::Io(error) => error.log(),
            Error::NbrRx(addr, error) => {
                warn_span!("neighbor", %addr).in_scope(|| error.log());
            }
            Error::NbrBadAs(addr, received, expected) => {
                warn_span!("neighbor", %addr)
                    .in_scope(|| warn!(%received, %expected, "{}", self));
            }
            Error::NbrBadIdentifier(addr, identifier) => {
                warn_span!("neighbor", %addr)
                    .in_scope(|| warn!(%identifier, "{}", self));
            }
            Error::Api(error) => warn!(%error, "{}", self),
            Error::InstanceStart(error) => {
                error!(error = %with_source(error.as_ref()), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(error) => error.fmt(f),
            Error::NbrRx(_, error) => error.fmt(f),
            Error::NbrBadAs(..) => write!(f, "bad peer AS"),
            Error::NbrBadIdentifier(..) => write!(f, "BGP identifier conflict"),
            Error::Api(error) => error.fmt(f),
            Error::InstanceStart(..) => write!(f, "failed to start instance"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            Error::NbrRx(_, error) => Some(error),
            Error::InstanceStart(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::Io(error)
    }
}

impl From<ApiError> for Error {
    fn from(error: ApiError) -> Error {
        Error::Api(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub fn log(&self) {
        match self {
            IoError::TcpSocket(error)
            | IoError::TcpAccept(error)
            | IoError::TcpConnect(error)
            | IoError::TcpAuth(error)
            | IoError::TcpInfo(error)
            | IoError::TcpRecv(error)
            | IoError::TcpSend(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::TcpSocket(..) => write!(f, "failed to create TCP socket"),
            IoError::TcpAccept(..) => {
                write!(f, "failed to accept connection request")
            }
            IoError::TcpConnect(..) => {
                write!(f, "failed to establish TCP connection")
            }
            IoError::TcpAuth(..) => {
                write!(f, "failed to set TCP authentication option")
            }
            IoError::TcpInfo(..) => {
                write!(f, "failed to fetch socket address/port information")
            }
            IoError::TcpRecv(..) => write!(f, "failed to read TCP data"),
            IoError::TcpSend(..) => write!(f, "failed to send TCP data"),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::TcpSocket(error)
            | IoError::TcpAccept(error)
            | IoError::TcpConnect(error)
            | IoError::TcpAuth(error)
            | IoError::TcpInfo(error)
            | IoError::TcpRecv(error)
            | IoError::TcpSend(error) => Some(error),
        }
    }
}

// ===== impl NbrRxError =====

impl NbrRxError {
    pub fn log(&self) {
        match self {
            NbrRxError::TcpConnClosed => warn!("{}", self),
            NbrRxError::MsgDecode(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for NbrRxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbrRxError::TcpConnClosed => {
                write!(f, "connection closed by remote end")
            }
            NbrRxError::MsgDecode(..) => write!(f, "failed to decode BGP message"),
        }
    }
}

impl std::error::Error for NbrRxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NbrRxError::MsgDecode(error) => Some(error),
            _ => None,
        }
    }
}

// ===== impl ApiError =====

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::UnknownCommand(verb) => write!(f, "unknown command '{verb}'"),
            ApiError::MalformedCommand(reason) => {
                write!(f, "malformed command: {reason}")
            }
            ApiError::UnknownNeighbor(addr) => {
                write!(f, "unknown neighbor '{addr}'")
            }
            ApiError::NoMatchingNeighbor => {
                write!(f, "selector matched no configured neighbor")
            }
            ApiError::InvalidSelector(reason) => {
                write!(f, "invalid neighbor selector: {reason}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
