//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! BGP wire format: attributes (C2), NLRI (C3), and the message framing
//! that ties them together (C4).

pub mod attribute;
pub mod cache;
pub mod capability;
pub mod consts;
pub mod error;
pub mod message;
pub mod nlri;
