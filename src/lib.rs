//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

//! A BGP-4 speaker core: peer engine, wire codec and reactor.
//!
//! The crate is organized around the three tightly coupled subsystems that
//! make up the protocol core: the packet codec (`packet`), the per-neighbor
//! session engine (`neighbor`), and the single-threaded reactor (`reactor`)
//! that multiplexes peer sockets, the listener and the API transports.
//! Everything else (`config`, `rib`, `api`, `network`, `task`, `ip`) is
//! ambient support these three subsystems are built on.

pub mod api;
pub mod config;
pub mod debug;
pub mod error;
pub mod ip;
pub mod neighbor;
pub mod network;
pub mod packet;
pub mod reactor;
pub mod rib;
pub mod task;
