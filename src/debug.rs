//
// Copyright (c) The exabgp-core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, debug_span, info, info_span};

use crate::neighbor::fsm;
use crate::packet::consts::AttrType;
use crate::packet::error::AttrError;
use crate::packet::message::Message;

/// Every loggable event produced by the core, dispatched through `tracing`.
/// Kept as a single enum (rather than scattered `debug!()` call sites) so
/// that the span nesting and field set for each event lives in one place.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceCreate,
    InstanceStart,
    InstanceStop(InstanceInactiveReason),
    InstanceReload,
    NbrCreate(&'a IpAddr),
    NbrDelete(&'a IpAddr),
    NbrFsmTransition(&'a IpAddr, &'a fsm::State, &'a fsm::State),
    NbrMsgRx(&'a IpAddr, &'a Message),
    NbrMsgTx(&'a IpAddr, &'a Message),
    NbrAttrError(AttrType, AttrError),
    NbrCollision(&'a IpAddr, &'a str),
    NbrEorRx(&'a IpAddr),
    NbrEorTx(&'a IpAddr),
    RibOutWatchdog(&'a str, bool),
    ApiCommandRx(&'a str),
    ApiBackpressure(&'a str),
}

/// Reason why a BGP instance is inactive, surfaced to `show neighbor`.
#[derive(Debug)]
pub enum InstanceInactiveReason {
    AdminDown,
    MissingRouterId,
}

// ===== impl Debug =====

impl Debug<'_> {
    pub fn log(&self) {
        match self {
            Debug::InstanceCreate | Debug::InstanceStart | Debug::InstanceReload => {
                debug!("{}", self);
            }
            Debug::InstanceStop(reason) => {
                debug!(%reason, "{}", self);
            }
            Debug::NbrCreate(addr) | Debug::NbrDelete(addr) => {
                debug_span!("neighbor", %addr).in_scope(|| debug!("{}", self));
            }
            Debug::NbrFsmTransition(addr, old_state, new_state) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm")
                        .in_scope(|| debug!(?old_state, ?new_state, "{}", self))
                });
            }
            Debug::NbrMsgRx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(msg).unwrap();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::NbrMsgTx(addr, msg) => {
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data = serde_json::to_string(msg).unwrap();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::NbrAttrError(attr_type, action) => {
                debug!(?attr_type, ?action, "{}", self);
            }
            Debug::NbrCollision(addr, outcome) => {
                debug_span!("neighbor", %addr)
                    .in_scope(|| info!(%outcome, "{}", self));
            }
            Debug::NbrEorRx(addr) | Debug::NbrEorTx(addr) => {
                debug_span!("neighbor", %addr).in_scope(|| debug!("{}", self));
            }
            Debug::RibOutWatchdog(tag, enabled) => {
                debug!(%tag, %enabled, "{}", self);
            }
            Debug::ApiCommandRx(line) => {
                info_span!("api").in_scope(|| debug!(%line, "{}", self));
            }
            Debug::ApiBackpressure(process) => {
                info_span!("api").in_scope(|| debug!(%process, "{}", self));
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceCreate => write!(f, "instance created"),
            Debug::InstanceStart => write!(f, "starting instance"),
            Debug::InstanceStop(..) => write!(f, "stopping instance"),
            Debug::InstanceReload => write!(f, "reloading configuration"),
            Debug::NbrCreate(..) => write!(f, "neighbor created"),
            Debug::NbrDelete(..) => write!(f, "neighbor deleted"),
            Debug::NbrFsmTransition(..) => write!(f, "state transition"),
            Debug::NbrMsgRx(..) | Debug::NbrMsgTx(..) => write!(f, "message"),
            Debug::NbrAttrError(..) => write!(f, "malformed attribute"),
            Debug::NbrCollision(..) => write!(f, "connection collision resolved"),
            Debug::NbrEorRx(..) => write!(f, "end-of-rib received"),
            Debug::NbrEorTx(..) => write!(f, "end-of-rib sent"),
            Debug::RibOutWatchdog(..) => write!(f, "watchdog toggled"),
            Debug::ApiCommandRx(..) => write!(f, "command received"),
            Debug::ApiBackpressure(..) => write!(f, "backpressure engaged"),
        }
    }
}

// ===== impl InstanceInactiveReason =====

impl std::fmt::Display for InstanceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InstanceInactiveReason::MissingRouterId => {
                write!(f, "missing router-id")
            }
        }
    }
}

/// Handler for `SIGUSR1`: dumps a snapshot of every neighbor's FSM state at
/// `info` level (§6.2 — "reserved for dumping internal state to the log").
pub fn dump_state_snapshot(neighbors: &[(IpAddr, fsm::State)]) {
    info_span!("state-dump").in_scope(|| {
        for (addr, state) in neighbors {
            info!(%addr, ?state, "neighbor state");
        }
    });
}
