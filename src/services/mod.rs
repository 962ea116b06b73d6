//! Business logic services
//!
//! This module contains the gateway's control logic separated from HTTP
//! concerns, so it can be driven identically from the boot sequence and from
//! request handlers.

pub mod bridge;
pub mod config_store;
pub mod device;
pub mod network;
