//! Mock servers for source integration testing
//!
//! Simulates a WiiM / LinkPlay streamer's HTTP API so the protocol client,
//! the remote source and the arbitrator can be tested without hardware.

#![allow(dead_code)]

pub mod wiim;

pub use wiim::{MockWiimDevice, SilentDevice};
