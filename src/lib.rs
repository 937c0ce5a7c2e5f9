//! WiiM Control - Rust Implementation
//!
//! Tracks and commands playback across a WiiM/LinkPlay network streamer and
//! the local operating system's now-playing session, presenting exactly one
//! of them as active at a time.
//!
//! This library provides:
//! - LinkPlay HTTP API client and mDNS device discovery
//! - Remote and local media sources with a shared polling synchronizer
//! - Source arbitration with automatic and forced modes
//! - A line-oriented control console

pub mod adapters;
pub mod arbitrator;
pub mod bus;
pub mod config;
pub mod console;
