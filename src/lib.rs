//! Mesh OTA firmware library.
//!
//! Exposes the pure-logic modules for integration testing and external
//! inspection. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module, so the whole crate
//! also builds and tests on the host against simulation adapters.

#![deny(unused_must_use)]

pub mod bitmap;
pub mod config;
pub mod crc;
pub mod distributor;
pub mod downloader;
pub mod error;
pub mod receiver;
pub mod reboot;
pub mod rollback;
pub mod router;
pub mod service;
pub mod signal;
pub mod version_gate;
pub mod wire;

pub mod ports;

pub mod adapters;
