//! Shared definitions for the conntrack accounting probe
//!
//! This crate describes the binary contract between the BPF program and
//! its userspace loader: record layout, map names and map indices.

#![no_std]

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::{ConfigKey, RateCurveKey};
