#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the tracker library; the `flowtrack` binary lives in
//! `flowtrack-cli`.

pub use flowtrack_core::*;
