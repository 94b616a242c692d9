#![doc = include_str!("../../../README.md")]
//!
//! This crate re-exports the `labloop-core` library under a single name.

pub use labloop_core::*;
