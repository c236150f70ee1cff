#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the pingwell coordinator and its engines.

pub use pingwell_core::*;
