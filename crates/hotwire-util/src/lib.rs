#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for hotwire.
//!
//! Pure helpers with no logging dependency: content hashing for the
//! dependency optimizer and crash-safe writes for its cache directory.

pub mod fs;
pub mod hash;
