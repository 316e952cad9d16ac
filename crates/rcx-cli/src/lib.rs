// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! rcx-cli library surface: the command registry and handlers, kept
//! separate from `main.rs` so the registry can be exercised directly in
//! tests without going through argument parsing.

pub mod commands;
pub mod config;
pub mod registry;
