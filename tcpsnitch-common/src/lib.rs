// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared configuration and pure-encoder helpers for the `tcpsnitch` crates.

pub mod address;
pub mod config;
pub mod flags;

pub use config::Config;
