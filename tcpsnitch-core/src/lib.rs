// Copyright tcpsnitch contributors
// SPDX-License-Identifier: Apache-2.0

//! The non-FFI heart of tcpsnitch: the descriptor table, connection
//! records, the event taxonomy and its JSON sink, the packet-capture
//! coordinator, the per-variant post-hooks, and process lifecycle.
//!
//! This crate knows nothing about symbol interposition; [`hooks::RawOps`]
//! is the seam the preload crate implements against the real, dlsym-resolved
//! libc functions.

pub mod capture;
pub mod connection;
pub mod event;
pub mod hooks;
pub mod lifecycle;
pub mod sink;
pub mod table;

pub use connection::Connection;
pub use hooks::{HookContext, RawOps};
pub use lifecycle::Runtime;
pub use table::DescriptorTable;
