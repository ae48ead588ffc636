// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon mode implementation
//!
//! Runs a single teamgrid node in the foreground: the HTTP API, discovery
//! maintenance and peer sync, until Ctrl+C or SIGTERM.

pub mod server;

pub use server::start_daemon;
