// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`teamgrid-core`)
//!
//! HTTP surface that translates external requests into application calls.
//! Routing, fencing and placement decisions all live in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | Team ingress, discovery and node-to-node envelope endpoints |

pub mod api;
