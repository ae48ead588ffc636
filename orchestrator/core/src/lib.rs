// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Teamgrid core
//!
//! Distributed orchestration and routing for agent team runs whose members
//! are spread over several nodes.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, run orchestration, discovery and the HTTP surface
//!   a node daemon serves

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod node;
pub mod presentation;

pub use node::TeamgridNode;
