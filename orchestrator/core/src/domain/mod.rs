// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure types and port traits for distributed team runs.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Team definitions, run records, peers, envelopes and the
//!   ports the application layer depends on

pub mod approval;
pub mod dispatch;
pub mod envelope;
pub mod events;
pub mod node_config;
pub mod peer;
pub mod repository;
pub mod run;
pub mod runtime;
pub mod team;
