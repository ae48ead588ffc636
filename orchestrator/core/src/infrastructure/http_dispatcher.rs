// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Remote Dispatcher
//!
//! Delivers run envelopes to peer nodes over HTTP.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** [`RemoteDispatcher`] adapter built on `reqwest`
//! - **Integration:** Routing port → EnvelopeSecurity → `POST {peer}/api/internal/envelopes`
//!
//! The peer address comes from the discovery registry, preferring the
//! advertised URL. Peers answer with a [`RemoteAck`] body; a rejection is a
//! normal ack, only network failures and unparseable answers are errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::application::routing_port::{RemoteDispatcher, TransportError};
use crate::domain::envelope::{Envelope, EnvelopeSecurity, RemoteAck};
use crate::domain::peer::NodeId;
use crate::infrastructure::discovery_registry::DiscoveryRegistry;

pub const ENVELOPE_PATH: &str = "/api/internal/envelopes";

pub struct HttpRemoteDispatcher {
    client: Client,
    registry: Arc<DiscoveryRegistry>,
    security: Arc<dyn EnvelopeSecurity>,
}

impl HttpRemoteDispatcher {
    pub fn new(
        registry: Arc<DiscoveryRegistry>,
        security: Arc<dyn EnvelopeSecurity>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Unreachable {
                node_id: NodeId::new("*"),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            registry,
            security,
        })
    }

    fn endpoint_for(&self, target: &NodeId) -> Result<String, TransportError> {
        let peer = self
            .registry
            .get(target)
            .ok_or_else(|| TransportError::UnknownNode(target.clone()))?;
        Ok(format!("{}{ENVELOPE_PATH}", peer.reachable_url()))
    }
}

#[async_trait]
impl RemoteDispatcher for HttpRemoteDispatcher {
    async fn send(&self, target: &NodeId, envelope: Envelope) -> Result<RemoteAck, TransportError> {
        let url = self.endpoint_for(target)?;
        let kind = envelope.kind;
        let signed = self
            .security
            .seal(envelope)
            .map_err(|e| TransportError::Security(e.to_string()))?;

        tracing::debug!(node_id = %target, url = %url, kind = ?kind, "Sending envelope");
        let response = self
            .client
            .post(&url)
            .json(&signed)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                node_id: target.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| TransportError::Unreachable {
            node_id: target.clone(),
            message: e.to_string(),
        })?;

        match serde_json::from_str::<RemoteAck>(&body) {
            Ok(ack) => {
                metrics::counter!(
                    "teamgrid_envelopes_sent_total",
                    "accepted" => if ack.accepted { "true" } else { "false" }
                )
                .increment(1);
                Ok(ack)
            }
            Err(_) if !status.is_success() => Err(TransportError::Http {
                node_id: target.clone(),
                status: status.as_u16(),
                message: body,
            }),
            Err(e) => Err(TransportError::InvalidResponse {
                node_id: target.clone(),
                message: e.to_string(),
            }),
        }
    }
}
