// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Envelope Security
//!
//! Implementations of the [`EnvelopeSecurity`] boundary:
//!
//! - [`TrustedLanSecurity`] stamps the sender and skips signing.
//! - [`StrictSignedSecurity`] signs every envelope with HMAC-SHA256 keyed by a
//!   shared secret and only accepts envelopes from allow-listed nodes.
//!
//! The signature covers the canonical JSON encoding of the envelope and the
//! sender node id. `serde_json` objects are key-ordered, so both sides derive
//! identical bytes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::envelope::{Envelope, EnvelopeSecurity, EnvelopeSecurityError, SignedEnvelope};
use crate::domain::node_config::{resolve_secret, TransportConfig};
use crate::domain::peer::{NodeId, TrustMode};

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningInput<'a> {
    envelope: &'a Envelope,
    sender_node_id: &'a NodeId,
}

fn canonical_bytes(envelope: &Envelope, sender: &NodeId) -> Result<Vec<u8>, EnvelopeSecurityError> {
    serde_json::to_vec(&SigningInput {
        envelope,
        sender_node_id: sender,
    })
    .map_err(|e| EnvelopeSecurityError::Encoding(e.to_string()))
}

fn compute_signature(secret: &[u8], bytes: &[u8]) -> Result<Vec<u8>, EnvelopeSecurityError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| EnvelopeSecurityError::NotConfigured(e.to_string()))?;
    mac.update(bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub struct TrustedLanSecurity {
    local_node_id: NodeId,
}

impl TrustedLanSecurity {
    pub fn new(local_node_id: NodeId) -> Self {
        Self { local_node_id }
    }
}

impl EnvelopeSecurity for TrustedLanSecurity {
    fn seal(&self, envelope: Envelope) -> Result<SignedEnvelope, EnvelopeSecurityError> {
        Ok(SignedEnvelope {
            envelope,
            sender_node_id: self.local_node_id.clone(),
            key_id: None,
            signature: None,
        })
    }

    fn verify(&self, _signed: &SignedEnvelope) -> Result<(), EnvelopeSecurityError> {
        Ok(())
    }
}

pub struct StrictSignedSecurity {
    local_node_id: NodeId,
    signing_key_id: String,
    secrets: HashMap<String, Vec<u8>>,
    allowed_node_ids: HashSet<NodeId>,
}

impl StrictSignedSecurity {
    pub fn new(
        local_node_id: NodeId,
        signing_key_id: impl Into<String>,
        secrets: HashMap<String, Vec<u8>>,
        allowed_node_ids: impl IntoIterator<Item = NodeId>,
    ) -> Result<Self, EnvelopeSecurityError> {
        let signing_key_id = signing_key_id.into();
        if !secrets.contains_key(&signing_key_id) {
            return Err(EnvelopeSecurityError::NotConfigured(format!(
                "no secret for signing key '{signing_key_id}'"
            )));
        }
        Ok(Self {
            local_node_id,
            signing_key_id,
            secrets,
            allowed_node_ids: allowed_node_ids.into_iter().collect(),
        })
    }
}

impl EnvelopeSecurity for StrictSignedSecurity {
    fn seal(&self, envelope: Envelope) -> Result<SignedEnvelope, EnvelopeSecurityError> {
        let secret = self
            .secrets
            .get(&self.signing_key_id)
            .ok_or_else(|| EnvelopeSecurityError::UnknownKey(self.signing_key_id.clone()))?;
        let signature = compute_signature(secret, &canonical_bytes(&envelope, &self.local_node_id)?)?;

        Ok(SignedEnvelope {
            envelope,
            sender_node_id: self.local_node_id.clone(),
            key_id: Some(self.signing_key_id.clone()),
            signature: Some(hex::encode(signature)),
        })
    }

    fn verify(&self, signed: &SignedEnvelope) -> Result<(), EnvelopeSecurityError> {
        let (Some(key_id), Some(signature)) = (&signed.key_id, &signed.signature) else {
            return Err(EnvelopeSecurityError::MissingSignature);
        };
        if !self.allowed_node_ids.contains(&signed.sender_node_id) {
            return Err(EnvelopeSecurityError::SenderNotAllowed(signed.sender_node_id.clone()));
        }
        let secret = self
            .secrets
            .get(key_id)
            .ok_or_else(|| EnvelopeSecurityError::UnknownKey(key_id.clone()))?;

        let provided = hex::decode(signature).map_err(|_| EnvelopeSecurityError::InvalidSignature)?;
        let expected = compute_signature(
            secret,
            &canonical_bytes(&signed.envelope, &signed.sender_node_id)?,
        )?;

        if expected.ct_eq(&provided).unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(EnvelopeSecurityError::InvalidSignature)
        }
    }
}

/// Build the security boundary configured for this node.
pub fn from_transport_config(
    local_node_id: &NodeId,
    config: &TransportConfig,
) -> Result<Arc<dyn EnvelopeSecurity>, EnvelopeSecurityError> {
    match config.trust_mode {
        TrustMode::TrustedLan => Ok(Arc::new(TrustedLanSecurity::new(local_node_id.clone()))),
        TrustMode::StrictSigned => {
            let key_id = config.key_id.clone().ok_or_else(|| {
                EnvelopeSecurityError::NotConfigured("strict_signed requires a key id".to_string())
            })?;
            let secrets = config
                .shared_secrets
                .iter()
                .filter_map(|(id, value)| resolve_secret(value).map(|secret| (id.clone(), secret.into_bytes())))
                .collect();
            let allowed = config
                .allowed_node_ids
                .iter()
                .map(|id| NodeId::new(id.as_str()));
            Ok(Arc::new(StrictSignedSecurity::new(
                local_node_id.clone(),
                key_id,
                secrets,
                allowed,
            )?))
        }
    }
}
