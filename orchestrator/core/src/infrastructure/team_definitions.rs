// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Config-backed [`TeamDefinitionProvider`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::team::{TeamDefinition, TeamDefinitionId, TeamDefinitionProvider};

/// Serves the team definitions listed in the node configuration.
#[derive(Default)]
pub struct StaticTeamDefinitionProvider {
    definitions: RwLock<HashMap<TeamDefinitionId, TeamDefinition>>,
}

impl StaticTeamDefinitionProvider {
    /// Later definitions with the same id replace earlier ones.
    pub fn new(definitions: impl IntoIterator<Item = TeamDefinition>) -> Self {
        let provider = Self::default();
        for definition in definitions {
            provider.upsert(definition);
        }
        provider
    }

    pub fn upsert(&self, definition: TeamDefinition) {
        self.definitions
            .write()
            .insert(definition.id.clone(), definition);
    }

    pub fn ids(&self) -> Vec<TeamDefinitionId> {
        let mut ids: Vec<_> = self.definitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl TeamDefinitionProvider for StaticTeamDefinitionProvider {
    async fn find_team_definition(&self, id: &TeamDefinitionId) -> Option<TeamDefinition> {
        self.definitions.read().get(id).cloned()
    }
}
