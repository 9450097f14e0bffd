//! Provider registry.
//!
//! Holds all instantiated LLM provider instances and the mapping from
//! model roles (`intake` / `workhorse` / `smart`) to provider ids.
//! Adapters are registered at startup by the binary; the pipeline and
//! tool loop only ever resolve by role.

use std::collections::HashMap;
use std::sync::Arc;

use dotbot_domain::error::{Error, Result};
use dotbot_domain::model::ModelRole;

use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    roles: HashMap<ModelRole, String>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            roles: HashMap::new(),
        }
    }

    /// Register a provider instance under its `provider_id`.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let id = provider.provider_id().to_string();
        tracing::info!(provider_id = %id, "registered LLM provider");
        self.providers.insert(id, provider);
    }

    /// Assign a role to a registered provider id.
    pub fn assign_role(&mut self, role: ModelRole, provider_id: impl Into<String>) {
        self.roles.insert(role, provider_id.into());
    }

    /// Resolve a provider by role. Falls back to `Workhorse`, then to any
    /// registered provider, so a minimally-configured server still answers.
    pub fn for_role(&self, role: ModelRole) -> Result<Arc<dyn LlmProvider>> {
        if let Some(id) = self.roles.get(&role) {
            if let Some(p) = self.providers.get(id) {
                return Ok(p.clone());
            }
        }
        if role != ModelRole::Workhorse {
            if let Some(id) = self.roles.get(&ModelRole::Workhorse) {
                if let Some(p) = self.providers.get(id) {
                    return Ok(p.clone());
                }
            }
        }
        self.providers
            .values()
            .next()
            .cloned()
            .ok_or_else(|| Error::Config("no LLM providers registered".into()))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedProvider;

    #[test]
    fn role_resolution_falls_back_to_workhorse() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(ScriptedProvider::text("fast", ["ok"])));
        reg.assign_role(ModelRole::Workhorse, "fast");

        let p = reg.for_role(ModelRole::Smart).unwrap();
        assert_eq!(p.provider_id(), "fast");
    }

    #[test]
    fn empty_registry_errors() {
        let reg = ProviderRegistry::new();
        assert!(reg.for_role(ModelRole::Intake).is_err());
    }
}
