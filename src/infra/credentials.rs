use async_trait::async_trait;
use std::collections::HashMap;

use crate::app::ports::CredentialProvider;

/// Secrets keyed by authority identity, loaded from configuration.
/// Every tenant shares the same table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn secret_for(&self, _tenant_id: &str, identity: &str) -> Option<String> {
        self.secrets.get(identity).cloned()
    }
}
