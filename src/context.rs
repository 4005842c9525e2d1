use std::sync::Arc;

use uuid::Uuid;

use crate::ledger::{Command, LedgerClient, LedgerError, SubmitRequest};
use crate::topl::{Provider, ToplClient};

/// Everything a processor needs to answer on the ledger.
#[derive(Clone)]
pub struct DamlAppContext {
    pub app_id: String,
    pub operator_party: String,
    pub client: Arc<dyn LedgerClient>,
}

impl DamlAppContext {
    pub fn new(app_id: &str, operator_party: &str, client: Arc<dyn LedgerClient>) -> Self {
        Self {
            app_id: app_id.to_owned(),
            operator_party: operator_party.to_owned(),
            client,
        }
    }

    /// Submits `commands` as the context's party under a fresh command id.
    pub async fn submit(&self, commands: Vec<Command>) -> Result<(), LedgerError> {
        if commands.is_empty() {
            return Ok(());
        }
        let request = SubmitRequest {
            application_id: self.app_id.clone(),
            command_id: Uuid::new_v4().to_string(),
            act_as: vec![self.operator_party.clone()],
            commands,
        };
        self.client.submit_and_wait(request).await
    }
}

/// The Topl provider plus a client bound to it.
#[derive(Clone)]
pub struct ToplContext {
    pub provider: Provider,
    pub client: Arc<dyn ToplClient>,
}

impl ToplContext {
    pub fn new(provider: Provider, client: Arc<dyn ToplClient>) -> Self {
        Self { provider, client }
    }
}
