//! Ledger-side model and client seam.
//!
//! [`LedgerClient`] is the only way the rest of the crate talks to a ledger
//! node. [`JsonApiClient`] speaks the node's HTTP JSON API and
//! [`InMemoryLedger`] backs the tests.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

pub mod json_api;
pub mod memory;

pub use json_api::JsonApiClient;
pub use memory::InMemoryLedger;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Ledger answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Ledger user {0} does not exist")]
    UserNotFound(String),
    #[error("Ledger user {0} has no primary party")]
    NoPrimaryParty(String),
    #[error("Malformed template identifier {0}")]
    InvalidIdentifier(String),
    #[error("Offset {0} is not on the ledger")]
    UnknownOffset(String),
    #[error("Could not decode ledger payload: {0}")]
    Decode(String),
}

/// Fully qualified template id. Serialized as `package:Module.Path:Entity`.
#[derive(Default, PartialEq, Eq, Hash, Debug, Clone)]
pub struct Identifier {
    pub package_id: String,
    pub module_name: String,
    pub entity_name: String,
}

impl Identifier {
    pub fn new(package_id: &str, module_name: &str, entity_name: &str) -> Self {
        Self {
            package_id: package_id.to_owned(),
            module_name: module_name.to_owned(),
            entity_name: entity_name.to_owned(),
        }
    }

    /// Template matching by name; an empty package id on either side is a wildcard.
    pub fn matches(&self, other: &Identifier) -> bool {
        self.module_name == other.module_name
            && self.entity_name == other.entity_name
            && (self.package_id.is_empty()
                || other.package_id.is_empty()
                || self.package_id == other.package_id)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.package_id, self.module_name, self.entity_name)
    }
}

impl FromStr for Identifier {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(package_id), Some(module_name), Some(entity_name))
                if !module_name.is_empty() && !entity_name.is_empty() =>
            {
                Ok(Self::new(package_id, module_name, entity_name))
            }
            _ => Err(LedgerError::InvalidIdentifier(s.to_owned())),
        }
    }
}

impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum LedgerOffset {
    Begin,
    End,
    Absolute(String),
}

#[derive(PartialEq, Debug, Clone)]
pub enum Filter {
    NoFilter,
    Templates(Vec<Identifier>),
}

impl Filter {
    fn admits(&self, template_id: &Identifier) -> bool {
        match self {
            Filter::NoFilter => true,
            Filter::Templates(templates) => templates.iter().any(|t| t.matches(template_id)),
        }
    }
}

#[derive(Default, PartialEq, Debug, Clone)]
pub struct TransactionFilter {
    pub filters_by_party: HashMap<String, Filter>,
}

impl TransactionFilter {
    /// Everything visible to `party`.
    pub fn for_party(party: &str) -> Self {
        Self {
            filters_by_party: HashMap::from([(party.to_owned(), Filter::NoFilter)]),
        }
    }

    /// Whether a party in this filter witnesses the event under its template filter.
    pub fn admits(&self, event: &Event) -> bool {
        event.witness_parties().iter().any(|party| {
            self.filters_by_party
                .get(party.as_str())
                .is_some_and(|filter| filter.admits(event.template_id()))
        })
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEvent {
    #[serde(default)]
    pub event_id: String,
    pub contract_id: String,
    pub template_id: Identifier,
    pub create_argument: Value,
    #[serde(default)]
    pub signatories: Vec<String>,
    #[serde(default)]
    pub observers: Vec<String>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedEvent {
    #[serde(default)]
    pub event_id: String,
    pub contract_id: String,
    pub template_id: Identifier,
    #[serde(default)]
    pub witness_parties: Vec<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub enum Event {
    #[serde(rename = "CreatedEvent")]
    Created(CreatedEvent),
    #[serde(rename = "ArchivedEvent")]
    Archived(ArchivedEvent),
}

impl Event {
    pub fn template_id(&self) -> &Identifier {
        match self {
            Event::Created(created) => &created.template_id,
            Event::Archived(archived) => &archived.template_id,
        }
    }

    pub fn witness_parties(&self) -> Vec<&String> {
        match self {
            Event::Created(created) => created
                .signatories
                .iter()
                .chain(created.observers.iter())
                .collect(),
            Event::Archived(archived) => archived.witness_parties.iter().collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(alias = "updateId")]
    pub transaction_id: String,
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub effective_at: String,
    #[serde(deserialize_with = "offset_string")]
    pub offset: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Transaction {
    pub fn created_events(&self) -> impl Iterator<Item = &CreatedEvent> {
        self.events.iter().filter_map(|event| match event {
            Event::Created(created) => Some(created),
            Event::Archived(_) => None,
        })
    }
}

/// Offsets are opaque strings here; some nodes encode them as integers.
pub(crate) fn offset_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(offset) => Ok(offset),
        Value::Number(offset) => Ok(offset.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected offset {}",
            other
        ))),
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_party: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub enum Command {
    #[serde(rename = "ExerciseCommand", rename_all = "camelCase")]
    Exercise {
        template_id: Identifier,
        contract_id: String,
        choice: String,
        choice_argument: Value,
    },
}

impl Command {
    pub fn exercise(
        template_id: &Identifier,
        contract_id: &str,
        choice: &str,
        argument: Value,
    ) -> Self {
        Command::Exercise {
            template_id: template_id.clone(),
            contract_id: contract_id.to_owned(),
            choice: choice.to_owned(),
            choice_argument: argument,
        }
    }
}

#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub application_id: String,
    pub command_id: String,
    pub act_as: Vec<String>,
    pub commands: Vec<Command>,
}

pub type TransactionStream = Pin<Box<dyn Stream<Item = Result<Transaction, LedgerError>> + Send>>;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<User, LedgerError>;

    async fn ledger_end(&self) -> Result<String, LedgerError>;

    /// Flat transactions visible under `filter`, starting after `begin`.
    async fn transactions(
        &self,
        begin: LedgerOffset,
        filter: TransactionFilter,
        verbose: bool,
    ) -> Result<TransactionStream, LedgerError>;

    async fn submit_and_wait(&self, request: SubmitRequest) -> Result<(), LedgerError>;
}

/// Resolves the primary party of a ledger user.
pub async fn primary_party(
    client: &dyn LedgerClient,
    user_id: &str,
) -> Result<String, LedgerError> {
    let user = client.get_user(user_id).await?;
    user.primary_party
        .ok_or_else(|| LedgerError::NoPrimaryParty(user_id.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifier_round_trips_through_its_string_form() {
        let id: Identifier = "abc123:Topl.Transfer:TransferRequest".parse().unwrap();
        assert_eq!(id, Identifier::new("abc123", "Topl.Transfer", "TransferRequest"));
        assert_eq!(id.to_string(), "abc123:Topl.Transfer:TransferRequest");
    }

    #[test]
    fn identifier_requires_three_parts() {
        assert!("Topl.Transfer:TransferRequest".parse::<Identifier>().is_err());
        assert!("pkg:Topl.Transfer:".parse::<Identifier>().is_err());
    }

    #[test]
    fn empty_package_id_matches_any_package() {
        let wildcard = Identifier::new("", "Topl.Transfer", "TransferRequest");
        let concrete = Identifier::new("abc", "Topl.Transfer", "TransferRequest");
        let other_package = Identifier::new("def", "Topl.Transfer", "TransferRequest");
        assert!(wildcard.matches(&concrete));
        assert!(concrete.matches(&wildcard));
        assert!(!concrete.matches(&other_package));
    }

    #[test]
    fn filter_admits_only_witnessed_events() {
        let filter = TransactionFilter::for_party("operator::1");
        let mut created = CreatedEvent {
            contract_id: "#1".to_owned(),
            template_id: Identifier::new("", "Topl.Transfer", "TransferRequest"),
            signatories: vec!["alice::1".to_owned()],
            observers: vec!["operator::1".to_owned()],
            ..CreatedEvent::default()
        };
        assert!(filter.admits(&Event::Created(created.clone())));
        created.observers.clear();
        assert!(!filter.admits(&Event::Created(created)));
    }

    #[test]
    fn template_filter_narrows_events() {
        let mut filter = TransactionFilter::default();
        filter.filters_by_party.insert(
            "operator::1".to_owned(),
            Filter::Templates(vec![Identifier::new("", "Topl.Transfer", "SignedTransfer")]),
        );
        let event = Event::Created(CreatedEvent {
            template_id: Identifier::new("pkg", "Topl.Transfer", "TransferRequest"),
            signatories: vec!["operator::1".to_owned()],
            ..CreatedEvent::default()
        });
        assert!(!filter.admits(&event));
    }

    #[test]
    fn transaction_decodes_numeric_offsets_and_tagged_events() {
        let tx: Transaction = serde_json::from_value(json!({
            "updateId": "tx-1",
            "offset": 17,
            "events": [
                {"CreatedEvent": {
                    "contractId": "#1:0",
                    "templateId": "pkg:Topl.Transfer:TransferRequest",
                    "createArgument": {"operator": "operator::1"},
                    "signatories": ["operator::1"]
                }},
                {"ArchivedEvent": {
                    "contractId": "#0:0",
                    "templateId": "pkg:Topl.Transfer:TransferRequest"
                }}
            ]
        }))
        .unwrap();
        assert_eq!(tx.transaction_id, "tx-1");
        assert_eq!(tx.offset, "17");
        assert_eq!(tx.created_events().count(), 1);
    }

    #[test]
    fn exercise_command_serializes_tagged() {
        let command = Command::exercise(
            &Identifier::new("pkg", "Topl.Transfer", "TransferRequest"),
            "#1:0",
            "TransferRequest_Accept",
            json!({}),
        );
        let encoded = serde_json::to_value(&command).unwrap();
        assert_eq!(
            encoded,
            json!({"ExerciseCommand": {
                "templateId": "pkg:Topl.Transfer:TransferRequest",
                "contractId": "#1:0",
                "choice": "TransferRequest_Accept",
                "choiceArgument": {}
            }})
        );
    }

    #[tokio::test]
    async fn primary_party_requires_a_party() {
        let ledger = InMemoryLedger::default();
        ledger.add_user(User {
            id: "operator".to_owned(),
            primary_party: None,
        });
        let result = primary_party(&ledger, "operator").await;
        assert!(matches!(result, Err(LedgerError::NoPrimaryParty(_))));
        let result = primary_party(&ledger, "nobody").await;
        assert!(matches!(result, Err(LedgerError::UserNotFound(_))));
    }
}
