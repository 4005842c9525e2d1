//! Processors react to contracts created on the ledger.
//!
//! Each processor watches one template. For every matching created event
//! it decodes the contract, asks its acceptance predicate, lets its
//! [`ContractHandler`] talk to Topl, and answers on the ledger by
//! exercising a choice on the triggering contract.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::DEFAULT_PROCESSOR_TIMEOUT;
use crate::context::{DamlAppContext, ToplContext};
use crate::ledger::{Command, CreatedEvent, Identifier, LedgerError, Transaction};
use crate::signer::{SignerError, TransactionSigner};
use crate::topl::{RawTransaction, SignedTransaction, ToplError};

pub mod assets;
pub mod polys;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("{0}")]
    Ledger(#[from] LedgerError),
    #[error("{0}")]
    Topl(#[from] ToplError),
    #[error("{0}")]
    Signer(#[from] SignerError),
    #[error("Contract {contract_id} could not be decoded: {reason}")]
    Decode { contract_id: String, reason: String },
    #[error("Handling contract {0} timed out")]
    Timeout(String),
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(false)` asks the caller to stop feeding transactions.
    async fn process_transaction(&self, tx: &Transaction) -> Result<bool, ProcessorError>;
}

/// A contract template as seen from the bridge.
pub trait Template: DeserializeOwned + Send + Sync + 'static {
    const MODULE: &'static str;
    const ENTITY: &'static str;

    fn template_id() -> Identifier {
        Identifier::new("", Self::MODULE, Self::ENTITY)
    }
}

/// A contract carrying a transaction that still needs a signature.
pub trait UnsignedContract: Template {
    const SIGN_CHOICE: &'static str;

    fn signing_party(&self) -> &str;
    fn tx_to_sign(&self) -> &str;
    fn msg_to_sign(&self) -> &str;
}

/// A contract carrying a signed transaction ready for broadcast.
pub trait SignedContract: Template {
    const SENT_CHOICE: &'static str;
    const FAIL_CHOICE: &'static str;

    fn broadcasting_party(&self) -> &str;
    fn signed_tx(&self) -> &str;
}

#[async_trait]
pub trait ContractHandler: Send + Sync {
    type Contract: Template;

    const NAME: &'static str;

    /// Commands to submit in answer to `contract`. Empty means "not for us".
    async fn handle(
        &self,
        contract: &Self::Contract,
        event: &CreatedEvent,
        daml: &DamlAppContext,
        topl: &ToplContext,
    ) -> Result<Vec<Command>, ProcessorError>;
}

/// Receiver of a Topl transfer, as recorded on contracts.
#[derive(Serialize, Deserialize, Default, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub address: String,
    pub quantity: String,
}

pub type AcceptFn<C> = Arc<dyn Fn(&C, &str) -> bool + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&ProcessorError) -> bool + Send + Sync>;

/// Drives a [`ContractHandler`] over the created events of a transaction.
pub struct ContractProcessor<H: ContractHandler> {
    daml: DamlAppContext,
    topl: ToplContext,
    handler: H,
    timeout: Duration,
    accept: AcceptFn<H::Contract>,
    on_error: ErrorFn,
}

impl<H: ContractHandler> ContractProcessor<H> {
    pub fn new(daml: DamlAppContext, topl: ToplContext, handler: H) -> Self {
        Self {
            daml,
            topl,
            handler,
            timeout: DEFAULT_PROCESSOR_TIMEOUT,
            accept: Arc::new(|_, _| true),
            on_error: Arc::new(|_| true),
        }
    }

    /// Upper bound for handling one contract, ledger answer included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Predicate over `(contract, contract_id)`; rejected contracts are skipped.
    pub fn with_accept<F>(mut self, accept: F) -> Self
    where
        F: Fn(&H::Contract, &str) -> bool + Send + Sync + 'static,
    {
        self.accept = Arc::new(accept);
        self
    }

    /// Decides, per failure, whether processing should go on.
    pub fn with_error_handler<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&ProcessorError) -> bool + Send + Sync + 'static,
    {
        self.on_error = Arc::new(on_error);
        self
    }

    async fn process_event(&self, event: &CreatedEvent) -> Result<(), ProcessorError> {
        let contract: H::Contract = serde_json::from_value(event.create_argument.clone())
            .map_err(|e| decode_error(&event.contract_id, e))?;
        if !(self.accept)(&contract, &event.contract_id) {
            tracing::debug!(processor = H::NAME, contract_id = %event.contract_id, "contract not accepted");
            return Ok(());
        }
        let work = async {
            let commands = self
                .handler
                .handle(&contract, event, &self.daml, &self.topl)
                .await?;
            self.daml.submit(commands).await?;
            Ok::<_, ProcessorError>(())
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| ProcessorError::Timeout(event.contract_id.clone()))?
    }
}

#[async_trait]
impl<H: ContractHandler> Processor for ContractProcessor<H> {
    fn name(&self) -> &'static str {
        H::NAME
    }

    async fn process_transaction(&self, tx: &Transaction) -> Result<bool, ProcessorError> {
        let template = H::Contract::template_id();
        let mut keep_going = true;
        for event in tx
            .created_events()
            .filter(|event| event.template_id.matches(&template))
        {
            match self.process_event(event).await {
                Ok(()) => {
                    tracing::info!(processor = H::NAME, contract_id = %event.contract_id, "contract handled")
                }
                Err(e) => {
                    tracing::warn!(processor = H::NAME, contract_id = %event.contract_id, error = %e, "contract handling failed");
                    keep_going &= (self.on_error)(&e);
                }
            }
        }
        Ok(keep_going)
    }
}

pub(crate) fn decode_error(contract_id: &str, e: impl ToString) -> ProcessorError {
    ProcessorError::Decode {
        contract_id: contract_id.to_owned(),
        reason: e.to_string(),
    }
}

/// Accepts a request with the built transaction, or rejects it when Topl refused to build one.
pub(crate) fn accept_or_reject(
    built: Result<RawTransaction, ToplError>,
    event: &CreatedEvent,
    accept_choice: &str,
    reject_choice: &str,
) -> Result<Vec<Command>, ProcessorError> {
    let (choice, argument) = match built {
        Ok(raw) => (
            accept_choice,
            json!({ "txToSign": raw.raw_tx.to_string(), "msgToSign": raw.message_to_sign }),
        ),
        Err(ToplError::Rpc { message, .. }) => (reject_choice, json!({ "reason": message })),
        Err(e) => return Err(e.into()),
    };
    Ok(vec![Command::exercise(
        &event.template_id,
        &event.contract_id,
        choice,
        argument,
    )])
}

/// Signs the transaction of an [`UnsignedContract`] addressed to this party.
pub struct SignStep<C> {
    signer: Arc<dyn TransactionSigner>,
    _contract: PhantomData<fn() -> C>,
}

impl<C> SignStep<C> {
    pub fn new(signer: Arc<dyn TransactionSigner>) -> Self {
        Self {
            signer,
            _contract: PhantomData,
        }
    }
}

#[async_trait]
impl<C: UnsignedContract> ContractHandler for SignStep<C> {
    type Contract = C;

    const NAME: &'static str = C::ENTITY;

    async fn handle(
        &self,
        contract: &C,
        event: &CreatedEvent,
        daml: &DamlAppContext,
        _topl: &ToplContext,
    ) -> Result<Vec<Command>, ProcessorError> {
        // PRECONDITION: this party is the one asked to sign
        if contract.signing_party() != daml.operator_party {
            return Ok(vec![]);
        }
        let raw_tx: Value = serde_json::from_str(contract.tx_to_sign())
            .map_err(|e| decode_error(&event.contract_id, e))?;
        let raw = RawTransaction {
            raw_tx,
            message_to_sign: contract.msg_to_sign().to_owned(),
        };
        let signed = self.signer.sign(&raw)?;
        // POSTCONDITION: the signed transaction is handed back to the ledger
        Ok(vec![Command::exercise(
            &event.template_id,
            &event.contract_id,
            C::SIGN_CHOICE,
            json!({ "signedTx": signed.tx.to_string() }),
        )])
    }
}

/// Broadcasts the transaction of a [`SignedContract`] and records the outcome.
pub struct BroadcastStep<C> {
    _contract: PhantomData<fn() -> C>,
}

impl<C> Default for BroadcastStep<C> {
    fn default() -> Self {
        Self {
            _contract: PhantomData,
        }
    }
}

#[async_trait]
impl<C: SignedContract> ContractHandler for BroadcastStep<C> {
    type Contract = C;

    const NAME: &'static str = C::ENTITY;

    async fn handle(
        &self,
        contract: &C,
        event: &CreatedEvent,
        daml: &DamlAppContext,
        topl: &ToplContext,
    ) -> Result<Vec<Command>, ProcessorError> {
        // PRECONDITION: this party is the one asked to broadcast
        if contract.broadcasting_party() != daml.operator_party {
            return Ok(vec![]);
        }
        let tx: Value = serde_json::from_str(contract.signed_tx())
            .map_err(|e| decode_error(&event.contract_id, e))?;
        let (choice, argument) = match topl.client.broadcast_tx(&SignedTransaction { tx }).await {
            Ok(tx_id) => (C::SENT_CHOICE, json!({ "txId": tx_id })),
            Err(ToplError::Rpc { message, .. }) => (C::FAIL_CHOICE, json!({ "reason": message })),
            Err(e) => return Err(e.into()),
        };
        // POSTCONDITION: the contract records either the Topl tx id or the rejection
        Ok(vec![Command::exercise(
            &event.template_id,
            &event.contract_id,
            choice,
            argument,
        )])
    }
}


#[cfg(test)]
mod test {
    use super::fixtures::*;
    use super::polys::{SignedTransferProcessor, TransferRequestHandler, TransferRequestProcessor};
    use super::*;
    use crate::ledger::Event;

    fn transfer_request(operator: &str) -> Value {
        json!({
            "operator": operator,
            "requestor": ALICE,
            "from": ["alice-address"],
            "to": [{"address": "bob-address", "quantity": "100"}],
            "changeAddress": "alice-address",
            "fee": "100",
            "data": null
        })
    }

    fn request_processor(harness: &Harness) -> TransferRequestProcessor {
        ContractProcessor::new(
            harness.daml_context.clone(),
            harness.topl_context.clone(),
            TransferRequestHandler,
        )
    }

    #[tokio::test]
    async fn other_templates_are_ignored() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        let tx = created(
            Identifier::new("", "Topl.Transfer", "SomethingElse"),
            "#1:0",
            transfer_request(OPERATOR),
        );
        let result = request_processor(&harness).process_transaction(&tx).await;
        assert!(result.unwrap());
        assert!(harness.topl.calls().is_empty());
        assert!(harness.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn archived_events_are_ignored() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        let tx = Transaction {
            events: vec![Event::Archived(crate::ledger::ArchivedEvent {
                contract_id: "#1:0".to_owned(),
                template_id: Identifier::new("pkg", "Topl.Transfer", "TransferRequest"),
                witness_parties: vec![OPERATOR.to_owned()],
                ..Default::default()
            })],
            ..Transaction::default()
        };
        assert!(request_processor(&harness)
            .process_transaction(&tx)
            .await
            .unwrap());
        assert!(harness.topl.calls().is_empty());
    }

    #[tokio::test]
    async fn acceptance_predicate_gates_the_handler() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        let processor = request_processor(&harness).with_accept(|_, contract_id| contract_id != "#1:0");
        let tx = created(
            polys::TransferRequest::template_id(),
            "#1:0",
            transfer_request(OPERATOR),
        );
        assert!(processor.process_transaction(&tx).await.unwrap());
        assert!(harness.topl.calls().is_empty());
        assert!(harness.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn undecodable_contracts_go_to_the_error_predicate() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        let processor = request_processor(&harness)
            .with_error_handler(|e| !matches!(e, ProcessorError::Decode { .. }));
        let tx = created(
            polys::TransferRequest::template_id(),
            "#1:0",
            json!({"unexpected": true}),
        );
        assert!(!processor.process_transaction(&tx).await.unwrap());
    }

    #[tokio::test]
    async fn default_error_predicate_keeps_going() {
        let harness = harness(OPERATOR, Behaviour::Unreachable);
        let tx = created(
            polys::TransferRequest::template_id(),
            "#1:0",
            transfer_request(OPERATOR),
        );
        assert!(request_processor(&harness)
            .process_transaction(&tx)
            .await
            .unwrap());
        assert!(harness.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let harness = harness(OPERATOR, Behaviour::Stall(Duration::from_millis(200)));
        let processor = request_processor(&harness)
            .with_timeout(Duration::from_millis(20))
            .with_error_handler(|e| !matches!(e, ProcessorError::Timeout(_)));
        let tx = created(
            polys::TransferRequest::template_id(),
            "#1:0",
            transfer_request(OPERATOR),
        );
        assert!(!processor.process_transaction(&tx).await.unwrap());
        assert!(harness.ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn broadcast_step_skips_contracts_for_other_parties() {
        let harness = harness("someone-else::1", Behaviour::Accept);
        let processor: SignedTransferProcessor = ContractProcessor::new(
            harness.daml_context.clone(),
            harness.topl_context.clone(),
            BroadcastStep::default(),
        );
        let tx = created(
            polys::SignedTransfer::template_id(),
            "#2:0",
            json!({
                "operator": OPERATOR,
                "requestor": ALICE,
                "from": ["alice-address"],
                "to": [{"address": "bob-address", "quantity": "100"}],
                "changeAddress": "alice-address",
                "fee": "100",
                "signedTx": "{}"
            }),
        );
        assert!(processor.process_transaction(&tx).await.unwrap());
        assert!(harness.topl.calls().is_empty());
    }

    #[test]
    fn rpc_rejections_become_reject_choices() {
        let event = CreatedEvent {
            contract_id: "#1:0".to_owned(),
            ..CreatedEvent::default()
        };
        let commands = accept_or_reject(
            Err(ToplError::Rpc {
                code: 1,
                message: "no funds".to_owned(),
            }),
            &event,
            "Accept",
            "Reject",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![Command::exercise(
                &event.template_id,
                "#1:0",
                "Reject",
                json!({"reason": "no funds"})
            )]
        );
    }

    #[test]
    fn transport_failures_are_not_rejections() {
        let event = CreatedEvent::default();
        let result = accept_or_reject(
            Err(ToplError::EmptyResponse),
            &event,
            "Accept",
            "Reject",
        );
        assert!(matches!(result, Err(ProcessorError::Topl(_))));
    }
}
