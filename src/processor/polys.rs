//! Poly transfers: request, sign, broadcast.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    accept_or_reject, BroadcastStep, ContractHandler, ContractProcessor, ProcessorError,
    Recipient, SignStep, SignedContract, Template, UnsignedContract,
};
use crate::context::{DamlAppContext, ToplContext};
use crate::ledger::{Command, CreatedEvent};
use crate::topl::{PolyTransfer, PROPOSITION_TYPE};

const MODULE: &str = "Topl.Transfer";

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub operator: String,
    pub requestor: String,
    pub from: Vec<String>,
    pub to: Vec<Recipient>,
    pub change_address: String,
    pub fee: String,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransfer {
    pub operator: String,
    pub requestor: String,
    pub from: Vec<String>,
    pub to: Vec<Recipient>,
    pub change_address: String,
    pub fee: String,
    pub tx_to_sign: String,
    pub msg_to_sign: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransfer {
    pub operator: String,
    pub requestor: String,
    pub from: Vec<String>,
    pub to: Vec<Recipient>,
    pub change_address: String,
    pub fee: String,
    pub signed_tx: String,
}

impl Template for TransferRequest {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "TransferRequest";
}

impl Template for UnsignedTransfer {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "UnsignedTransfer";
}

impl UnsignedContract for UnsignedTransfer {
    const SIGN_CHOICE: &'static str = "UnsignedTransfer_Sign";

    fn signing_party(&self) -> &str {
        &self.requestor
    }

    fn tx_to_sign(&self) -> &str {
        &self.tx_to_sign
    }

    fn msg_to_sign(&self) -> &str {
        &self.msg_to_sign
    }
}

impl Template for SignedTransfer {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "SignedTransfer";
}

impl SignedContract for SignedTransfer {
    const SENT_CHOICE: &'static str = "SignedTransfer_Sent";
    const FAIL_CHOICE: &'static str = "SignedTransfer_Fail";

    fn broadcasting_party(&self) -> &str {
        &self.operator
    }

    fn signed_tx(&self) -> &str {
        &self.signed_tx
    }
}

/// Operator side: turns a transfer request into an unsigned Topl transaction.
pub struct TransferRequestHandler;

#[async_trait]
impl ContractHandler for TransferRequestHandler {
    type Contract = TransferRequest;

    const NAME: &'static str = "TransferRequest";

    async fn handle(
        &self,
        contract: &TransferRequest,
        event: &CreatedEvent,
        daml: &DamlAppContext,
        topl: &ToplContext,
    ) -> Result<Vec<Command>, ProcessorError> {
        // PRECONDITION: request must be addressed to this operator
        if contract.operator != daml.operator_party {
            return Ok(vec![]);
        }
        let transfer = PolyTransfer {
            proposition_type: PROPOSITION_TYPE.to_owned(),
            sender: contract.from.clone(),
            recipients: contract
                .to
                .iter()
                .map(|r| (r.address.clone(), r.quantity.clone()))
                .collect(),
            fee: contract.fee.clone(),
            change_address: contract.change_address.clone(),
            data: contract.data.clone(),
        };
        let built = topl.client.raw_poly_transfer(&transfer).await;
        // POSTCONDITION: request accepted with the tx to sign, or rejected with Topl's reason
        accept_or_reject(
            built,
            event,
            "TransferRequest_Accept",
            "TransferRequest_Reject",
        )
    }
}

pub type TransferRequestProcessor = ContractProcessor<TransferRequestHandler>;
pub type UnsignedTransferProcessor = ContractProcessor<SignStep<UnsignedTransfer>>;
pub type SignedTransferProcessor = ContractProcessor<BroadcastStep<SignedTransfer>>;
