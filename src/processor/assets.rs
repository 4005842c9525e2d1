//! Asset minting and asset transfers.
//!
//! Both flows follow the poly pattern (request, sign, broadcast); minting
//! is an asset transfer with `minting` set and the issuer as sender.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    accept_or_reject, BroadcastStep, ContractHandler, ContractProcessor, ProcessorError,
    Recipient, SignStep, SignedContract, Template, UnsignedContract,
};
use crate::context::{DamlAppContext, ToplContext};
use crate::ledger::{Command, CreatedEvent};
use crate::topl::{AssetTransfer, AssetValue, PROPOSITION_TYPE};

const MODULE: &str = "Topl.Asset";

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssetMintingRequest {
    pub operator: String,
    pub requestor: String,
    pub from: Vec<String>,
    pub to: Vec<Recipient>,
    pub change_address: String,
    pub asset_code: String,
    #[serde(default)]
    pub metadata: Option<String>,
    pub fee: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedMinting {
    pub operator: String,
    pub requestor: String,
    pub asset_code: String,
    pub tx_to_sign: String,
    pub msg_to_sign: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignedMinting {
    pub operator: String,
    pub requestor: String,
    pub asset_code: String,
    pub signed_tx: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransferRequest {
    pub operator: String,
    pub requestor: String,
    pub from: Vec<String>,
    pub to: Vec<Recipient>,
    pub change_address: String,
    #[serde(default)]
    pub consolidation_address: Option<String>,
    pub asset_code: String,
    #[serde(default)]
    pub metadata: Option<String>,
    pub fee: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedAssetTransfer {
    pub operator: String,
    pub requestor: String,
    pub asset_code: String,
    pub tx_to_sign: String,
    pub msg_to_sign: String,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignedAssetTransfer {
    pub operator: String,
    pub requestor: String,
    pub asset_code: String,
    pub signed_tx: String,
}

impl Template for AssetMintingRequest {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "AssetMintingRequest";
}

impl Template for UnsignedMinting {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "UnsignedMinting";
}

impl UnsignedContract for UnsignedMinting {
    const SIGN_CHOICE: &'static str = "UnsignedMinting_Sign";

    // The operator mints under its own key.
    fn signing_party(&self) -> &str {
        &self.operator
    }

    fn tx_to_sign(&self) -> &str {
        &self.tx_to_sign
    }

    fn msg_to_sign(&self) -> &str {
        &self.msg_to_sign
    }
}

impl Template for SignedMinting {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "SignedMinting";
}

impl SignedContract for SignedMinting {
    const SENT_CHOICE: &'static str = "SignedMinting_Sent";
    const FAIL_CHOICE: &'static str = "SignedMinting_Fail";

    fn broadcasting_party(&self) -> &str {
        &self.operator
    }

    fn signed_tx(&self) -> &str {
        &self.signed_tx
    }
}

impl Template for AssetTransferRequest {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "AssetTransferRequest";
}

impl Template for UnsignedAssetTransfer {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "UnsignedAssetTransfer";
}

impl UnsignedContract for UnsignedAssetTransfer {
    const SIGN_CHOICE: &'static str = "UnsignedAssetTransfer_Sign";

    fn signing_party(&self) -> &str {
        &self.operator
    }

    fn tx_to_sign(&self) -> &str {
        &self.tx_to_sign
    }

    fn msg_to_sign(&self) -> &str {
        &self.msg_to_sign
    }
}

impl Template for SignedAssetTransfer {
    const MODULE: &'static str = MODULE;
    const ENTITY: &'static str = "SignedAssetTransfer";
}

impl SignedContract for SignedAssetTransfer {
    const SENT_CHOICE: &'static str = "SignedAssetTransfer_Sent";
    const FAIL_CHOICE: &'static str = "SignedAssetTransfer_Fail";

    fn broadcasting_party(&self) -> &str {
        &self.operator
    }

    fn signed_tx(&self) -> &str {
        &self.signed_tx
    }
}

fn asset_recipients(
    to: &[Recipient],
    asset_code: &str,
    metadata: &Option<String>,
) -> Vec<(String, AssetValue)> {
    to.iter()
        .map(|r| {
            (
                r.address.clone(),
                AssetValue::new(&r.quantity, asset_code, metadata.clone()),
            )
        })
        .collect()
}

pub struct AssetMintingRequestHandler;

#[async_trait]
impl ContractHandler for AssetMintingRequestHandler {
    type Contract = AssetMintingRequest;

    const NAME: &'static str = "AssetMintingRequest";

    async fn handle(
        &self,
        contract: &AssetMintingRequest,
        event: &CreatedEvent,
        daml: &DamlAppContext,
        topl: &ToplContext,
    ) -> Result<Vec<Command>, ProcessorError> {
        // PRECONDITION: request must be addressed to this operator
        if contract.operator != daml.operator_party {
            return Ok(vec![]);
        }
        let minting = AssetTransfer {
            proposition_type: PROPOSITION_TYPE.to_owned(),
            sender: contract.from.clone(),
            recipients: asset_recipients(&contract.to, &contract.asset_code, &contract.metadata),
            fee: contract.fee.clone(),
            change_address: contract.change_address.clone(),
            consolidation_address: contract.change_address.clone(),
            minting: true,
            data: None,
        };
        let built = topl.client.raw_asset_transfer(&minting).await;
        accept_or_reject(
            built,
            event,
            "MintingRequest_Accept",
            "MintingRequest_Reject",
        )
    }
}

pub struct AssetTransferRequestHandler;

#[async_trait]
impl ContractHandler for AssetTransferRequestHandler {
    type Contract = AssetTransferRequest;

    const NAME: &'static str = "AssetTransferRequest";

    async fn handle(
        &self,
        contract: &AssetTransferRequest,
        event: &CreatedEvent,
        daml: &DamlAppContext,
        topl: &ToplContext,
    ) -> Result<Vec<Command>, ProcessorError> {
        // PRECONDITION: request must be addressed to this operator
        if contract.operator != daml.operator_party {
            return Ok(vec![]);
        }
        let transfer = AssetTransfer {
            proposition_type: PROPOSITION_TYPE.to_owned(),
            sender: contract.from.clone(),
            recipients: asset_recipients(&contract.to, &contract.asset_code, &contract.metadata),
            fee: contract.fee.clone(),
            change_address: contract.change_address.clone(),
            consolidation_address: contract
                .consolidation_address
                .clone()
                .unwrap_or_else(|| contract.change_address.clone()),
            minting: false,
            data: None,
        };
        let built = topl.client.raw_asset_transfer(&transfer).await;
        accept_or_reject(
            built,
            event,
            "AssetTransferRequest_Accept",
            "AssetTransferRequest_Reject",
        )
    }
}

pub type AssetMintingRequestProcessor = ContractProcessor<AssetMintingRequestHandler>;
pub type UnsignedMintingRequestProcessor = ContractProcessor<SignStep<UnsignedMinting>>;
pub type SignedMintingRequestProcessor = ContractProcessor<BroadcastStep<SignedMinting>>;
pub type AssetTransferRequestProcessor = ContractProcessor<AssetTransferRequestHandler>;
pub type UnsignedAssetTransferRequestProcessor =
    ContractProcessor<SignStep<UnsignedAssetTransfer>>;
pub type SignedAssetTransferRequestProcessor =
    ContractProcessor<BroadcastStep<SignedAssetTransfer>>;
