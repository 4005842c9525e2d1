use std::future::Future;
use std::sync::Arc;

use config::{
    AliceArgs, AssetOperatorArgs, OperatorArgs, ALICE_APP_ID, ALICE_USER, OPERATOR_APP_ID,
    OPERATOR_USER,
};
use context::{DamlAppContext, ToplContext};
use ledger::{JsonApiClient, LedgerClient};
use logger::TracingLogger;
use processor::assets::{
    AssetMintingRequestHandler, AssetMintingRequestProcessor, AssetTransferRequestHandler,
    AssetTransferRequestProcessor, SignedAssetTransferRequestProcessor,
    SignedMintingRequestProcessor, UnsignedAssetTransferRequestProcessor,
    UnsignedMintingRequestProcessor,
};
use processor::polys::{
    SignedTransferProcessor, TransferRequestHandler, TransferRequestProcessor,
    UnsignedTransferProcessor,
};
use processor::{BroadcastStep, Processor, SignStep};
use runner::{Runner, RunnerError, SubscriptionRunner};
use signer::{Keyfile, TransactionSigner};
use topl::{JsonRpcClient, Network, Provider};

pub mod config;
pub mod context;
pub mod ledger;
pub mod logger;
pub mod processor;
pub mod runner;
pub mod signer;
pub mod topl;

/// Operator: accepts poly transfer requests, broadcasts signed transfers and
/// accepts asset minting requests.
pub fn operator_processors(daml: &DamlAppContext, topl: &ToplContext) -> Vec<Box<dyn Processor>> {
    vec![
        Box::new(TransferRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            TransferRequestHandler,
        )),
        Box::new(SignedTransferProcessor::new(
            daml.clone(),
            topl.clone(),
            BroadcastStep::default(),
        )),
        Box::new(AssetMintingRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            AssetMintingRequestHandler,
        )),
    ]
}

/// Alice: signs the unsigned transfers addressed to her.
pub fn alice_processors(
    daml: &DamlAppContext,
    topl: &ToplContext,
    signer: Arc<dyn TransactionSigner>,
) -> Vec<Box<dyn Processor>> {
    vec![Box::new(UnsignedTransferProcessor::new(
        daml.clone(),
        topl.clone(),
        SignStep::new(signer),
    ))]
}

/// Asset operator: the full minting and asset transfer flows, signing with
/// its own key.
pub fn asset_operator_processors(
    daml: &DamlAppContext,
    topl: &ToplContext,
    signer: Arc<dyn TransactionSigner>,
) -> Vec<Box<dyn Processor>> {
    vec![
        Box::new(AssetMintingRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            AssetMintingRequestHandler,
        )),
        Box::new(UnsignedMintingRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            SignStep::new(signer.clone()),
        )),
        Box::new(SignedMintingRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            BroadcastStep::default(),
        )),
        Box::new(AssetTransferRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            AssetTransferRequestHandler,
        )),
        Box::new(UnsignedAssetTransferRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            SignStep::new(signer),
        )),
        Box::new(SignedAssetTransferRequestProcessor::new(
            daml.clone(),
            topl.clone(),
            BroadcastStep::default(),
        )),
    ]
}

/// Unlocks the keyfile at `path`, which must hold a key for `network`.
fn load_signer(
    path: &std::path::Path,
    password: &str,
    network: Network,
) -> Result<Arc<dyn TransactionSigner>, RunnerError> {
    let signer = Keyfile::load(path)?.unlock(password)?;
    signer.check_network(network)?;
    tracing::info!(address = signer.address(), "keyfile unlocked");
    Ok(Arc::new(signer))
}

/// Resolves `user`'s party and builds both contexts for it.
async fn contexts(
    ledger: Arc<dyn LedgerClient>,
    user: &str,
    app_id: &str,
    provider: Provider,
) -> Result<(DamlAppContext, ToplContext), RunnerError> {
    let party = ledger::primary_party(ledger.as_ref(), user).await?;
    tracing::info!(user, party = %party, network = ?provider.network(), "resolved party");
    let topl_client = Arc::new(JsonRpcClient::new(provider.clone()));
    Ok((
        DamlAppContext::new(app_id, &party, ledger),
        ToplContext::new(provider, topl_client),
    ))
}

/// Completes when `signal` fires. A signal that cannot be installed never fires.
async fn shutdown_on<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!(error = %e, "Ctrl-C handler could not be installed");
        futures::future::pending::<()>().await;
    }
}

/// Subscribes at the ledger end and runs until the stream ends or Ctrl-C.
pub async fn run_subscription(
    ledger: Arc<dyn LedgerClient>,
    party: &str,
    processors: Vec<Box<dyn Processor>>,
) -> Result<(), RunnerError> {
    let mut runner = SubscriptionRunner::<TracingLogger>::new(ledger, party, processors)
        .with_shutdown(shutdown_on(tokio::signal::ctrl_c()));
    runner.run().await
}

pub async fn run_operator(args: OperatorArgs) -> Result<(), RunnerError> {
    let ledger: Arc<dyn LedgerClient> =
        Arc::new(JsonApiClient::new(config::ledger_url(&args.host, args.port)?));
    let provider = Provider::valhalla_test_net(&args.project_id, &args.api_key)?;
    let (daml, topl) = contexts(ledger.clone(), OPERATOR_USER, OPERATOR_APP_ID, provider).await?;
    let processors = operator_processors(&daml, &topl);
    run_subscription(ledger, &daml.operator_party, processors).await
}

pub async fn run_alice(args: AliceArgs) -> Result<(), RunnerError> {
    let provider = Provider::valhalla_test_net(&args.project_id, &args.api_key)?;
    let signer = load_signer(&args.keyfile, &args.password, provider.network())?;
    let ledger: Arc<dyn LedgerClient> =
        Arc::new(JsonApiClient::new(config::ledger_url(&args.host, args.port)?));
    let (daml, topl) = contexts(ledger.clone(), ALICE_USER, ALICE_APP_ID, provider).await?;
    let processors = alice_processors(&daml, &topl, signer);
    run_subscription(ledger, &daml.operator_party, processors).await
}

pub async fn run_asset_operator(args: AssetOperatorArgs) -> Result<(), RunnerError> {
    let provider = Provider::private_test_net(&args.api_key)?;
    let signer = load_signer(&args.keyfile, &args.password, provider.network())?;
    let ledger: Arc<dyn LedgerClient> =
        Arc::new(JsonApiClient::new(config::ledger_url(&args.host, args.port)?));
    let (daml, topl) = contexts(ledger.clone(), OPERATOR_USER, OPERATOR_APP_ID, provider).await?;
    let processors = asset_operator_processors(&daml, &topl, signer);
    run_subscription(ledger, &daml.operator_party, processors).await
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use crate::ledger::{Command, InMemoryLedger, LedgerOffset, User};
    use crate::logger::NoopLogger;
    use crate::processor::fixtures::*;
    use crate::processor::polys::{SignedTransfer, TransferRequest, UnsignedTransfer};
    use crate::processor::Template;
    use crate::signer::seal::{address_for, seal};
    use crate::signer::SignerError;
    use serde_json::json;

    fn names(processors: &[Box<dyn Processor>]) -> Vec<&'static str> {
        processors.iter().map(|p| p.name()).collect()
    }

    #[test]
    fn operator_wires_transfer_and_minting_processors() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        let processors = operator_processors(&harness.daml_context, &harness.topl_context);
        assert_eq!(
            names(&processors),
            vec!["TransferRequest", "SignedTransfer", "AssetMintingRequest"]
        );
    }

    #[test]
    fn alice_wires_the_signing_processor() {
        let harness = harness(ALICE, Behaviour::Accept);
        let processors = alice_processors(&harness.daml_context, &harness.topl_context, signer());
        assert_eq!(names(&processors), vec!["UnsignedTransfer"]);
    }

    #[test]
    fn asset_operator_wires_both_asset_flows_in_order() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        let processors =
            asset_operator_processors(&harness.daml_context, &harness.topl_context, signer());
        assert_eq!(
            names(&processors),
            vec![
                "AssetMintingRequest",
                "UnsignedMinting",
                "SignedMinting",
                "AssetTransferRequest",
                "UnsignedAssetTransfer",
                "SignedAssetTransfer",
            ]
        );
    }

    #[test]
    fn missing_keyfile_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let result = load_signer(&path, "pw", Network::PrivateTestNet);
        assert!(matches!(result, Err(RunnerError::Signer(_))));
    }

    #[test]
    fn keyfile_for_another_network_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.json");
        let keyfile = seal(&address_for(Network::ValhallaTestNet), &[3u8; 32], "pw");
        std::fs::write(&path, serde_json::to_string(&keyfile).unwrap()).unwrap();

        assert!(load_signer(&path, "pw", Network::ValhallaTestNet).is_ok());
        assert!(matches!(
            load_signer(&path, "pw", Network::PrivateTestNet),
            Err(RunnerError::Signer(SignerError::WrongNetwork { .. }))
        ));
    }

    #[tokio::test]
    async fn shutdown_follows_the_signal() {
        let shutdown = shutdown_on(async { Ok(()) });
        assert!(tokio::time::timeout(Duration::from_millis(50), shutdown)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failed_signal_handler_never_shuts_down() {
        let shutdown = shutdown_on(async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal support"))
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), shutdown)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn operator_subscription_answers_each_stage_of_a_transfer() {
        let harness = harness(OPERATOR, Behaviour::Accept);
        harness.ledger.add_user(User {
            id: OPERATOR_USER.to_owned(),
            primary_party: Some(OPERATOR.to_owned()),
        });
        let party = ledger::primary_party(harness.ledger.as_ref(), OPERATOR_USER)
            .await
            .unwrap();
        let fields = json!({
            "operator": OPERATOR,
            "requestor": ALICE,
            "from": ["alice-address"],
            "to": [{"address": "bob-address", "quantity": "100"}],
            "changeAddress": "alice-address",
            "fee": "100"
        });
        let mut signed = fields.clone();
        signed["signedTx"] = json!("{}");
        let mut unsigned = fields.clone();
        unsigned["txToSign"] = json!("{}");
        unsigned["msgToSign"] = json!("");
        harness
            .ledger
            .push_transaction(created(TransferRequest::template_id(), "#1:0", fields));
        harness
            .ledger
            .push_transaction(created(UnsignedTransfer::template_id(), "#2:0", unsigned));
        harness
            .ledger
            .push_transaction(created(SignedTransfer::template_id(), "#3:0", signed));
        harness.ledger.close();

        let processors = operator_processors(&harness.daml_context, &harness.topl_context);
        let mut runner =
            SubscriptionRunner::<NoopLogger>::new(harness.ledger.clone(), &party, processors)
                .starting_at(LedgerOffset::Begin);
        runner.run().await.unwrap();

        assert_eq!(runner.processed(), 3);
        let choices: Vec<String> = harness
            .ledger
            .submissions()
            .iter()
            .flat_map(|s| s.commands.iter())
            .map(|Command::Exercise { choice, .. }| choice.clone())
            .collect();
        assert_eq!(choices, vec!["TransferRequest_Accept", "SignedTransfer_Sent"]);
    }

    #[tokio::test]
    async fn unknown_operator_user_stops_startup() {
        let ledger: Arc<dyn LedgerClient> = Arc::new(InMemoryLedger::default());
        let provider = Provider::private_test_net("").unwrap();
        let result = contexts(ledger, OPERATOR_USER, OPERATOR_APP_ID, provider).await;
        assert!(matches!(
            result,
            Err(RunnerError::Ledger(ledger::LedgerError::UserNotFound(_)))
        ));
    }
}
