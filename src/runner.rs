use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::ledger::{LedgerClient, LedgerError, LedgerOffset, TransactionFilter};
use crate::logger::Logger;
use crate::processor::Processor;
use crate::signer::SignerError;
use crate::topl::ToplError;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Ledger(#[from] LedgerError),
    #[error("{0}")]
    Topl(#[from] ToplError),
    #[error("{0}")]
    Signer(#[from] SignerError),
}

#[async_trait]
pub trait Runner {
    async fn run(&mut self) -> Result<(), RunnerError>;
}

pub type Shutdown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Feeds one party's transaction stream through a list of processors.
///
/// A single subscription is shared: every transaction is offered to every
/// processor, in the order the processors were given.
pub struct SubscriptionRunner<L: Logger> {
    client: Arc<dyn LedgerClient>,
    party: String,
    begin: LedgerOffset,
    processors: Vec<Box<dyn Processor>>,
    shutdown: Shutdown,
    logger: L,
    processed: u64,
}

impl<L: Logger + Default> SubscriptionRunner<L> {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        party: &str,
        processors: Vec<Box<dyn Processor>>,
    ) -> Self {
        Self {
            client,
            party: party.to_owned(),
            begin: LedgerOffset::End,
            processors,
            shutdown: Box::pin(futures::future::pending::<()>()),
            logger: L::default(),
            processed: 0,
        }
    }
}

impl<L: Logger> SubscriptionRunner<L> {
    /// Where the subscription starts; the ledger end unless told otherwise.
    pub fn starting_at(mut self, begin: LedgerOffset) -> Self {
        self.begin = begin;
        self
    }

    /// Stops the run once `shutdown` completes.
    pub fn with_shutdown<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Box::pin(shutdown);
        self
    }

    /// Transactions seen so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

#[async_trait]
impl<L: Logger + Send + Sync> Runner for SubscriptionRunner<L> {
    async fn run(&mut self) -> Result<(), RunnerError> {
        let filter = TransactionFilter::for_party(&self.party);
        let mut transactions = self
            .client
            .transactions(self.begin.clone(), filter, true)
            .await?;
        self.logger.info(format!(
            "Subscribed to transactions of {} with {} processor(s)",
            self.party,
            self.processors.len()
        ));

        loop {
            let next = tokio::select! {
                next = transactions.next() => next,
                _ = &mut self.shutdown => {
                    self.logger.info("Shutdown requested".to_owned());
                    break;
                }
            };
            let tx = match next {
                None => break,
                Some(result) => result?,
            };
            self.processed += 1;

            let mut keep_going = true;
            for processor in &self.processors {
                match processor.process_transaction(&tx).await {
                    Ok(true) => {}
                    Ok(false) => keep_going = false,
                    Err(e) => self.logger.error(format!(
                        "{} failed on transaction {}: {}",
                        processor.name(),
                        tx.transaction_id,
                        e
                    )),
                }
            }
            if !keep_going {
                self.logger.info(format!(
                    "A processor asked to stop after transaction {}",
                    tx.transaction_id
                ));
                break;
            }
        }

        self.logger.info(format!(
            "Subscription ended after {} transaction(s)",
            self.processed
        ));
        Ok(())
    }
}
