use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use super::{
    LedgerClient, LedgerError, LedgerOffset, SubmitRequest, Transaction, TransactionFilter,
    TransactionStream, User,
};

/// A ledger held in memory.
///
/// Subscriptions replay the matching part of the log and then follow
/// live appends until [`InMemoryLedger::close`] is called.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    transactions: Vec<Transaction>,
    submissions: Vec<SubmitRequest>,
    subscribers: Vec<(TransactionFilter, UnboundedSender<Transaction>)>,
    closed: bool,
}

/// The part of `tx` visible under `filter`, if any.
fn visible(tx: &Transaction, filter: &TransactionFilter) -> Option<Transaction> {
    let events: Vec<_> = tx
        .events
        .iter()
        .filter(|event| filter.admits(event))
        .cloned()
        .collect();
    if events.is_empty() {
        return None;
    }
    Some(Transaction {
        events,
        ..tx.clone()
    })
}

impl InMemoryLedger {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_user(&self, user: User) {
        let _ = self.inner().users.insert(user.id.clone(), user);
    }

    /// Appends a transaction, assigning the next offset when it has none.
    pub fn push_transaction(&self, mut tx: Transaction) {
        let mut inner = self.inner();
        if tx.offset.is_empty() {
            tx.offset = format!("{:016}", inner.transactions.len() + 1);
        }
        inner
            .subscribers
            .retain(|(filter, sender)| match visible(&tx, filter) {
                Some(view) => sender.unbounded_send(view).is_ok(),
                None => !sender.is_closed(),
            });
        inner.transactions.push(tx);
    }

    /// Ends every live subscription once it has drained.
    pub fn close(&self) {
        let mut inner = self.inner();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.inner().submissions.clone()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_user(&self, user_id: &str) -> Result<User, LedgerError> {
        self.inner()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_owned()))
    }

    async fn ledger_end(&self) -> Result<String, LedgerError> {
        Ok(self
            .inner()
            .transactions
            .last()
            .map(|tx| tx.offset.clone())
            .unwrap_or_default())
    }

    async fn transactions(
        &self,
        begin: LedgerOffset,
        filter: TransactionFilter,
        _verbose: bool,
    ) -> Result<TransactionStream, LedgerError> {
        let mut inner = self.inner();
        let skip = match begin {
            LedgerOffset::Begin => 0,
            LedgerOffset::End => inner.transactions.len(),
            LedgerOffset::Absolute(offset) => {
                match inner.transactions.iter().position(|tx| tx.offset == offset) {
                    Some(index) => index + 1,
                    None => return Err(LedgerError::UnknownOffset(offset)),
                }
            }
        };
        let replay: Vec<Transaction> = inner.transactions[skip..]
            .iter()
            .filter_map(|tx| visible(tx, &filter))
            .collect();
        let replay = futures::stream::iter(replay);
        if inner.closed {
            return Ok(Box::pin(replay.map(Ok::<_, LedgerError>)));
        }
        let (sender, receiver) = unbounded();
        inner.subscribers.push((filter, sender));
        Ok(Box::pin(replay.chain(receiver).map(Ok::<_, LedgerError>)))
    }

    async fn submit_and_wait(&self, request: SubmitRequest) -> Result<(), LedgerError> {
        self.inner().submissions.push(request);
        Ok(())
    }
}
