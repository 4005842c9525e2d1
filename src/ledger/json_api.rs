use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{
    offset_string, Filter, LedgerClient, LedgerError, LedgerOffset, SubmitRequest, Transaction,
    TransactionFilter, TransactionStream, User,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PAGE_SIZE: u32 = 100;

/// Client for the ledger node's HTTP JSON API.
///
/// The transaction subscription is a poll loop over `/v2/updates/flats`
/// that always resumes after the last offset it handed out.
#[derive(Clone, Debug)]
pub struct JsonApiClient {
    http: reqwest::Client,
    base_url: Url,
    poll_interval: Duration,
    page_size: u32,
}

#[derive(Deserialize)]
struct UserResponse {
    user: User,
}

#[derive(Deserialize)]
struct LedgerEndResponse {
    #[serde(deserialize_with = "offset_string")]
    offset: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdatesRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    begin_exclusive: Option<&'a str>,
    filter: WireFilter,
    verbose: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireFilter {
    filters_by_party: HashMap<String, WirePartyFilter>,
}

#[derive(Serialize)]
struct WirePartyFilter {
    cumulative: Vec<Value>,
}

impl From<&TransactionFilter> for WireFilter {
    fn from(filter: &TransactionFilter) -> Self {
        let filters_by_party = filter
            .filters_by_party
            .iter()
            .map(|(party, filter)| {
                let cumulative = match filter {
                    Filter::NoFilter => vec![],
                    Filter::Templates(templates) => templates
                        .iter()
                        .map(|t| serde_json::json!({ "templateId": t.to_string() }))
                        .collect(),
                };
                (party.clone(), WirePartyFilter { cumulative })
            })
            .collect();
        Self { filters_by_party }
    }
}

/// One entry of an updates page. Entries other than transactions still
/// carry an offset the subscription must move past.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateItem {
    #[serde(default)]
    transaction: Option<Transaction>,
    #[serde(default)]
    offset_checkpoint: Option<Positioned>,
    #[serde(default)]
    reassignment: Option<Positioned>,
}

#[derive(Deserialize)]
struct OffsetOnly {
    #[serde(deserialize_with = "offset_string")]
    offset: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Positioned {
    Wrapped { value: OffsetOnly },
    Bare(OffsetOnly),
}

impl Positioned {
    fn offset(&self) -> &str {
        match self {
            Positioned::Wrapped { value } => &value.offset,
            Positioned::Bare(bare) => &bare.offset,
        }
    }
}

impl UpdateItem {
    fn offset(&self) -> Option<&str> {
        self.transaction
            .as_ref()
            .map(|tx| tx.offset.as_str())
            .or_else(|| self.offset_checkpoint.as_ref().map(Positioned::offset))
            .or_else(|| self.reassignment.as_ref().map(Positioned::offset))
    }
}

/// Transactions of one page, and the offset to resume after.
struct Page {
    transactions: Vec<Transaction>,
    last_offset: Option<String>,
}

struct Subscription {
    client: JsonApiClient,
    filter: TransactionFilter,
    verbose: bool,
    offset: Option<String>,
    buffer: VecDeque<Transaction>,
}

impl JsonApiClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, LedgerError> {
        self.base_url
            .join(path)
            .map_err(|e| LedgerError::Decode(format!("bad endpoint {}: {}", path, e)))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, LedgerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LedgerError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch_updates(
        &self,
        begin_exclusive: Option<&str>,
        filter: &TransactionFilter,
        verbose: bool,
    ) -> Result<Page, LedgerError> {
        let mut url = self.endpoint("v2/updates/flats")?;
        url.query_pairs_mut()
            .append_pair("limit", &self.page_size.to_string());
        let request = UpdatesRequest {
            begin_exclusive,
            filter: filter.into(),
            verbose,
        };
        let response = self.http.post(url).json(&request).send().await?;
        let items: Vec<UpdateItem> = Self::check(response).await?.json().await?;
        let last_offset = items
            .iter()
            .filter_map(UpdateItem::offset)
            .last()
            .map(str::to_owned);
        Ok(Page {
            transactions: items.into_iter().filter_map(|item| item.transaction).collect(),
            last_offset,
        })
    }
}

#[async_trait]
impl LedgerClient for JsonApiClient {
    async fn get_user(&self, user_id: &str) -> Result<User, LedgerError> {
        let url = self.endpoint(&format!("v2/users/{}", user_id))?;
        let response = self.http.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::UserNotFound(user_id.to_owned()));
        }
        let body: UserResponse = Self::check(response).await?.json().await?;
        Ok(body.user)
    }

    async fn ledger_end(&self) -> Result<String, LedgerError> {
        let url = self.endpoint("v2/state/ledger-end")?;
        let response = self.http.get(url).send().await?;
        let body: LedgerEndResponse = Self::check(response).await?.json().await?;
        Ok(body.offset)
    }

    async fn transactions(
        &self,
        begin: LedgerOffset,
        filter: TransactionFilter,
        verbose: bool,
    ) -> Result<TransactionStream, LedgerError> {
        // `End` is pinned once so that later polls do not skip anything.
        let offset = match begin {
            LedgerOffset::Begin => None,
            LedgerOffset::End => Some(self.ledger_end().await?),
            LedgerOffset::Absolute(offset) => Some(offset),
        };
        let subscription = Subscription {
            client: self.clone(),
            filter,
            verbose,
            offset,
            buffer: VecDeque::new(),
        };
        let stream = futures::stream::try_unfold(subscription, |mut sub| async move {
            loop {
                if let Some(tx) = sub.buffer.pop_front() {
                    return Ok::<_, LedgerError>(Some((tx, sub)));
                }
                let page = sub
                    .client
                    .fetch_updates(sub.offset.as_deref(), &sub.filter, sub.verbose)
                    .await?;
                let advanced = page.last_offset.is_some() && page.last_offset != sub.offset;
                if advanced {
                    sub.offset = page.last_offset;
                }
                sub.buffer.extend(page.transactions);
                // Idle until the ledger moves.
                if sub.buffer.is_empty() && !advanced {
                    tokio::time::sleep(sub.client.poll_interval).await;
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn submit_and_wait(&self, request: SubmitRequest) -> Result<(), LedgerError> {
        let url = self.endpoint("v2/commands/submit-and-wait")?;
        let response = self.http.post(url).json(&request).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}
