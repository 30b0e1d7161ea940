//! Call-log API client: filters, offset pagination and a lazily paged record stream.

use async_trait::async_trait;
use callsync_core::{normalize_phone, CallRecord};
use callsync_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound the call-log API accepts for `limit`.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("call-log API transport failure: {0}")]
    Transport(#[source] FetchError),
    #[error("call-log API rejected credentials (status {status})")]
    Auth { status: u16 },
    #[error("call-log API returned an unreadable payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err.status() {
            Some(status @ (401 | 403)) => Self::Auth { status },
            _ => Self::Transport(err),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFilter {
    pub caller_phone: Option<String>,
    pub require_transcript: bool,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
}

/// Decoded records plus the number of rows the API sent for the page.
/// `row_count` also counts rows dropped during decoding, so pagination can tell
/// a full page from the last one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallPage {
    pub records: Vec<CallRecord>,
    pub row_count: usize,
}

impl From<Vec<CallRecord>> for CallPage {
    fn from(records: Vec<CallRecord>) -> Self {
        Self {
            row_count: records.len(),
            records,
        }
    }
}

/// One page of calls, most recent first.
#[async_trait]
pub trait CallSource: Send + Sync {
    async fn fetch_page(
        &self,
        filter: &CallFilter,
        page: PageRequest,
    ) -> Result<CallPage, SourceError>;
}

struct PageCursor {
    offset: u32,
    remaining: usize,
    exhausted: bool,
}

/// Lazily pages through the source, stopping at `fetch_limit` records or the first short page.
pub fn record_stream<'a, S>(
    source: &'a S,
    filter: &'a CallFilter,
    fetch_limit: usize,
    page_size: u32,
) -> BoxStream<'a, Result<CallRecord, SourceError>>
where
    S: CallSource + ?Sized,
{
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let cursor = PageCursor {
        offset: 0,
        remaining: fetch_limit,
        exhausted: fetch_limit == 0,
    };

    stream::try_unfold(cursor, move |cursor| async move {
        if cursor.exhausted || cursor.remaining == 0 {
            return Ok(None);
        }

        let limit = page_size.min(u32::try_from(cursor.remaining).unwrap_or(u32::MAX));
        let page = PageRequest {
            limit,
            offset: cursor.offset,
        };
        let CallPage {
            mut records,
            row_count,
        } = source.fetch_page(filter, page).await?;
        debug!(
            offset = page.offset,
            limit,
            rows = row_count,
            decoded = records.len(),
            "fetched call-log page"
        );

        let short_page = row_count < limit as usize;
        records.truncate(cursor.remaining);
        let next = PageCursor {
            offset: cursor.offset.saturating_add(limit),
            remaining: cursor.remaining - records.len(),
            exhausted: short_page || row_count == 0,
        };
        Ok::<_, SourceError>(Some((records, next)))
    })
    .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, SourceError>)))
    .try_flatten()
    .boxed()
}

pub async fn fetch_records<S>(
    source: &S,
    filter: &CallFilter,
    fetch_limit: usize,
    page_size: u32,
) -> Result<Vec<CallRecord>, SourceError>
where
    S: CallSource + ?Sized,
{
    record_stream(source, filter, fetch_limit, page_size)
        .try_collect()
        .await
}

/// Query string for the call-log collection endpoint.
pub fn query_params(filter: &CallFilter, page: PageRequest) -> Vec<(String, String)> {
    let mut params = vec![
        ("limit".to_string(), page.limit.clamp(1, MAX_PAGE_SIZE).to_string()),
        ("offset".to_string(), page.offset.to_string()),
        ("sort".to_string(), "-call_date".to_string()),
        ("fields".to_string(), "*.*".to_string()),
    ];
    if let Some(phone) = &filter.caller_phone {
        params.push((
            "filter[caller_phone][_eq]".to_string(),
            normalize_phone(phone),
        ));
    }
    if filter.require_transcript {
        params.push((
            "filter[full_transcript][_nnull]".to_string(),
            "true".to_string(),
        ));
    }
    if let Some(after) = filter.occurred_after {
        params.push(("filter[call_date][_gte]".to_string(), after.to_rfc3339()));
    }
    if let Some(before) = filter.occurred_before {
        params.push(("filter[call_date][_lte]".to_string(), before.to_rfc3339()));
    }
    params
}

#[derive(Debug, Deserialize)]
struct CallLogPage {
    #[serde(default)]
    data: Vec<WireCallRecord>,
}

#[derive(Debug, Deserialize)]
struct WireCallRecord {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(alias = "callId")]
    call_id: Option<String>,
    #[serde(alias = "callDate")]
    call_date: Option<String>,
    #[serde(alias = "durationSeconds")]
    duration: Option<WireNumber>,
    summary: Option<String>,
    #[serde(alias = "transcript")]
    full_transcript: Option<String>,
    #[serde(alias = "callerPhone")]
    caller_phone: Option<WirePhone>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePhone {
    Plain(String),
    Nested { phone_number: Option<String> },
    // unexpanded relation id or anything else we cannot use
    Other(serde_json::Value),
}

impl WirePhone {
    fn into_string(self) -> Option<String> {
        match self {
            Self::Plain(phone) => Some(phone),
            Self::Nested { phone_number } => phone_number,
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Number(f64),
    Text(String),
    Other(serde_json::Value),
}

impl WireNumber {
    fn whole_seconds(&self) -> Option<i64> {
        let value = match self {
            Self::Number(n) => *n,
            Self::Text(raw) => raw.trim().parse::<f64>().ok()?,
            Self::Other(_) => return None,
        };
        value.is_finite().then(|| value.round() as i64)
    }
}

fn parse_call_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Decodes a `{"data": [...]}` page. Records without a call id or a usable date are skipped.
pub fn parse_call_page(body: &[u8]) -> Result<CallPage, SourceError> {
    let page: CallLogPage = serde_json::from_slice(body)?;
    let row_count = page.data.len();
    let mut records = Vec::with_capacity(row_count);

    for wire in page.data {
        let Some(external_call_id) = non_blank(wire.call_id) else {
            warn!(row_id = ?wire.id, "skipping call-log row without call_id");
            continue;
        };
        let Some(occurred_at) = wire.call_date.as_deref().and_then(parse_call_date) else {
            warn!(call_id = %external_call_id, raw = ?wire.call_date, "skipping call-log row with unusable call_date");
            continue;
        };
        let caller_phone = wire
            .caller_phone
            .and_then(WirePhone::into_string)
            .map(|p| normalize_phone(&p))
            .unwrap_or_default();

        records.push(CallRecord {
            external_call_id,
            caller_phone,
            occurred_at,
            duration_seconds: wire
                .duration
                .as_ref()
                .and_then(WireNumber::whole_seconds)
                .unwrap_or(0),
            raw_transcript: non_blank(wire.full_transcript),
            api_summary: non_blank(wire.summary),
        });
    }

    Ok(CallPage { records, row_count })
}

/// Bearer-authenticated client for the `items/call_logs` collection.
#[derive(Debug, Clone)]
pub struct HttpCallSource {
    http: HttpFetcher,
    base_url: String,
    token: String,
}

impl HttpCallSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/items/call_logs", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CallSource for HttpCallSource {
    async fn fetch_page(
        &self,
        filter: &CallFilter,
        page: PageRequest,
    ) -> Result<CallPage, SourceError> {
        let url = self.endpoint();
        let params = query_params(filter, page);
        let resp = self
            .http
            .get_json("call_logs", &url, &params, Some(&self.token))
            .await?;
        parse_call_page(&resp.body)
    }
}
