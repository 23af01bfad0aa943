//! Offset/limit pagination over list endpoints.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{ApiRequest, Client, Error};

/// Page size for enveloped lists when the caller passes `limit <= 0`.
pub const DEFAULT_DATA_LIMIT: i64 = 1000;

/// Page size for bare-array lists when the caller passes `limit <= 0`.
pub const DEFAULT_PAGE_LIMIT: i64 = 100;

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Vec<Map<String, Value>>>,
}

fn empty_response() -> Error {
    Error::Protocol("unexpected empty response".into())
}

/// Items of a `{"data": [...], "metadata": {...}}` page.
fn enveloped(body: Value) -> Result<Vec<Value>, Error> {
    let envelope: Option<Envelope> = serde_json::from_value(body)?;
    let data = envelope.and_then(|e| e.data).ok_or_else(empty_response)?;
    Ok(data.into_iter().map(Value::Object).collect())
}

/// Items of a page answered as a bare JSON array.
fn bare(body: Value) -> Result<Vec<Value>, Error> {
    match body {
        Value::Null => Err(empty_response()),
        other => Ok(serde_json::from_value(other)?),
    }
}

impl Client {
    /// Fetches an enveloped list.
    ///
    /// `offset < 0` walks every page from 0 until a short page; `offset >= 0`
    /// fetches exactly that page. `limit <= 0` means [`DEFAULT_DATA_LIMIT`].
    /// The pages are decoded into `T` in one pass at the end.
    pub async fn data_call<T: DeserializeOwned>(
        &self,
        username: &str,
        req: &ApiRequest,
        offset: i64,
        limit: i64,
    ) -> Result<T, Error> {
        self.paginate(username, req, offset, limit, DEFAULT_DATA_LIMIT, enveloped)
            .await
    }

    /// Like [`data_call`](Self::data_call) for endpoints that answer with a
    /// bare array; `limit <= 0` means [`DEFAULT_PAGE_LIMIT`].
    pub async fn page_call<T: DeserializeOwned>(
        &self,
        username: &str,
        req: &ApiRequest,
        offset: i64,
        limit: i64,
    ) -> Result<T, Error> {
        self.paginate(username, req, offset, limit, DEFAULT_PAGE_LIMIT, bare)
            .await
    }

    async fn paginate<T: DeserializeOwned>(
        &self,
        username: &str,
        req: &ApiRequest,
        offset: i64,
        limit: i64,
        default_limit: i64,
        items_of: fn(Value) -> Result<Vec<Value>, Error>,
    ) -> Result<T, Error> {
        let limit = if limit <= 0 { default_limit } else { limit };
        let walk = offset < 0;
        let mut offset = offset.max(0);
        let mut items = Vec::new();

        loop {
            let page_req = req.clone().query([("limit", limit), ("offset", offset)]);
            let body: Value = self.call(username, &page_req).await?;
            let page = items_of(body)?;
            let count = page.len();
            items.extend(page);
            debug!(user = username, path = %req.path, offset, count, "fetched page");

            if !walk || (count as i64) < limit {
                break;
            }
            offset += limit;
        }

        Ok(serde_json::from_value(Value::Array(items))?)
    }
}
