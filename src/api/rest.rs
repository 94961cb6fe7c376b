//! HTTP implementation of the REST collaborators

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, ApiResult, GroupDirectory, HistoryService, KeyDirectory};
use crate::crypto::{Jwk, PublicKey};
use crate::protocol::{ChatRecord, GroupRecord};

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the key directory, history and roster endpoints
#[derive(Clone, Debug)]
pub struct RestClient {
    base: Url,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishKeyRequest<'a> {
    user_id: &'a str,
    public_key: Jwk,
}

impl RestClient {
    /// Client rooted at `base_url` (for example `https://chat.example/api`)
    pub fn new(base_url: &str) -> ApiResult<Self> {
        let base = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            base,
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> ApiResult<Option<Value>> {
        debug!(%url, "GET");
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ApiError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map(Some)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn get_list(&self, url: Url) -> ApiResult<Vec<Value>> {
        match self.get_json(url).await? {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(ApiError::Decode(format!("expected a list, got {other}"))),
        }
    }
}

#[async_trait]
impl KeyDirectory for RestClient {
    async fn fetch_public_key(&self, user: &str) -> ApiResult<Option<PublicKey>> {
        match self.get_json(self.endpoint(&["keys", user])?).await? {
            None => Ok(None),
            Some(body) => parse_key_body(body).map(Some),
        }
    }

    async fn publish_public_key(&self, user: &str, key: &PublicKey) -> ApiResult<()> {
        let url = self.endpoint(&["keys"])?;
        let response = self
            .client
            .post(url.clone())
            .json(&PublishKeyRequest {
                user_id: user,
                public_key: key.to_jwk(),
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryService for RestClient {
    async fn direct_history(&self, own: &str, peer: &str) -> ApiResult<Vec<ChatRecord>> {
        let items = self.get_list(self.endpoint(&["messages", own, peer])?).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| match ChatRecord::from_value(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(peer, error = %e, "dropping history record");
                    None
                }
            })
            .collect())
    }

    async fn group_history(&self, group: &str) -> ApiResult<Vec<GroupRecord>> {
        let items = self.get_list(self.endpoint(&["groups", group, "messages"])?).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| match GroupRecord::from_value(item) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(group, error = %e, "dropping group history record");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl GroupDirectory for RestClient {
    async fn group_members(&self, group: &str) -> ApiResult<Vec<String>> {
        let items = self.get_list(self.endpoint(&["groups", group, "members"])?).await?;
        Ok(items
            .iter()
            .filter_map(|item| {
                let id = member_id(item);
                if id.is_none() {
                    warn!(group, member = %item, "dropping unrecognised roster member");
                }
                id
            })
            .collect())
    }
}

/// A key response is a bare JWK, `{"publicKey": <jwk>}`, or
/// `{"publicKey": "<jwk as a JSON string>"}`
fn parse_key_body(body: Value) -> ApiResult<PublicKey> {
    let jwk = match body {
        Value::Object(mut fields) if !fields.contains_key("kty") => match fields.remove("publicKey") {
            Some(Value::String(encoded)) => serde_json::from_str::<Value>(&encoded)
                .map_err(|e| ApiError::Decode(e.to_string()))?,
            Some(inner) => inner,
            None => return Err(ApiError::Decode("missing publicKey".into())),
        },
        other => other,
    };
    let jwk: Jwk = serde_json::from_value(jwk).map_err(|e| ApiError::Decode(e.to_string()))?;
    PublicKey::from_jwk(&jwk).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Members come as plain ids or as user objects
fn member_id(item: &Value) -> Option<String> {
    match item {
        Value::String(id) => Some(id.clone()),
        Value::Object(fields) => ["userId", "id", "username"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str).map(str::to_string)),
        _ => None,
    }
}
