//! PostgREST-style HTTP implementation of [`RemoteBackend`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{RemoteBackend, RemoteError, RemoteFilter, RemoteResult, SelectQuery};
use crate::auth::SessionProvider;
use crate::config::RemoteConfig;
use crate::util::compact_text;

const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=representation";

#[derive(Clone)]
pub struct RestBackend {
    config: RemoteConfig,
    client: reqwest::Client,
    session: Arc<dyn SessionProvider>,
}

impl RestBackend {
    pub fn new(config: RemoteConfig, session: Arc<dyn SessionProvider>) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            session,
        })
    }

    fn collection_url(&self, collection: &str) -> RemoteResult<String> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(format!("{}/rest/v1/{collection}", self.config.base_url))
        } else {
            Err(RemoteError::InvalidConfiguration(format!(
                "invalid collection name '{collection}'"
            )))
        }
    }

    /// Attach the API key and the signed-in user's token
    async fn authorized(&self, request: RequestBuilder) -> RemoteResult<RequestBuilder> {
        let session = self
            .session
            .current_session()
            .await
            .ok_or(RemoteError::NotAuthenticated)?;
        Ok(request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&session.access_token)
            .header("Accept", "application/json"))
    }

    async fn send(request: RequestBuilder) -> RemoteResult<Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: status.as_u16(),
            message: parse_api_error(status, &body),
        })
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn upsert(&self, collection: &str, record: Value) -> RemoteResult<Value> {
        let url = self.collection_url(collection)?;
        let request = self
            .authorized(
                self.client
                    .post(url)
                    .header("Prefer", UPSERT_PREFER)
                    .json(&record),
            )
            .await?;

        let response = Self::send(request).await?;
        match response.json::<Value>().await? {
            Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
            Value::Object(row) => Ok(Value::Object(row)),
            other => Err(RemoteError::Decode(format!(
                "upsert into {collection} returned no row: {}",
                compact_text(&other.to_string())
            ))),
        }
    }

    async fn delete(&self, collection: &str, filter: &RemoteFilter) -> RemoteResult<()> {
        let url = self.collection_url(collection)?;
        let request = self
            .authorized(self.client.delete(url).query(&[filter.to_query_pair()]))
            .await?;
        Self::send(request).await?;
        Ok(())
    }

    async fn select(&self, collection: &str, query: &SelectQuery) -> RemoteResult<Vec<Value>> {
        let url = self.collection_url(collection)?;
        let request = self
            .authorized(self.client.get(url).query(&select_params(query)))
            .await?;

        let response = Self::send(request).await?;
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn probe(&self) -> RemoteResult<()> {
        let response = self
            .client
            .get(format!("{}/rest/v1/", self.config.base_url))
            .header("apikey", &self.config.api_key)
            .send()
            .await?;
        if response.status().is_server_error() {
            return Err(RemoteError::Unavailable(format!(
                "probe returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(query.filters.iter().map(RemoteFilter::to_query_pair));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|(column, ascending)| {
                let direction = if *ascending { "asc" } else { "desc" };
                format!("{column}.{direction}")
            })
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    error: Option<String>,
    hint: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return match payload.hint {
                Some(hint) => format!("{} ({})", message.trim(), compact_text(&hint)),
                None => message.trim().to_string(),
            };
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSession, AuthUser, SharedSession};
    use crate::remote::wire::WireRecord;
    use crate::util::now_utc;

    fn backend(session: Option<AuthSession>) -> RestBackend {
        let config = RemoteConfig::new("https://api.example.com/", "anon-key").unwrap();
        RestBackend::new(config, Arc::new(SharedSession::new(session))).unwrap()
    }

    #[test]
    fn select_params_follow_postgrest_syntax() {
        let query = SelectQuery::new()
            .filter(RemoteFilter::gt("updated_at", "2025-01-01T00:00:00.000000Z"))
            .order_ascending("updated_at")
            .order_ascending("id")
            .limit(100)
            .offset(200);
        assert_eq!(
            select_params(&query),
            vec![
                ("select".to_string(), "*".to_string()),
                (
                    "updated_at".to_string(),
                    "gt.2025-01-01T00:00:00.000000Z".to_string()
                ),
                ("order".to_string(), "updated_at.asc,id.asc".to_string()),
                ("limit".to_string(), "100".to_string()),
                ("offset".to_string(), "200".to_string()),
            ]
        );
    }

    #[test]
    fn collection_url_rejects_path_injection() {
        let backend = backend(None);
        assert_eq!(
            backend.collection_url("visits").unwrap(),
            "https://api.example.com/rest/v1/visits"
        );
        assert!(backend.collection_url("visits/../users").is_err());
        assert!(backend.collection_url("").is_err());
    }

    #[test]
    fn api_error_prefers_message_field() {
        assert_eq!(
            parse_api_error(
                StatusCode::BAD_REQUEST,
                r#"{"message":"duplicate key","hint":"check id"}"#
            ),
            "duplicate key (check id)"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "  "),
            "HTTP 502"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_without_session_are_rejected() {
        let backend = backend(None);
        let result = backend
            .select("visits", &SelectQuery::new().limit(1))
            .await;
        assert!(matches!(result, Err(RemoteError::NotAuthenticated)));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "Requires WANDER_API_URL, WANDER_API_KEY and WANDER_TEST_ACCESS_TOKEN plus network access"]
    async fn live_backend_select_and_probe() {
        let _ = dotenvy::dotenv();

        let config = RemoteConfig::from_env()
            .expect("remote env parsing should not error")
            .expect("remote config should be present");
        let token = std::env::var("WANDER_TEST_ACCESS_TOKEN")
            .expect("WANDER_TEST_ACCESS_TOKEN should be set");
        let session = AuthSession {
            access_token: token,
            expires_at: now_utc().timestamp() + 3_600,
            user: AuthUser {
                id: "integration".to_string(),
                email: None,
            },
        };
        let backend = RestBackend::new(config, Arc::new(SharedSession::new(Some(session))))
            .expect("client should build");

        backend
            .probe()
            .await
            .unwrap_or_else(|error| panic!("probe failed: {error}"));

        let rows = backend
            .select("visits", &SelectQuery::new().limit(5))
            .await
            .unwrap_or_else(|error| panic!("select failed: {error}"));
        for row in rows {
            crate::models::Visit::from_wire(row)
                .unwrap_or_else(|error| panic!("row failed to decode: {error}"));
        }
    }
}
