//! Request-handling entry point: authorizes the caller, picks the credential, fans searches
//! out over all partitions and relays everything else to the engine unchanged.

use std::sync::Arc;

use futures::future::try_join_all;
use hyper::Method;
use serde_json::{Map, Value, json};

use crate::auth::{Authorizer, Caller};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::keys::ApiKeys;
use crate::merge::merge_responses;
use crate::request::{RequestVariant, split_request};
use crate::sync::SyncCommand;
use crate::upstream::{API_KEY_PARAM, SearchBackend, UpstreamRequest, UpstreamResponse};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Inbound request as forwarded by the host application.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// Engine path relative to its root, e.g. `multi_search`.
    pub path: String,
    /// Decoded query string parameters, in order.
    pub query: Vec<(String, String)>,
    /// Raw request body, empty when none.
    pub body: Vec<u8>,
    /// Identity of the caller.
    pub caller: Caller,
}

/// Response relayed to the caller. Only the content type is kept of the upstream headers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    /// HTTP status.
    pub status: u16,
    /// `Content-Type` of the body.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Vec<u8>,
}

impl ProxyResponse {
    fn json(status: u16, value: &Value) -> Result<ProxyResponse> {
        Ok(ProxyResponse {
            status,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body: serde_json::to_vec(value)?,
        })
    }

    fn from_upstream(response: UpstreamResponse) -> ProxyResponse {
        ProxyResponse {
            status: response.status,
            content_type: response.content_type,
            body: response.body,
        }
    }

    /// Error as seen by the caller: upstream failures verbatim, everything else as `{"message": ..}`.
    pub fn from_error(error: ProxyError) -> ProxyResponse {
        let status = error.status_code().as_u16();
        match error {
            ProxyError::Upstream {
                status,
                content_type,
                body,
            } => ProxyResponse {
                status,
                content_type,
                body,
            },
            other => ProxyResponse {
                status,
                content_type: Some(JSON_CONTENT_TYPE.to_string()),
                body: json!({ "message": other.to_string() }).to_string().into_bytes(),
            },
        }
    }
}

/// Kind of engine path being proxied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPath {
    /// `multi_search`.
    MultiSearch,
    /// `collections/<collection>/documents/search`, or any path ending in `search`.
    Search {
        /// Collection named in the path, if any.
        collection: Option<String>,
    },
    /// `sync` command.
    Sync,
    /// Any other engine path.
    Passthrough,
}

/// Classify a path relative to the engine root.
pub fn classify_path(path: &str) -> ProxyPath {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["multi_search"] => ProxyPath::MultiSearch,
        ["sync"] => ProxyPath::Sync,
        ["collections", collection, "documents", "search"] => ProxyPath::Search {
            collection: Some(collection.to_string()),
        },
        [.., "search"] => ProxyPath::Search { collection: None },
        _ => ProxyPath::Passthrough,
    }
}

/// Drop any caller supplied credential parameter and append the resolved one.
fn with_api_key(query: &[(String, String)], api_key: &str) -> Vec<(String, String)> {
    let mut query: Vec<(String, String)> = query
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(API_KEY_PARAM))
        .cloned()
        .collect();
    query.push((API_KEY_PARAM.to_string(), api_key.to_string()));
    query
}

/// Add the query string parameters, except the credential, to a search object.
/// Parameters already present in the body win.
fn fold_query(search: &mut Map<String, Value>, query: &[(String, String)]) {
    for (name, value) in query
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(API_KEY_PARAM))
    {
        search
            .entry(name.clone())
            .or_insert_with(|| Value::String(value.clone()));
    }
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Orchestrates authorization, credential choice, fan-out and merge.
pub struct Proxy<B: SearchBackend> {
    config: Arc<ProxyConfig>,
    backend: B,
    keys: ApiKeys,
    authorizer: Box<dyn Authorizer>,
}

impl<B: SearchBackend> Proxy<B> {
    /// Proxy over `backend`, gated by `authorizer`.
    pub fn new(config: Arc<ProxyConfig>, backend: B, authorizer: Box<dyn Authorizer>) -> Self {
        let keys = ApiKeys::from_config(&config);
        Proxy {
            config,
            backend,
            keys,
            authorizer,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Transport towards the engine.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Handle one inbound request. Never fails: errors become error responses.
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let method = request.method.clone();
        let path = request.path.clone();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => {
                match &error {
                    ProxyError::Upstream { status, .. } => {
                        tracing::debug!("{} {} relayed upstream status {}", method, path, status)
                    }
                    ProxyError::InconsistentPartitions(_) | ProxyError::Transport(_) => {
                        tracing::error!("{} {} failed: {}", method, path, error)
                    }
                    _ => tracing::debug!("{} {} rejected: {}", method, path, error),
                }
                ProxyResponse::from_error(error)
            }
        }
    }

    async fn dispatch(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        self.authorizer.authorize(&request.caller)?;

        match classify_path(&request.path) {
            ProxyPath::MultiSearch | ProxyPath::Search { .. } if self.config.num_partitions == 1 => {
                let api_key = self.keys.search_key().await?;
                self.forward(request, &api_key).await
            }
            ProxyPath::MultiSearch => self.multi_search(request).await,
            ProxyPath::Search { collection } => self.single_search(request, collection).await,
            ProxyPath::Sync if request.method == Method::POST => self.sync(request).await,
            ProxyPath::Sync | ProxyPath::Passthrough => {
                self.forward(request, self.keys.admin_key()).await
            }
        }
    }

    async fn multi_search(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        if request.body.is_empty() {
            return Err(ProxyError::MalformedRequest(
                "multi search body is empty".to_string(),
            ));
        }
        let mut logical: Value = serde_json::from_slice(&request.body)?;
        // query string parameters are shared defaults of every search
        if matches!(logical.get("searches"), Some(Value::Array(_))) {
            if let Some(Value::Array(searches)) = logical.get_mut("searches") {
                for search in searches.iter_mut() {
                    if let Value::Object(search) = search {
                        fold_query(search, &request.query);
                    }
                }
            }
        } else if let Value::Object(search) = &mut logical {
            fold_query(search, &request.query);
        }

        self.fan_out(&logical, |variant, api_key| {
            Ok(UpstreamRequest {
                method: Method::POST,
                path: request.path.clone(),
                query: with_api_key(&[], api_key),
                body: Some(serde_json::to_vec(&variant.request)?),
                api_key: api_key.to_string(),
            })
        })
        .await
    }

    /// Single searches are sent as GET with their parameters in the query string.
    async fn single_search(
        &self,
        request: ProxyRequest,
        collection: Option<String>,
    ) -> Result<ProxyResponse> {
        let mut search = if request.body.is_empty() {
            Map::new()
        } else {
            match serde_json::from_slice::<Value>(&request.body)? {
                Value::Object(object) => object,
                _ => {
                    return Err(ProxyError::MalformedRequest(
                        "search body must be a JSON object".to_string(),
                    ));
                }
            }
        };
        fold_query(&mut search, &request.query);
        if let Some(collection) = &collection {
            search
                .entry("collection")
                .or_insert_with(|| Value::String(collection.clone()));
        }
        let logical = Value::Object(search);
        let fallback_path = request.path.clone();

        self.fan_out(&logical, |variant, api_key| {
            let shard_collection = variant.request.get("collection").and_then(Value::as_str);
            let path = match (&collection, shard_collection) {
                (Some(_), Some(shard_collection)) => {
                    format!("collections/{shard_collection}/documents/search")
                }
                _ => fallback_path.clone(),
            };
            let params: Vec<(String, String)> = variant
                .request
                .as_object()
                .map(|object| {
                    object
                        .iter()
                        .filter(|(name, _)| name.as_str() != "collection" || collection.is_none())
                        .map(|(name, value)| (name.clone(), param_text(value)))
                        .collect()
                })
                .unwrap_or_default();
            Ok(UpstreamRequest {
                method: Method::GET,
                path,
                query: with_api_key(&params, api_key),
                body: None,
                api_key: api_key.to_string(),
            })
        })
        .await
    }

    /// Split `logical` over all partitions, run the shard requests concurrently and merge.
    /// The first failing shard aborts the others and its response is returned as is.
    async fn fan_out<F>(&self, logical: &Value, build: F) -> Result<ProxyResponse>
    where
        F: Fn(&RequestVariant, &str) -> Result<UpstreamRequest>,
    {
        let split = split_request(logical, &self.config.layout())?;
        let api_key = self.keys.search_key().await?;
        let requests = split
            .variants
            .iter()
            .map(|variant| build(variant, &api_key))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("dispatching search to {} partitions", requests.len());

        let responses =
            try_join_all(requests.into_iter().enumerate().map(|(shard, request)| async move {
                let response = self.backend.call(request).await?;
                if response.is_success() {
                    Ok(response)
                } else {
                    tracing::warn!("partition {} answered with status {}", shard, response.status);
                    Err(response.into_error())
                }
            }))
            .await?;

        let partials = responses
            .iter()
            .enumerate()
            .map(|(shard, response)| {
                serde_json::from_slice::<Value>(&response.body).map_err(|e| {
                    ProxyError::InconsistentPartitions(format!(
                        "partition {shard} returned invalid JSON: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let merged = merge_responses(&split.originals, split.multi, &partials)?;
        ProxyResponse::json(200, &merged)
    }

    /// Single call with `api_key` in place of any caller credential; the response is relayed as is.
    async fn forward(&self, request: ProxyRequest, api_key: &str) -> Result<ProxyResponse> {
        let response = self
            .backend
            .call(UpstreamRequest {
                method: request.method,
                path: request.path,
                query: with_api_key(&request.query, api_key),
                body: (!request.body.is_empty()).then_some(request.body),
                api_key: api_key.to_string(),
            })
            .await?;
        Ok(ProxyResponse::from_upstream(response))
    }

    /// Execute a sync command. A delete fanned out over all partitions succeeds
    /// when any partition accepted it.
    async fn sync(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let command = SyncCommand::from_slice(&request.body)?;
        let calls = command.plan(&self.config.layout())?;
        let api_key = self.keys.admin_key();

        let mut first_failure = None;
        for call in calls {
            let response = self
                .backend
                .call(UpstreamRequest {
                    method: call.method,
                    path: call.path,
                    query: with_api_key(&call.query, api_key),
                    body: call.body,
                    api_key: api_key.to_string(),
                })
                .await?;
            if response.is_success() {
                tracing::info!("sync {} applied", command_action(&command));
                return Ok(ProxyResponse::from_upstream(response));
            }
            first_failure.get_or_insert(response);
        }

        Err(first_failure
            .map(UpstreamResponse::into_error)
            .unwrap_or_else(|| ProxyError::MalformedRequest("sync command has no target".to_string())))
    }
}

fn command_action(command: &SyncCommand) -> &'static str {
    match command {
        SyncCommand::Upsert { .. } => "upsert",
        SyncCommand::Delete { .. } => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        assert_eq!(classify_path("multi_search"), ProxyPath::MultiSearch);
        assert_eq!(classify_path("/multi_search/"), ProxyPath::MultiSearch);
        assert_eq!(
            classify_path("collections/books/documents/search"),
            ProxyPath::Search {
                collection: Some("books".to_string())
            }
        );
        assert_eq!(classify_path("search"), ProxyPath::Search { collection: None });
        assert_eq!(classify_path("collections/books"), ProxyPath::Passthrough);
        assert_eq!(classify_path("sync"), ProxyPath::Sync);
    }

    #[test]
    fn api_key_is_overridden() {
        let query = vec![
            ("q".to_string(), "x".to_string()),
            ("X-TYPESENSE-API-KEY".to_string(), "injected".to_string()),
        ];
        let query = with_api_key(&query, "resolved");
        assert_eq!(
            query,
            vec![
                ("q".to_string(), "x".to_string()),
                (API_KEY_PARAM.to_string(), "resolved".to_string())
            ]
        );
    }

    #[test]
    fn body_parameters_win_over_query() {
        let mut search = json!({"q": "dune", "per_page": 5}).as_object().unwrap().clone();
        let query = vec![
            ("per_page".to_string(), "50".to_string()),
            ("filter_by".to_string(), "year:>2000".to_string()),
            ("X-TYPESENSE-API-KEY".to_string(), "caller".to_string()),
        ];
        fold_query(&mut search, &query);
        assert_eq!(
            Value::Object(search),
            json!({"q": "dune", "per_page": 5, "filter_by": "year:>2000"})
        );
    }

    #[test]
    fn error_responses() {
        let response = ProxyResponse::from_error(ProxyError::Forbidden);
        assert_eq!(response.status, 403);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "forbidden");

        let relayed = ProxyResponse::from_error(ProxyError::Upstream {
            status: 404,
            content_type: Some("text/plain".to_string()),
            body: b"nope".to_vec(),
        });
        assert_eq!(relayed.status, 404);
        assert_eq!(relayed.content_type.as_deref(), Some("text/plain"));
        assert_eq!(relayed.body, b"nope".to_vec());
    }
}
