//! Directives that call JSON HTTP endpoints.

use crate::cache::{CacheSlot, ResponseCache};
use crate::common::{
    align, batch_key, expand_data, expand_ids, field_directive, named, project, required, timeout,
};
use crate::error::DirectiveError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use subkit_core::DirectiveDefinition;
use subkit_runtime::{
    Context, DataLoader, DirectiveHandler, LoadError, Next, ResolverArgs, ResolverFuture,
    ResolverInfo,
};
use tracing::debug;

/// Incoming headers that are never forwarded upstream.
const DROPPED_HEADERS: [&str; 8] = [
    "host",
    "pragma",
    "connection",
    "content-length",
    "cache-control",
    "origin",
    "dnt",
    "accept",
];

/// HTTP verbs with a JSON directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 5] = [Verb::Get, Verb::Post, Verb::Put, Verb::Patch, Verb::Delete];

    pub fn method(self) -> Method {
        match self {
            Verb::Get => Method::GET,
            Verb::Post => Method::POST,
            Verb::Put => Method::PUT,
            Verb::Patch => Method::PATCH,
            Verb::Delete => Method::DELETE,
        }
    }

    pub fn directive_name(self) -> &'static str {
        match self {
            Verb::Get => "getJSON",
            Verb::Post => "postJSON",
            Verb::Put => "putJSON",
            Verb::Patch => "patchJSON",
            Verb::Delete => "deleteJSON",
        }
    }

    fn sends_body(self) -> bool {
        !matches!(self, Verb::Get)
    }
}

/// One outgoing call.
#[derive(Debug)]
struct Call<'a> {
    verb: Verb,
    url: &'a str,
    headers: HeaderMap,
    body: Option<&'a Value>,
    timeout: Option<Duration>,
}

impl Call<'_> {
    async fn send(self, client: &Client) -> Result<Value, DirectiveError> {
        debug!(method = %self.verb.method(), url = self.url, "sending request");
        let mut request = client.request(self.verb.method(), self.url).headers(self.headers);
        if let Some(body) = self.body {
            request = request.json(body);
        }
        if let Some(limit) = self.timeout {
            request = request.timeout(limit);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(DirectiveError::Status {
                status: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string(),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Headers for an upstream call: the incoming request headers without the
/// dropped ones, overlaid with the `headers` argument and a JSON content type.
pub fn forward_headers(ctx: &Context, args: &ResolverArgs) -> Result<HeaderMap, DirectiveError> {
    let mut merged: Vec<(String, String)> = ctx
        .headers()
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if let Some(Value::Object(extra)) = args.get("headers") {
        for (name, value) in extra {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            merged.push((name.to_ascii_lowercase(), value));
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in merged {
        if DROPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| DirectiveError::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(&value).map_err(|_| DirectiveError::InvalidHeader(name.clone()))?;
        headers.insert(header, value);
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// The body sent by writing verbs: the value's `input`, else the `input`
/// argument, else the value itself.
fn body<'v>(data: &'v Value, args: &'v ResolverArgs) -> &'v Value {
    [data.get("input"), args.get("input")]
        .into_iter()
        .flatten()
        .find(|value| !value.is_null())
        .unwrap_or(data)
}

fn with_http_arguments(definition: DirectiveDefinition) -> DirectiveDefinition {
    definition
        .with_argument("url", required("String"))
        .with_argument("jsonQuery", named("String"))
        .with_argument("timeout", named("Int"))
        .with_argument("headers", named("JSON"))
        .with_argument("catch", named("Boolean"))
}

/// Swallows the error into null when `catch: true` was given.
fn caught(
    result: Result<Value, DirectiveError>,
    args: &ResolverArgs,
) -> Result<Value, DirectiveError> {
    match result {
        Err(e) if args.get_as::<bool>("catch").unwrap_or(false) => {
            debug!(error = %e, "request failed, resolving to null");
            Ok(Value::Null)
        }
        other => other,
    }
}

/// `@getJSON`, `@postJSON`, `@putJSON`, `@patchJSON` and `@deleteJSON`
/// `(url: String!, jsonQuery: String, timeout: Int, headers: JSON, catch: Boolean)`.
///
/// GET responses of fields with a `maxAge` hint are served from the cache.
#[derive(Debug, Clone)]
pub struct HttpJson {
    verb: Verb,
    client: Client,
    cache: Arc<ResponseCache>,
}

impl HttpJson {
    pub fn new(verb: Verb, client: Client) -> Self {
        Self {
            verb,
            client,
            cache: Arc::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn definition(&self) -> DirectiveDefinition {
        with_http_arguments(field_directive(
            self.verb.directive_name(),
            "Call a JSON HTTP endpoint.",
        ))
    }

    async fn call(
        &self,
        url: &str,
        data: &Value,
        args: &ResolverArgs,
        ctx: &Context,
        info: &ResolverInfo,
    ) -> Result<Value, DirectiveError> {
        let url = expand_data(url, data)?;
        let slot = match self.verb {
            Verb::Get => CacheSlot::for_call(info, ctx, args, &url)
                .map(|slot| slot.part(&info.path.to_string())),
            _ => None,
        };
        self.cache
            .through(slot, async {
                let call = Call {
                    verb: self.verb,
                    url: &url,
                    headers: forward_headers(ctx, args)?,
                    body: self.verb.sends_body().then(|| body(data, args)),
                    timeout: timeout(args),
                };
                let value = call.send(&self.client).await?;
                Ok(project(value, args)?)
            })
            .await
    }
}

impl DirectiveHandler for HttpJson {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        _parent: &'a Value,
        args: ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            let data = next.run().await?;
            let url: String = args.require("url")?;
            let result = self.call(&url, &data, &args, ctx, info).await;
            Ok(caught(result, &args)?)
        })
    }
}

/// `@getJSONBatched(url: String!, ids: String!, ...)`: one GET for the keys
/// of all sibling resolutions, `${ids}` being the comma-separated keys. The
/// response must be a list with one entry per key, in key order.
/// Resolutions of the same field with different arguments batch separately.
#[derive(Debug, Clone)]
pub struct GetJsonBatched {
    client: Client,
    cache: Arc<ResponseCache>,
}

impl GetJsonBatched {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Arc::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn definition() -> DirectiveDefinition {
        with_http_arguments(field_directive(
            "getJSONBatched",
            "Call a JSON HTTP endpoint once for a batch of keys.",
        ))
        .with_argument("ids", required("String"))
    }
}

impl DirectiveHandler for GetJsonBatched {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        args: ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            next.run().await?;
            let Some(key) = batch_key(parent, &args.require::<String>("ids")?) else {
                return Ok(Value::Null);
            };

            let url: String = args.require("url")?;
            let headers = forward_headers(ctx, &args)?;
            let memo_key = format!(
                "fetch-batched:{}.{}:{}",
                info.parent_type,
                info.field_name,
                args.to_json()
            );
            let slot = CacheSlot::for_call(info, ctx, &args, &url);
            let loader = ctx.memo(&memo_key, || {
                let client = self.client.clone();
                let cache = Arc::clone(&self.cache);
                let args = Arc::new(args.clone());
                DataLoader::new(move |keys: Vec<String>| {
                    let client = client.clone();
                    let cache = Arc::clone(&cache);
                    let slot = slot.clone();
                    let url = url.clone();
                    let headers = headers.clone();
                    let args = Arc::clone(&args);
                    async move {
                        cache
                            .through_batch(slot.as_ref(), keys, |keys| {
                                fetch_batch(&client, &url, headers, &args, keys)
                            })
                            .await
                            .map_err(|e| LoadError::Batch(e.to_string()))
                    }
                })
            });

            let result = loader
                .load(key)
                .await
                .map(|value| value.unwrap_or(Value::Null))
                .map_err(DirectiveError::from);
            Ok(caught(result, &args)?)
        })
    }
}

async fn fetch_batch(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    args: &ResolverArgs,
    keys: Vec<String>,
) -> Result<FxHashMap<String, Value>, DirectiveError> {
    let url = expand_ids(url, &keys)?;
    let call = Call {
        verb: Verb::Get,
        url: &url,
        headers,
        body: None,
        timeout: timeout(args),
    };
    let value = project(call.send(client).await?, args)?;
    align(keys, value)
}
