//! End-to-end tests for the built-in directives, run through a `Service`.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subkit_core::{Schema, Variables};
use subkit_runtime::{
    CompiledSchema, Context, PubSub, PubSubEngine, Request, ResolverMap, Response, RuntimeConfig,
    Service, SubscribeOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A request seen by the stub upstream.
#[derive(Debug, Clone)]
struct Seen {
    line: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Seen {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Serves canned JSON responses over plain HTTP/1.1. `route` maps a request
/// target to a status and a body; writing verbs get their body echoed back.
async fn upstream<F>(route: F) -> (String, Arc<Mutex<Vec<Seen>>>)
where
    F: Fn(&str) -> (u16, Value) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let route = Arc::new(route);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&log);
            let route = Arc::clone(&route);
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
                let mut lines = head.split("\r\n");
                let line = lines.next().unwrap_or_default().to_string();
                let headers: Vec<(String, String)> = lines
                    .filter_map(|l| l.split_once(':'))
                    .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
                    .collect();
                let length = headers
                    .iter()
                    .find(|(n, _)| n == "content-length")
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(0);
                while buffer.len() < head_end + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                }
                let body = String::from_utf8_lossy(&buffer[head_end..]).to_string();

                let target = line.split(' ').nth(1).unwrap_or("/").to_string();
                let (status, payload) = if body.is_empty() {
                    route(&target)
                } else {
                    (200, serde_json::from_str(&body).unwrap_or(Value::Null))
                };
                log.lock().unwrap().push(Seen {
                    line,
                    headers,
                    body,
                });

                let payload = payload.to_string();
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (base, seen)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn service(sdl: &str) -> Service {
    init_tracing();
    let compiled = CompiledSchema::builder(Schema::parse(sdl).unwrap())
        .resolvers(ResolverMap::new())
        .directives(subkit_directives::registry())
        .build()
        .unwrap();
    Service::new(Arc::new(compiled), RuntimeConfig::new())
}

/// `@constant` and its `@mock` alias replace the resolved value.
#[tokio::test]
async fn test_constant_and_mock() {
    let service = service(
        r#"
        type Query {
            greeting: String @constant(value: "hello")
            settings: JSON @mock(value: {theme: "dark", size: 3})
        }
        "#,
    );
    let response = service
        .execute(Request::new("{ greeting settings }"), Context::new())
        .await;

    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({"greeting": "hello", "settings": {"theme": "dark", "size": 3}}))
    );
}

/// `@paged` slices the list produced by the `@constant` declared before it.
#[tokio::test]
async fn test_later_directive_transforms_earlier_value() {
    let service = service(
        r#"
        type Query {
            page: [Int] @constant(value: [1, 2, 3, 4]) @paged(skip: 1, take: 2)
        }
        "#,
    );
    let response = service.execute(Request::new("{ page }"), Context::new()).await;
    assert_eq!(response.data, Some(json!({"page": [2, 3]})));
}

/// A value stored by `@contextify` is visible to later mutation fields.
#[tokio::test]
async fn test_contextify_then_map() {
    let service = service(
        r#"
        type Query { ok: Boolean }
        type Mutation {
            first: String @constant(value: "remembered") @contextify
            second: String @map(jsonQuery: "context.first")
        }
        "#,
    );
    let response = service
        .execute(Request::new("mutation { first second }"), Context::new())
        .await;
    assert_eq!(
        response.data,
        Some(json!({"first": "remembered", "second": "remembered"}))
    );
}

/// `@publish` sends the produced value to the context's bus.
#[tokio::test]
async fn test_publish_reaches_bus() {
    let service = service(
        r#"
        type Query { ok: Boolean }
        type Mutation {
            notify: JSON @constant(value: {headline: "hi"}) @publish(topic: "news")
        }
        "#,
    );
    let bus = Arc::new(PubSub::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(
        "news",
        Arc::new(move |event| -> futures::future::BoxFuture<'static, ()> {
            sink.lock().unwrap().push(event);
            Box::pin(async {})
        }),
        &serde_json::Map::new(),
    )
    .await
    .unwrap();

    let ctx = Context::builder().pubsub(bus).build();
    let response = service.execute(Request::new("mutation { notify }"), ctx).await;
    assert_eq!(response.data, Some(json!({"notify": {"headline": "hi"}})));
    assert_eq!(*seen.lock().unwrap(), vec![json!({"headline": "hi"})]);
}

/// `@getJSON` expands the parent into the URL, forwards headers and applies
/// `jsonQuery`.
#[tokio::test]
async fn test_get_json() {
    let (base, seen) = upstream(|target| match target {
        "/users/7" => (200, json!({"profile": {"name": "Ada"}})),
        _ => (404, json!({})),
    })
    .await;
    let service = service(&format!(
        r#"
        type Query {{
            user: User @constant(value: {{id: "7"}})
        }}
        type User {{
            id: ID
            profile: JSON @getJSON(url: "{base}/users/${{parent.id}}", jsonQuery: "profile")
        }}
        "#
    ));

    let ctx = Context::builder()
        .header("X-Tenant", "acme")
        .header("DNT", "1")
        .build();
    let response = service
        .execute(Request::new("{ user { id profile } }"), ctx)
        .await;

    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({"user": {"id": "7", "profile": {"name": "Ada"}}}))
    );
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].line.starts_with("GET /users/7 "));
    assert_eq!(seen[0].header("x-tenant"), Some("acme"));
    assert_eq!(seen[0].header("content-type"), Some("application/json"));
    assert_eq!(seen[0].header("dnt"), None);
}

/// Error statuses fail the field unless `catch` is set.
#[tokio::test]
async fn test_get_json_error_status() {
    let (base, _) = upstream(|_| (404, json!({"error": "missing"}))).await;
    let service = service(&format!(
        r#"
        type Query {{
            strict: JSON @fetchJSON(url: "{base}/nope")
            lenient: JSON @getJSON(url: "{base}/nope", catch: true)
        }}
        "#
    ));

    let response = service
        .execute(Request::new("{ strict lenient }"), Context::new())
        .await;
    assert_eq!(
        response.data,
        Some(json!({"strict": null, "lenient": null}))
    );
    let errors = response.errors.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "Not Found");
}

/// `@postJSON` sends the `input` argument as the body.
#[tokio::test]
async fn test_post_json_sends_input() {
    let (base, seen) = upstream(|_| (500, Value::Null)).await;
    let service = service(&format!(
        r#"
        type Query {{ ok: Boolean }}
        type Mutation {{
            createUser(input: JSON): JSON @postJSON(url: "{base}/users")
        }}
        "#
    ));

    let response = service
        .execute(
            Request::new(r#"mutation { createUser(input: {name: "Ada"}) }"#),
            Context::new(),
        )
        .await;
    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({"createUser": {"name": "Ada"}}))
    );
    assert!(seen.lock().unwrap()[0].line.starts_with("POST /users "));
}

/// Sibling `@getJSONBatched` fields share one upstream call.
#[tokio::test]
async fn test_get_json_batched() {
    let (base, seen) = upstream(|target| match target {
        "/authors?ids=1,2" => (200, json!([{"name": "Ada"}, {"name": "Grace"}])),
        _ => (404, Value::Null),
    })
    .await;
    let service = service(&format!(
        r#"
        type Query {{
            posts: [Post] @constant(value: [{{authorId: "1"}}, {{authorId: "2"}}, {{authorId: "1"}}])
        }}
        type Post {{
            authorId: ID
            author: JSON @getJSONBatched(url: "{base}/authors?ids=${{ids}}", ids: "authorId")
        }}
        "#
    ));

    let response = service
        .execute(Request::new("{ posts { author } }"), Context::new())
        .await;
    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({"posts": [
            {"author": {"name": "Ada"}},
            {"author": {"name": "Grace"}},
            {"author": {"name": "Ada"}},
        ]}))
    );
    assert_eq!(seen.lock().unwrap().len(), 1);
}

/// `@execute` runs a command and `@executeBatched` runs one command for all
/// sibling keys.
#[tokio::test]
async fn test_execute_directives() {
    let service = service(
        r#"
        type Query {
            answer: Int @execute(cmd: "echo '{\"value\": 42}'", jsonQuery: "value")
            items: [Item] @constant(value: [{n: 3}, {n: 5}])
        }
        type Item {
            n: Int
            echoed: Int @executeBatched(cmd: "echo '[${ids}]'", ids: "n")
        }
        "#,
    );

    let response = service
        .execute(Request::new("{ answer items { echoed } }"), Context::new())
        .await;
    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({"answer": 42, "items": [{"echoed": 3}, {"echoed": 5}]}))
    );
}

/// Values substituted into a command reach it as one argument each.
#[tokio::test]
async fn test_execute_quotes_substituted_values() {
    let service = service(
        r#"
        type Query {
            greet(name: String): String @execute(cmd: "echo hello ${args.name}")
            quoted(name: String): String @execute(cmd: "echo \"hi ${args.name}\"")
        }
        "#,
    );
    let mut variables = Variables::new();
    variables.insert("name".to_string(), json!("bob; echo INJECTED"));
    variables.insert("other".to_string(), json!("$(echo INJECTED)"));

    let response = service
        .execute(
            Request::new(
                "query($name: String, $other: String) { greet(name: $name) quoted(name: $other) }",
            )
            .variables(variables),
            Context::new(),
        )
        .await;
    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({
            "greet": "hello bob; echo INJECTED",
            "quoted": "hi $(echo INJECTED)",
        }))
    );
}

/// Aliases of a batched field with different arguments load separately.
#[tokio::test]
async fn test_execute_batched_aliases_keep_their_arguments() {
    let service = service(
        r#"
        type Query {
            items: [Item] @constant(value: [{id: 1}])
        }
        type Item {
            id: ID
            label(prefix: String): String @executeBatched(cmd: "echo '[\"${args.prefix}\"]'", ids: "id")
        }
        "#,
    );
    let response = service
        .execute(
            Request::new(r#"{ items { x: label(prefix: "X") y: label(prefix: "Y") } }"#),
            Context::new(),
        )
        .await;
    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(response.data, Some(json!({"items": [{"x": "X", "y": "Y"}]})));
}

/// Results of fields with a `maxAge` hint are reused across requests.
#[tokio::test]
async fn test_response_cache_honors_max_age() {
    let counter = std::env::temp_dir().join(format!("subkit-counter-{}", std::process::id()));
    let _ = std::fs::remove_file(&counter);
    let bump = format!(
        "n=$(cat {path} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {path}; echo $n",
        path = counter.display()
    );
    let service = service(&format!(
        r#"
        type Query {{
            cached: Int @execute(cmd: "{bump}") @cacheControl(maxAge: 60)
            fresh: Int @execute(cmd: "{bump}")
        }}
        "#
    ));

    let mut seen = Vec::new();
    for query in ["{ cached }", "{ cached }", "{ fresh }"] {
        let response = service.execute(Request::new(query), Context::new()).await;
        assert!(response.errors.is_none(), "{:?}", response.errors);
        seen.push(response.data.unwrap());
    }
    let _ = std::fs::remove_file(&counter);

    assert_eq!(
        seen,
        vec![json!({"cached": 1}), json!({"cached": 1}), json!({"fresh": 2})]
    );
}

/// `@mapInput` sets a property of the `input` argument.
#[tokio::test]
async fn test_map_input() {
    let service = service(
        r#"
        type Query { ok: Boolean }
        type Mutation {
            createUser(input: JSON): JSON @mapInput(to: "role", from: "member") @map(jsonQuery: "data.input")
        }
        "#,
    );
    let response = service
        .execute(
            Request::new(r#"mutation { createUser(input: {name: "Ada"}) }"#),
            Context::new(),
        )
        .await;
    assert!(response.errors.is_none(), "{:?}", response.errors);
    assert_eq!(
        response.data,
        Some(json!({"createUser": {"name": "Ada", "role": "member"}}))
    );
}

type Events = mpsc::UnboundedReceiver<Response>;

fn subscription(query: &str, ctx: Context) -> (SubscribeOptions, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = SubscribeOptions::new(query, move |result| {
        let _ = tx.send(result.unwrap());
    })
    .context(ctx);
    (options, rx)
}

async fn next_event(events: &mut Events) -> Value {
    let response = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event in time")
        .expect("subscription closed");
    assert!(response.errors.is_none(), "{:?}", response.errors);
    response.data.unwrap()
}

/// `@subscribe` listens on its topic and projects each payload.
#[tokio::test]
async fn test_subscribe_directive() {
    let service = service(
        r#"
        type Query { ok: Boolean }
        type Subscription {
            headline: String @subscribe(topic: "news", jsonQuery: "title")
        }
        "#,
    );
    let bus = Arc::new(PubSub::new());
    let manager = service.subscription_manager(bus.clone());
    let (options, mut events) = subscription("subscription { headline }", Context::new());

    manager.subscribe(options).await.unwrap();
    assert!(bus.has_subscribers("news").await);
    assert!(!bus.has_subscribers("headline").await);

    bus.publish("news", Value::Null).await.unwrap();
    bus.publish("news", json!({"title": "hi"})).await.unwrap();
    assert_eq!(next_event(&mut events).await, json!({"headline": "hi"}));
    assert!(events.try_recv().is_err());
}

/// `@spawn` streams the process output and a closing event.
#[tokio::test]
async fn test_spawn_directive() {
    let service = service(
        r#"
        type Query { ok: Boolean }
        type Subscription {
            job: JSON @spawn(cmd: "echo '{\"step\": 1}'; echo done")
        }
        "#,
    );
    let manager = service.subscription_manager(Arc::new(PubSub::new()));
    let (options, mut events) = subscription("subscription { job }", Context::new());
    manager.subscribe(options).await.unwrap();

    let first = next_event(&mut events).await;
    assert_eq!(first["job"]["data"], json!({"step": 1}));
    let second = next_event(&mut events).await;
    assert_eq!(second["job"]["data"], json!("done"));
    let close = next_event(&mut events).await;
    assert_eq!(close["job"]["close"], json!(true));
    assert_eq!(close["job"]["code"], json!(0));
    assert_eq!(close["job"]["data"], json!("done"));
    assert_eq!(close["job"]["topic"], first["job"]["topic"]);
}

/// `@eventsource` publishes every non-empty server-sent event.
#[tokio::test]
async fn test_eventsource_directive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buffer).to_string();
        let authorization = head
            .split("\r\n")
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .map(|(_, value)| value.trim().to_string());
        let _ = auth_tx.send(authorization);

        let body = "data: {\"n\": 1}\n\ndata: {}\n\n: keep-alive\n\ndata: {\"n\": 2}\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{body}"
        );
        let _ = socket.write_all(response.as_bytes()).await;
        // keep the stream open until the events are read
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = socket.shutdown().await;
    });

    let service = service(&format!(
        r#"
        type Query {{ ok: Boolean }}
        type Subscription {{
            ticks: JSON @eventsource(topic: "ticks", url: "{base}/events", jwt: "pass")
        }}
        "#
    ));
    let manager = service.subscription_manager(Arc::new(PubSub::new()));
    let ctx = Context::builder().header("Authorization", "Bearer abc").build();
    let (options, mut events) = subscription("subscription { ticks }", ctx);
    manager.subscribe(options).await.unwrap();

    assert_eq!(next_event(&mut events).await, json!({"ticks": {"n": 1}}));
    assert_eq!(next_event(&mut events).await, json!({"ticks": {"n": 2}}));
    assert_eq!(auth_rx.recv().await.unwrap().as_deref(), Some("Bearer abc"));
}
