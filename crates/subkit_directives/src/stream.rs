//! Directives that feed subscription root fields.
//!
//! Each one is a [`SubscriptionSource`]: it names the topics a subscription
//! listens on and may start a producer publishing to them. On the field
//! itself the directive resolves to the event payload.

use crate::common::{field_directive, named, project, required};
use crate::error::DirectiveError;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use subkit_core::DirectiveDefinition;
use subkit_runtime::{
    Context, DirectiveHandler, Next, PubSubEngine, ResolverArgs, ResolverFuture, ResolverInfo,
    SubscriptionSource, Trigger, TriggerMap,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// One topic whose null events are dropped.
fn topic_trigger(topic: String) -> TriggerMap {
    TriggerMap::from([(
        topic,
        Trigger::new().with_filter(|payload, _| !payload.is_null()),
    )])
}

fn topic_argument(args: &ResolverArgs) -> Result<String, String> {
    args.require::<String>("topic").map_err(|e| e.to_string())
}

/// Publishes `event`, returning whether anyone still listens on `topic`.
async fn publish(bus: &dyn PubSubEngine, topic: &str, event: Value) -> bool {
    match bus.publish(topic, event).await {
        Ok(0) => {
            debug!(topic, "no listeners left");
            false
        }
        Ok(_) => true,
        Err(e) => {
            warn!(topic, error = %e, "failed to publish stream event");
            false
        }
    }
}

/// `@subscribe(topic: String!, jsonQuery: String)`: listens on `topic` of
/// the bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct Subscribe;

impl Subscribe {
    pub fn definition() -> DirectiveDefinition {
        field_directive("subscribe", "Subscribe to events of the in-process bus.")
            .with_argument("topic", required("String"))
            .with_argument("jsonQuery", named("String"))
    }
}

impl DirectiveHandler for Subscribe {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        args: ResolverArgs,
        _ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            next.run().await?;
            Ok(project(parent.clone(), &args)?)
        })
    }

    fn subscription_source(&self) -> Option<&dyn SubscriptionSource> {
        Some(self)
    }
}

impl SubscriptionSource for Subscribe {
    fn triggers(&self, args: &ResolverArgs, _ctx: &Context) -> TriggerMap {
        topic_argument(args).map(topic_trigger).unwrap_or_default()
    }

    fn start(
        &self,
        args: &ResolverArgs,
        _ctx: &Context,
        _triggers: &TriggerMap,
        _bus: Arc<dyn PubSubEngine>,
    ) -> Result<(), String> {
        topic_argument(args).map(|_| ())
    }
}

/// `@spawn(cmd: String!, catch: Boolean)`: runs `cmd` for each subscription
/// and streams its output.
///
/// Every stdout line is published as `{data, topic}`, parsed as JSON when
/// possible, and every stderr line as `{error, topic}`. When the process
/// exits a final `{code, data, error, close: true, topic}` carries its exit
/// code and last lines. The process is killed once nobody listens.
#[derive(Debug, Default)]
pub struct Spawn {
    next_topic: AtomicU64,
}

impl Spawn {
    pub fn definition() -> DirectiveDefinition {
        field_directive("spawn", "Spawn a process and stream its output.")
            .with_argument("cmd", required("String"))
            .with_argument("catch", named("Boolean"))
    }
}

impl DirectiveHandler for Spawn {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        _args: ResolverArgs,
        _ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            next.run().await?;
            Ok(parent.clone())
        })
    }

    fn subscription_source(&self) -> Option<&dyn SubscriptionSource> {
        Some(self)
    }
}

impl SubscriptionSource for Spawn {
    fn triggers(&self, _args: &ResolverArgs, _ctx: &Context) -> TriggerMap {
        let id = self.next_topic.fetch_add(1, Ordering::Relaxed);
        topic_trigger(format!("spawn-{id}"))
    }

    fn start(
        &self,
        args: &ResolverArgs,
        _ctx: &Context,
        triggers: &TriggerMap,
        bus: Arc<dyn PubSubEngine>,
    ) -> Result<(), String> {
        let cmd: String = args.require("cmd").map_err(|e| e.to_string())?;
        let topic = triggers
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| "no topic to publish process output on".to_string())?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DirectiveError::Spawn(e).to_string())?;
        debug!(%cmd, %topic, "spawned process");
        tokio::spawn(stream_process(child, topic, bus));
        Ok(())
    }
}

fn parse_output(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

async fn stream_process(mut child: Child, topic: String, bus: Arc<dyn PubSubEngine>) {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return;
    };
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let (mut stdout_open, mut stderr_open) = (true, true);
    let mut data = Value::Null;
    let mut error = Value::Null;

    while stdout_open || stderr_open {
        let event = tokio::select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => {
                    data = parse_output(&line);
                    Some(json!({"data": data, "topic": topic}))
                }
                _ => {
                    stdout_open = false;
                    None
                }
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => {
                    error = Value::String(line);
                    Some(json!({"error": error, "topic": topic}))
                }
                _ => {
                    stderr_open = false;
                    None
                }
            },
        };
        let Some(event) = event else {
            continue;
        };
        if !publish(bus.as_ref(), &topic, event).await {
            return;
        }
    }

    let code = match child.wait().await {
        Ok(status) => status.code().map_or(Value::Null, Value::from),
        Err(e) => {
            warn!(%topic, error = %e, "failed to wait for process");
            Value::Null
        }
    };
    debug!(%topic, %code, "process exited");
    let close = json!({
        "code": code,
        "data": data,
        "error": error,
        "close": true,
        "topic": topic,
    });
    publish(bus.as_ref(), &topic, close).await;
}

/// `@eventsource(topic: String!, url: String!, jwt: String)`: reads the
/// server-sent events at `url` and publishes each one on `topic`.
///
/// `jwt` is sent as a bearer token; `jwt: "pass"` forwards the incoming
/// request's authorization instead. Events are JSON; empty ones are dropped
/// and unparseable ones are published as `{error}`.
#[derive(Debug, Clone)]
pub struct EventSource {
    client: Client,
}

impl EventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn definition() -> DirectiveDefinition {
        field_directive("eventsource", "Subscribe to a server-sent event stream.")
            .with_argument("topic", required("String"))
            .with_argument("url", required("String"))
            .with_argument("jwt", named("String"))
    }

    fn request(&self, args: &ResolverArgs, ctx: &Context) -> Result<RequestBuilder, String> {
        let url: String = args.require("url").map_err(|e| e.to_string())?;
        let request = self.client.get(url).header(ACCEPT, "text/event-stream");
        let token = match args.get_str("jwt") {
            Some("pass") => ctx
                .header("authorization")
                .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).to_string()),
            Some(jwt) if !jwt.is_empty() => Some(jwt.to_string()),
            _ => None,
        };
        Ok(match token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        })
    }
}

impl DirectiveHandler for EventSource {
    fn resolve<'a>(
        &'a self,
        next: Next<'a>,
        parent: &'a Value,
        _args: ResolverArgs,
        _ctx: &'a Context,
        _info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        Box::pin(async move {
            next.run().await?;
            Ok(parent.clone())
        })
    }

    fn subscription_source(&self) -> Option<&dyn SubscriptionSource> {
        Some(self)
    }
}

impl SubscriptionSource for EventSource {
    fn triggers(&self, args: &ResolverArgs, _ctx: &Context) -> TriggerMap {
        topic_argument(args).map(topic_trigger).unwrap_or_default()
    }

    fn start(
        &self,
        args: &ResolverArgs,
        ctx: &Context,
        _triggers: &TriggerMap,
        bus: Arc<dyn PubSubEngine>,
    ) -> Result<(), String> {
        let topic = topic_argument(args)?;
        let request = self.request(args, ctx)?;
        tokio::spawn(async move {
            if let Err(e) = stream_events(request, &topic, bus).await {
                warn!(%topic, error = %e, "event stream ended");
            }
        });
        Ok(())
    }
}

async fn stream_events(
    request: RequestBuilder,
    topic: &str,
    bus: Arc<dyn PubSubEngine>,
) -> Result<(), DirectiveError> {
    let mut response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DirectiveError::EventStream(status.to_string()));
    }
    debug!(topic, "event stream opened");

    let mut parser = EventStreamParser::default();
    while let Some(chunk) = response.chunk().await? {
        for data in parser.push(&String::from_utf8_lossy(&chunk)) {
            let Some(event) = event_payload(&data) else {
                continue;
            };
            if !publish(bus.as_ref(), topic, event).await {
                return Ok(());
            }
        }
    }
    debug!(topic, "event stream closed");
    Ok(())
}

/// The payload published for one event's data.
fn event_payload(data: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::Null) => None,
        Ok(Value::Object(map)) if map.is_empty() => None,
        Ok(Value::Array(items)) if items.is_empty() => None,
        Ok(value) => Some(value),
        Err(e) => Some(json!({"error": e.to_string()})),
    }
}

/// Splits a `text/event-stream` body into the data of its events.
#[derive(Debug, Default)]
struct EventStreamParser {
    buffer: String,
}

impl EventStreamParser {
    /// Appends a chunk and returns the data of every event it completes.
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}
