//! Per-field resolver timing.

use super::{Extension, FieldCallback};
use crate::context::Context;
use crate::resolver::{ResolverArgs, ResolverInfo};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use subkit_core::ResponsePath;

/// Timing of one field resolution, in nanoseconds from request start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverTrace {
    pub path: ResponsePath,
    pub parent_type: String,
    pub field_name: String,
    pub return_type: String,
    pub score: Option<u64>,
    #[serde(rename = "startOffset_ns")]
    pub start_offset: u64,
    #[serde(rename = "duration_ns")]
    pub duration: u64,
}

#[derive(Debug, Default)]
struct Clock {
    start: Option<(Instant, DateTime<Utc>)>,
    end: Option<(Instant, DateTime<Utc>)>,
}

/// Records start offset and duration of every field resolution.
#[derive(Debug, Default)]
pub struct TracingExtension {
    clock: Mutex<Clock>,
    resolvers: Arc<Mutex<Vec<ResolverTrace>>>,
}

impl TracingExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// The records collected so far, in completion order.
    pub fn resolvers(&self) -> Vec<ResolverTrace> {
        self.resolvers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn started(&self) -> Instant {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.start.get_or_insert_with(|| (Instant::now(), Utc::now())).0
    }
}

fn nanos(from: Instant, to: Instant) -> u64 {
    u64::try_from(to.saturating_duration_since(from).as_nanos()).unwrap_or(u64::MAX)
}

impl Extension for TracingExtension {
    fn request_did_start(&self) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.start = Some((Instant::now(), Utc::now()));
        clock.end = None;
    }

    fn will_resolve_field(
        &self,
        _parent: &Value,
        _args: &ResolverArgs,
        _ctx: &Context,
        info: &ResolverInfo,
    ) -> Option<FieldCallback> {
        let request_start = self.started();
        let field_start = Instant::now();
        let mut record = ResolverTrace {
            path: info.path.clone(),
            parent_type: info.parent_type.clone(),
            field_name: info.field_name.clone(),
            return_type: info.return_type.to_string(),
            score: info.score,
            start_offset: nanos(request_start, field_start),
            duration: 0,
        };
        let sink = Arc::clone(&self.resolvers);

        Some(Box::new(move |_result| {
            record.duration = nanos(field_start, Instant::now());
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record);
        }))
    }

    fn request_did_end(&self) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.end = Some((Instant::now(), Utc::now()));
    }

    fn format(&self) -> Option<(String, Value)> {
        let (start, end) = {
            let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            let start = clock.start?;
            (start, clock.end.unwrap_or_else(|| (Instant::now(), Utc::now())))
        };

        Some((
            "trace".to_string(),
            json!({
                "startTime": start.1.to_rfc3339_opts(SecondsFormat::Millis, true),
                "endTime": end.1.to_rfc3339_opts(SecondsFormat::Millis, true),
                "duration_ns": nanos(start.0, end.0),
                "resolvers": self.resolvers(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::ExtensionStack;
    use subkit_core::TypeRef;

    #[test]
    fn test_records_field_timing() {
        let tracing = Arc::new(TracingExtension::new());
        let mut stack = ExtensionStack::new();
        stack.push(Arc::clone(&tracing));

        stack.request_did_start();
        let ctx = Context::new();
        let mut info = ResolverInfo::new("name", "User")
            .with_return_type(TypeRef::non_null(TypeRef::named("String")))
            .with_path(ResponsePath::root().child("me").child("name"));
        info.score = Some(1);
        stack
            .will_resolve_field(&Value::Null, &ResolverArgs::new(), &ctx, &info)
            .complete(None);
        stack.request_did_end();

        let records = tracing.resolvers();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].return_type, "String!");
        assert_eq!(records[0].score, Some(1));

        let (key, value) = tracing.format().unwrap();
        assert_eq!(key, "trace");
        assert_eq!(value["resolvers"][0]["path"], json!(["me", "name"]));
        assert_eq!(value["resolvers"][0]["parentType"], "User");
        assert!(value["resolvers"][0]["startOffset_ns"].is_u64());
        assert!(value["resolvers"][0]["duration_ns"].is_u64());
        assert!(value["duration_ns"].is_u64());
        assert!(value["startTime"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_no_fragment_before_start() {
        assert!(TracingExtension::new().format().is_none());
    }
}
