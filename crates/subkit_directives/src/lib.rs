//! Built-in schema directives for SubKit.
//!
//! [`registry`] returns every directive of the catalogue ready to hand to a
//! [`CompiledSchemaBuilder`](subkit_runtime::CompiledSchemaBuilder):
//!
//! - values: `@constant` (alias `@mock`), `@log`, `@paged`, `@map`,
//!   `@mapInput`, `@contextify`, `@publish`
//! - processes: `@execute`, `@executeBatched`
//! - HTTP: `@getJSON` (alias `@fetchJSON`), `@postJSON`, `@putJSON`,
//!   `@patchJSON`, `@deleteJSON`, `@getJSONBatched`
//! - subscription sources: `@subscribe`, `@spawn`, `@eventsource`
//!
//! String arguments are templates. `${parent...}`, `${args...}`,
//! `${context...}`, `${user...}` and `${variables...}` are expanded before the
//! handler runs; `${data...}` reads the value produced by the rest of the
//! chain and `${ids}` the keys of a batched call. In `cmd` every substituted
//! value is shell-quoted.
//!
//! Process results and GET responses of fields with a `maxAge` cache hint are
//! kept in a [`ResponseCache`] shared by the registry.

pub mod cache;
mod common;
pub mod error;
pub mod http;
pub mod process;
pub mod shell;
pub mod stream;
pub mod value;

pub use cache::{CacheSlot, ResponseCache};
pub use error::DirectiveError;
pub use http::{forward_headers, GetJsonBatched, HttpJson, Verb};
pub use process::{run_command, Execute, ExecuteBatched};
pub use stream::{EventSource, Spawn, Subscribe};
pub use value::{Constant, Contextify, Log, MapInput, MapValue, Paged, Publish};

use std::sync::Arc;
use subkit_runtime::DirectiveRegistry;

/// The full catalogue with a default HTTP client.
pub fn registry() -> DirectiveRegistry {
    registry_with_client(reqwest::Client::new())
}

/// The full catalogue sharing `client` for every HTTP directive.
pub fn registry_with_client(client: reqwest::Client) -> DirectiveRegistry {
    registry_with(client, Arc::new(ResponseCache::default()))
}

/// The full catalogue sharing `client` and `cache`.
pub fn registry_with(client: reqwest::Client, cache: Arc<ResponseCache>) -> DirectiveRegistry {
    let mut registry = DirectiveRegistry::new()
        .with(Constant::definition(), Constant)
        .with(Log::definition(), Log)
        .with(Paged::definition(), Paged)
        .with(MapValue::definition(), MapValue)
        .with(MapInput::definition(), MapInput)
        .with(Contextify::definition(), Contextify)
        .with(Publish::definition(), Publish)
        .with(Execute::definition(), Execute::new(Arc::clone(&cache)))
        .with(
            ExecuteBatched::definition(),
            ExecuteBatched::new(Arc::clone(&cache)),
        )
        .with(
            GetJsonBatched::definition(),
            GetJsonBatched::new(client.clone()).with_cache(Arc::clone(&cache)),
        )
        .with(Subscribe::definition(), Subscribe)
        .with(Spawn::definition(), Spawn::default())
        .with(EventSource::definition(), EventSource::new(client.clone()));

    for verb in Verb::ALL {
        let handler = HttpJson::new(verb, client.clone()).with_cache(Arc::clone(&cache));
        registry.register(handler.definition(), Arc::new(handler));
    }

    registry
        .alias("mock", "constant")
        .alias("fetchJSON", "getJSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = registry();
        for name in [
            "constant",
            "mock",
            "log",
            "paged",
            "map",
            "mapInput",
            "contextify",
            "publish",
            "execute",
            "executeBatched",
            "getJSON",
            "fetchJSON",
            "postJSON",
            "putJSON",
            "patchJSON",
            "deleteJSON",
            "getJSONBatched",
            "subscribe",
            "spawn",
            "eventsource",
        ] {
            assert!(registry.contains(name), "missing @{name}");
        }
        assert_eq!(registry.len(), 20);
        assert!(registry
            .get("mock")
            .unwrap()
            .definition
            .arguments
            .contains_key("value"));
    }
}
