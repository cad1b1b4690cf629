//! Directives that run shell commands.

use crate::cache::{CacheSlot, ResponseCache};
use crate::common::{align, batch_key, field_directive, named, project, required, timeout};
use crate::error::DirectiveError;
use crate::shell::{self, expand_data, expand_ids};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use subkit_core::{DirectiveDefinition, TemplateError, TemplateScope};
use subkit_runtime::{
    Context, DataLoader, DirectiveHandler, LoadError, Next, ResolverArgs, ResolverFuture,
    ResolverInfo,
};
use tokio::process::Command;
use tracing::debug;

/// Runs `cmd` with `sh -c`.
///
/// Stdout is parsed as JSON when possible and otherwise returned as a string
/// without its trailing newline. A non-zero exit or any output on stderr is an
/// error. The child is killed when `limit` elapses.
pub async fn run_command(cmd: &str, limit: Option<Duration>) -> Result<Value, DirectiveError> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd).kill_on_drop(true);
    debug!(cmd, "running command");

    let output = match limit {
        Some(limit) => tokio::time::timeout(limit, command.output())
            .await
            .map_err(|_| DirectiveError::Timeout(limit.as_millis()))??,
        None => command.output().await?,
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        return Err(DirectiveError::Exit {
            status: output.status.to_string(),
            stderr,
        });
    }
    if !stderr.is_empty() {
        return Err(DirectiveError::Stderr(stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(serde_json::from_str(&stdout)
        .unwrap_or_else(|_| Value::String(stdout.trim_end_matches('\n').to_string())))
}

/// Expands `cmd` as a command line and every other argument as text.
fn expand_command_argument(
    name: &str,
    template: &str,
    scope: &TemplateScope<'_>,
) -> Result<String, TemplateError> {
    if name == "cmd" {
        shell::expand(template, scope)
    } else {
        scope.expand(template)
    }
}

/// `@execute(cmd: String!, jsonQuery: String, timeout: Int)`.
///
/// Values substituted into `cmd` reach the shell as single literal words.
#[derive(Debug, Clone, Default)]
pub struct Execute {
    cache: Arc<ResponseCache>,
}

impl Execute {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    pub fn definition() -> DirectiveDefinition {
        field_directive("execute", "Run a shell command and resolve to its output.")
            .with_argument("cmd", required("String"))
            .with_argument("jsonQuery", named("String"))
            .with_argument("timeout", named("Int"))
    }
}

impl DirectiveHandler for Execute {
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
            let cmd = expand_data(&args.require::<String>("cmd")?, &data)?;
            let slot = CacheSlot::for_call(info, ctx, &args, &cmd)
                .map(|slot| slot.part(&info.path.to_string()));
            let value = self
                .cache
                .through(slot, async {
                    let output = run_command(&cmd, timeout(&args)).await?;
                    Ok(project(output, &args)?)
                })
                .await?;
            Ok(value)
        })
    }

    fn expand_argument(
        &self,
        name: &str,
        template: &str,
        scope: &TemplateScope<'_>,
    ) -> Result<String, TemplateError> {
        expand_command_argument(name, template, scope)
    }
}

/// `@executeBatched(cmd: String!, ids: String!, jsonQuery: String, timeout: Int)`.
///
/// Every sibling resolution contributes the parent's `ids` entry as a key; the
/// keys of one request are joined with commas into `${ids}` and the command
/// runs once. Its output must be a list with one entry per key, in key order.
/// Resolutions of the same field with different arguments batch separately.
#[derive(Debug, Clone, Default)]
pub struct ExecuteBatched {
    cache: Arc<ResponseCache>,
}

impl ExecuteBatched {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    pub fn definition() -> DirectiveDefinition {
        field_directive("executeBatched", "Run one shell command for a batch of keys.")
            .with_argument("cmd", required("String"))
            .with_argument("ids", required("String"))
            .with_argument("jsonQuery", named("String"))
            .with_argument("timeout", named("Int"))
    }
}

impl DirectiveHandler for ExecuteBatched {
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

            let cmd: String = args.require("cmd")?;
            let memo_key = format!(
                "execute-batched:{}.{}:{}",
                info.parent_type,
                info.field_name,
                args.to_json()
            );
            let slot = CacheSlot::for_call(info, ctx, &args, &cmd);
            let loader = ctx.memo(&memo_key, || {
                let args = Arc::new(args.clone());
                let cache = Arc::clone(&self.cache);
                DataLoader::new(move |keys: Vec<String>| {
                    let cmd = cmd.clone();
                    let args = Arc::clone(&args);
                    let cache = Arc::clone(&cache);
                    let slot = slot.clone();
                    async move {
                        cache
                            .through_batch(slot.as_ref(), keys, |keys| run_batch(&cmd, &args, keys))
                            .await
                            .map_err(|e| LoadError::Batch(e.to_string()))
                    }
                })
            });

            let value = loader.load(key).await.map_err(DirectiveError::from)?;
            Ok(value.unwrap_or(Value::Null))
        })
    }

    fn expand_argument(
        &self,
        name: &str,
        template: &str,
        scope: &TemplateScope<'_>,
    ) -> Result<String, TemplateError> {
        expand_command_argument(name, template, scope)
    }
}

async fn run_batch(
    cmd: &str,
    args: &ResolverArgs,
    keys: Vec<String>,
) -> Result<FxHashMap<String, Value>, DirectiveError> {
    let cmd = expand_ids(cmd, &keys)?;
    let output = run_command(&cmd, timeout(args)).await?;
    let output = project(output, args)?;
    align(keys, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_command_parses_json() {
        let value = run_command(r#"echo '{"ok": true}'"#, None).await.unwrap();
        assert_eq!(value, json!({"ok": true}));

        let value = run_command("echo hello", None).await.unwrap();
        assert_eq!(value, json!("hello"));
    }

    #[tokio::test]
    async fn test_run_command_failures() {
        let error = run_command("echo oops >&2", None).await.unwrap_err();
        assert!(matches!(error, DirectiveError::Stderr(ref s) if s == "oops"));

        let error = run_command("exit 3", None).await.unwrap_err();
        assert!(matches!(error, DirectiveError::Exit { .. }));

        let error = run_command("sleep 2", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "command timed out after 50ms");
    }

    #[tokio::test]
    async fn test_execute_applies_json_query() {
        let ctx = Context::new();
        let info = ResolverInfo::new("count", "Query");
        let args = ResolverArgs::from_pairs(vec![
            ("cmd".to_string(), json!(r#"echo '{"items": [${data.n}, 2]}'"#)),
            ("jsonQuery".to_string(), json!("items[0]")),
        ]);
        let value = Execute::default()
            .resolve(Next::ready(json!({"n": 9})), &Value::Null, args, &ctx, &info)
            .await
            .unwrap();
        assert_eq!(value, json!(9));
    }
}
