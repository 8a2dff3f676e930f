pub mod classify;
pub mod document;
pub mod executor;
pub mod incremental;
pub mod validation;

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_graphql::ServerError;
use async_graphql_parser::types::ExecutableDocument;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::context::RequestContext;
use crate::types::OperationRequest;

pub use classify::{classify, Delivery};
pub use document::{OperationInfo, OperationKind};
pub use executor::SchemaExecutor;
pub use validation::ValidationRules;

pub type ValueStream = BoxStream<'static, Value>;
pub type PatchStream = BoxStream<'static, Patch>;

#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub payload: Value,
    pub has_next: bool,
}

impl Patch {
    pub fn new(payload: Value, has_next: bool) -> Self {
        Self { payload, has_next }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleResult {
    pub payload: Value,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl SingleResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            status: 200,
            headers: Vec::new(),
        }
    }
}

pub struct IncrementalExecution {
    pub initial: Patch,
    pub patches: PatchStream,
}

pub enum ExecutionOutcome {
    Single(SingleResult),
    Incremental(IncrementalExecution),
    EventStream(ValueStream),
}

#[derive(Clone)]
pub struct ExecutionArgs {
    pub document: Arc<ExecutableDocument>,
    pub operation_name: Option<String>,
    pub variables: Map<String, Value>,
    pub context: RequestContext,
}

#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("syntax error")]
    Syntax(Vec<ServerError>),
    #[error("operation failed validation")]
    Validation(Vec<ServerError>),
    #[error("{}", .0.message)]
    Operation(ServerError),
    #[error("Can only perform a mutation operation from a POST request.")]
    MutationNotAllowed,
    #[error("execution failed")]
    Execution(Vec<ServerError>),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Rejection {
    pub fn errors(&self) -> Vec<ServerError> {
        match self {
            Rejection::Syntax(errors)
            | Rejection::Validation(errors)
            | Rejection::Execution(errors) => errors.clone(),
            Rejection::Operation(error) => vec![error.clone()],
            Rejection::MutationNotAllowed | Rejection::Internal(_) => {
                vec![ServerError::new(self.to_string(), None)]
            }
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Rejection::Syntax(_) | Rejection::Validation(_) | Rejection::Operation(_) => 400,
            Rejection::MutationNotAllowed => 405,
            Rejection::Execution(_) => 200,
            Rejection::Internal(_) => 500,
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({ "errors": errors_to_json(&self.errors()) })
    }
}

pub fn errors_to_json(errors: &[ServerError]) -> Vec<Value> {
    errors
        .iter()
        .map(|e| serde_json::to_value(e).unwrap_or_else(|_| json!({ "message": e.message })))
        .collect()
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn parse(&self, source: &str) -> Result<ExecutableDocument, ServerError>;

    fn validate(
        &self,
        document: &ExecutableDocument,
        operation_name: Option<&str>,
        variables: &Map<String, Value>,
        rules: &ValidationRules,
    ) -> Vec<ServerError>;

    async fn execute(&self, args: ExecutionArgs) -> Result<ExecutionOutcome, Rejection>;

    async fn subscribe(&self, args: ExecutionArgs) -> Result<ExecutionOutcome, Rejection>;
}

#[derive(Clone, Default, Debug)]
pub struct ActiveWork(Arc<AtomicUsize>);

impl ActiveWork {
    pub fn enter(&self) -> WorkGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        WorkGuard(self.0.clone())
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn track<T: Send + 'static>(&self, inner: BoxStream<'static, T>) -> BoxStream<'static, T> {
        Tracked {
            inner,
            _guard: self.enter(),
        }
        .boxed()
    }
}

#[derive(Debug)]
pub struct WorkGuard(Arc<AtomicUsize>);

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Tracked<T> {
    inner: BoxStream<'static, T>,
    _guard: WorkGuard,
}

impl<T> Stream for Tracked<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessOptions<'a> {
    pub rules: &'a ValidationRules,
    pub allow_mutations: bool,
}

pub async fn process(
    executor: &dyn Executor,
    request: OperationRequest,
    context: RequestContext,
    options: ProcessOptions<'_>,
) -> Result<Delivery, Rejection> {
    let document = executor
        .parse(&request.query)
        .map_err(|e| Rejection::Syntax(vec![e]))?;
    let variables = request.variables_map();
    let info = OperationInfo::resolve(&document, request.operation_name.as_deref(), &variables)
        .map_err(Rejection::Operation)?;

    if info.kind == OperationKind::Mutation && !options.allow_mutations {
        return Err(Rejection::MutationNotAllowed);
    }

    let errors = executor.validate(
        &document,
        request.operation_name.as_deref(),
        &variables,
        options.rules,
    );
    if !errors.is_empty() {
        return Err(Rejection::Validation(errors));
    }

    info!(
        operation = info.name.as_deref().unwrap_or("<anonymous>"),
        kind = ?info.kind,
        live = info.live,
        incremental = info.incremental,
        "executing operation"
    );

    let args = ExecutionArgs {
        document: Arc::new(document),
        operation_name: request.operation_name,
        variables,
        context,
    };
    let outcome = match info.kind {
        OperationKind::Subscription => executor.subscribe(args).await?,
        OperationKind::Query | OperationKind::Mutation => executor.execute(args).await?,
    };

    Ok(classify(outcome, &info))
}

pub async fn process_guarded(
    executor: &dyn Executor,
    request: OperationRequest,
    context: RequestContext,
    options: ProcessOptions<'_>,
) -> Result<Delivery, Rejection> {
    match AssertUnwindSafe(process(executor, request, context, options))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(%message, "engine panicked while processing operation");
            Err(Rejection::Internal(message))
        }
    }
}

pub fn guard_panics(stream: ValueStream) -> ValueStream {
    AssertUnwindSafe(stream)
        .catch_unwind()
        .map(|item| match item {
            Ok(value) => value,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%message, "engine panicked while streaming");
                Rejection::Internal(message).to_payload()
            }
        })
        .boxed()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use futures::{stream, StreamExt};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn active_work_drops_to_zero_with_stream() {
        let work = ActiveWork::default();
        let mut tracked = work.track(stream::iter(vec![1, 2, 3]).boxed());
        assert_eq!(work.count(), 1);
        assert_eq!(tracked.next().await, Some(1));
        drop(tracked);
        assert_eq!(work.count(), 0);
    }

    #[tokio::test]
    async fn panicking_stream_ends_with_error_payload() {
        let values: ValueStream = stream::iter(vec![0, 1])
            .map(|i| {
                if i == 1 {
                    panic!("resolver blew up");
                }
                json!({ "data": i })
            })
            .boxed();

        let collected: Vec<Value> = guard_panics(values).collect().await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0], json!({ "data": 0 }));
        assert_eq!(
            collected[1]["errors"][0]["message"],
            "internal error: resolver blew up"
        );
    }

    #[test]
    fn rejection_statuses() {
        assert_eq!(Rejection::Validation(vec![]).status(), 400);
        assert_eq!(Rejection::MutationNotAllowed.status(), 405);
        assert_eq!(
            Rejection::MutationNotAllowed.to_payload()["errors"][0]["message"],
            "Can only perform a mutation operation from a POST request."
        );
    }
}
