use std::sync::Arc;

use async_graphql::{Request, Response, ServerError, Variables};
use async_graphql_parser::types::ExecutableDocument;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::document::{self, print_operation, root_fields, root_resource_keys, select_operation, RootField};
use super::incremental::{self, DeferredFragment};
use super::validation::{self, SchemaIndex};
use super::{
    errors_to_json, ActiveWork, ExecutionArgs, ExecutionOutcome, Executor, IncrementalExecution,
    OperationInfo, OperationKind, Patch, Rejection, SingleResult, ValidationRules,
};
use crate::context::RequestContext;
use crate::live::{LiveQueryStore, ResourceKey};
use crate::schema::GqlSchema;

#[derive(Clone)]
pub struct SchemaExecutor {
    schema: GqlSchema,
    index: Arc<SchemaIndex>,
    live: LiveQueryStore,
    active: ActiveWork,
}

impl SchemaExecutor {
    pub fn new(schema: GqlSchema, live: LiveQueryStore) -> Self {
        let index = Arc::new(SchemaIndex::from_sdl(&schema.sdl()));
        Self {
            schema,
            index,
            live,
            active: ActiveWork::default(),
        }
    }

    pub fn active_work(&self) -> ActiveWork {
        self.active.clone()
    }

    #[cfg(test)]
    pub fn live_store(&self) -> &LiveQueryStore {
        &self.live
    }

    async fn execute_single(
        &self,
        source: String,
        args: &ExecutionArgs,
    ) -> Result<ExecutionOutcome, Rejection> {
        let response = run_on(&self.schema, source, &args.variables, args.context.clone()).await;
        if let Some(rejection) = request_failure(&response) {
            return Err(rejection);
        }
        Ok(ExecutionOutcome::Single(SingleResult::ok(response_payload(
            response,
        ))))
    }

    async fn execute_live(
        &self,
        source: String,
        fields: Vec<RootField>,
        args: ExecutionArgs,
    ) -> Result<ExecutionOutcome, Rejection> {
        let keys = root_resource_keys(&fields)
            .into_iter()
            .map(ResourceKey::from)
            .collect();
        let fields = Arc::new(fields);
        let fingerprint: Arc<str> = fingerprint(&source, &args.variables).into();
        // Registered before the first run so no invalidation in between is missed.
        let (registration, signals) = self.live.register(keys, fingerprint.clone());
        debug!(
            registration = %registration.id(),
            identical = self.live.registrations_with_fingerprint(&fingerprint),
            "live query registered"
        );

        let initial = run_on(&self.schema, source.clone(), &args.variables, args.context.clone()).await;
        if let Some(rejection) = request_failure(&initial) {
            return Err(rejection);
        }

        let schema = self.schema.clone();
        let ExecutionArgs {
            variables, context, ..
        } = args;
        let patches = stream::unfold(
            (registration, signals),
            move |(registration, mut signals)| {
                let schema = schema.clone();
                let source = source.clone();
                let variables = variables.clone();
                let context = context.clone();
                let fields = fields.clone();
                async move {
                    let invalidation = signals.recv().await?;
                    debug!(
                        registration = %registration.id(),
                        key = %invalidation.key,
                        "re-executing live query"
                    );
                    let response = run_on(&schema, source, &variables, context).await;
                    if !response.errors.is_empty() {
                        warn!(registration = %registration.id(), "live re-execution returned errors");
                    }
                    let payload = watching(response_payload(response), &fields, &invalidation.key);
                    Some((Patch::new(payload, true), (registration, signals)))
                }
            },
        );

        Ok(ExecutionOutcome::Incremental(IncrementalExecution {
            initial: Patch::new(response_payload(initial), true),
            patches: self.active.track(patches.boxed()),
        }))
    }

    async fn execute_incremental(
        &self,
        plan: incremental::IncrementalPlan,
        args: ExecutionArgs,
    ) -> Result<ExecutionOutcome, Rejection> {
        let response = run_on(
            &self.schema,
            plan.initial.clone(),
            &args.variables,
            args.context.clone(),
        )
        .await;
        if let Some(rejection) = request_failure(&response) {
            return Err(rejection);
        }

        let mut payload = response_payload(response);
        let mut sources: Vec<BoxStream<'static, Value>> = Vec::new();

        if let Some(data) = payload.get_mut("data") {
            incremental::strip_placeholders(data);
            for field in &plan.streamed {
                let items = incremental::split_streamed(data, field);
                if !items.is_empty() {
                    sources.push(incremental::paced(
                        items,
                        args.context.timings.stream_interval,
                    ));
                }
            }
        }

        for fragment in plan.deferred {
            let schema = self.schema.clone();
            let variables = args.variables.clone();
            let context = args.context.clone();
            let deferred = stream::once(async move {
                let response = run_on(&schema, fragment.source.clone(), &variables, context).await;
                deferred_payloads(response, &fragment)
            })
            .flat_map(stream::iter);
            sources.push(deferred.boxed());
        }

        let has_next = !sources.is_empty();
        if has_next {
            if let Some(map) = payload.as_object_mut() {
                map.insert("hasNext".into(), Value::Bool(true));
            }
        }

        Ok(ExecutionOutcome::Incremental(IncrementalExecution {
            initial: Patch::new(payload, has_next),
            patches: self.active.track(incremental::patch_stream(sources)),
        }))
    }
}

#[async_trait]
impl Executor for SchemaExecutor {
    fn parse(&self, source: &str) -> Result<ExecutableDocument, ServerError> {
        document::parse(source)
    }

    fn validate(
        &self,
        document: &ExecutableDocument,
        operation_name: Option<&str>,
        variables: &Map<String, Value>,
        rules: &ValidationRules,
    ) -> Vec<ServerError> {
        validation::validate(document, operation_name, variables, &self.index, rules)
    }

    async fn execute(&self, args: ExecutionArgs) -> Result<ExecutionOutcome, Rejection> {
        let document = args.document.clone();
        let info = OperationInfo::resolve(&document, args.operation_name.as_deref(), &args.variables)
            .map_err(Rejection::Operation)?;
        let (name, operation) = select_operation(&document, args.operation_name.as_deref())
            .map_err(Rejection::Operation)?;

        if info.live {
            let fields = root_fields(&operation.node, &document.fragments, &args.variables);
            let source = print_operation(name.as_ref(), &operation.node, &document.fragments);
            return self.execute_live(source, fields, args).await;
        }

        // Mutations are never split.
        if info.incremental && info.kind == OperationKind::Query {
            let plan = incremental::plan(
                name.as_ref(),
                &operation.node,
                &document.fragments,
                &args.variables,
            );
            if plan.has_pending() {
                return self.execute_incremental(plan, args).await;
            }
        }

        let source = print_operation(name.as_ref(), &operation.node, &document.fragments);
        self.execute_single(source, &args).await
    }

    async fn subscribe(&self, args: ExecutionArgs) -> Result<ExecutionOutcome, Rejection> {
        let document = args.document.clone();
        let (name, operation) = select_operation(&document, args.operation_name.as_deref())
            .map_err(Rejection::Operation)?;
        let source = print_operation(name.as_ref(), &operation.node, &document.fragments);

        let request = Request::new(source)
            .variables(Variables::from_json(Value::Object(args.variables.clone())))
            .data(args.context.clone());
        let mut responses = self.schema.execute_stream(request).boxed();

        let Some(first) = responses.next().await else {
            return Ok(ExecutionOutcome::EventStream(stream::empty().boxed()));
        };
        if let Some(rejection) = request_failure(&first) {
            return Err(rejection);
        }
        if first.data == async_graphql::Value::Null && !first.errors.is_empty() {
            return Err(Rejection::Execution(first.errors));
        }

        let values = stream::once(async move { response_payload(first) })
            .chain(responses.map(response_payload))
            .boxed();
        Ok(ExecutionOutcome::EventStream(self.active.track(values)))
    }
}

async fn run_on(
    schema: &GqlSchema,
    source: String,
    variables: &Map<String, Value>,
    context: RequestContext,
) -> Response {
    let request = Request::new(source)
        .variables(Variables::from_json(Value::Object(variables.clone())))
        .data(context);
    schema.execute(request).await
}

fn request_failure(response: &Response) -> Option<Rejection> {
    let unresolved = response.data == async_graphql::Value::Null
        && !response.errors.is_empty()
        && response.errors.iter().all(|e| e.path.is_empty());
    unresolved.then(|| Rejection::Validation(response.errors.clone()))
}

fn response_payload(response: Response) -> Value {
    let mut payload = Map::new();
    let data = response.data.into_json().unwrap_or(Value::Null);
    payload.insert("data".into(), data);
    if !response.errors.is_empty() {
        payload.insert(
            "errors".into(),
            Value::Array(errors_to_json(&response.errors)),
        );
    }
    Value::Object(payload)
}

/// Keeps only the root fields watching `key`, and the errors under them.
fn watching(mut payload: Value, fields: &[RootField], key: &str) -> Value {
    let watched: Vec<&str> = fields
        .iter()
        .filter(|field| field.keys.iter().any(|k| k == key))
        .map(|field| field.response_key.as_str())
        .collect();

    if let Some(Value::Object(data)) = payload.get_mut("data") {
        data.retain(|response_key, _| watched.contains(&response_key.as_str()));
    }
    let mut unrelated_only = false;
    if let Some(Value::Array(errors)) = payload.get_mut("errors") {
        errors.retain(|error| match error["path"].get(0).and_then(Value::as_str) {
            Some(root) => watched.contains(&root),
            None => true,
        });
        unrelated_only = errors.is_empty();
    }
    if unrelated_only {
        if let Some(map) = payload.as_object_mut() {
            map.remove("errors");
        }
    }
    payload
}

fn deferred_payloads(response: Response, fragment: &DeferredFragment) -> Vec<Value> {
    let errors = errors_to_json(&response.errors);
    let data = response.data.into_json().unwrap_or(Value::Null);
    let mut payloads = incremental::deferred_patches(&data, fragment);

    if errors.is_empty() {
        return payloads;
    }
    match payloads.first_mut().and_then(Value::as_object_mut) {
        Some(first) => {
            first.insert("errors".into(), Value::Array(errors));
        }
        None => payloads.push(serde_json::json!({
            "data": null,
            "path": fragment.path,
            "errors": errors,
        })),
    }
    payloads
}

fn fingerprint(source: &str, variables: &Map<String, Value>) -> String {
    let canonical = serde_jcs::to_string(variables).unwrap_or_default();
    format!("{source}|{canonical}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{FutureExt, StreamExt};
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::bus::EventBus;
    use crate::config::Timings;
    use crate::context::{ContextFactory, DemoState, GREETINGS_KEY};
    use crate::engine::{classify, Delivery, PatchStream};
    use crate::schema::build_schema;

    fn fast_timings() -> Timings {
        Timings {
            defer_delay: Duration::from_millis(10),
            stream_interval: Duration::from_millis(1),
            count_interval: Duration::from_millis(1),
        }
    }

    fn setup() -> (SchemaExecutor, ContextFactory) {
        let executor = SchemaExecutor::new(build_schema(), LiveQueryStore::new());
        let contexts = ContextFactory::new(
            Arc::new(DemoState::default()),
            EventBus::default(),
            fast_timings(),
        );
        (executor, contexts)
    }

    fn args(executor: &SchemaExecutor, contexts: &ContextFactory, source: &str) -> ExecutionArgs {
        ExecutionArgs {
            document: Arc::new(executor.parse(source).unwrap()),
            operation_name: None,
            variables: Map::new(),
            context: contexts.build(),
        }
    }

    #[tokio::test]
    async fn plain_query_is_single() {
        let (executor, contexts) = setup();
        let outcome = executor
            .execute(args(&executor, &contexts, "{ ping }"))
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Single(result) => {
                assert_eq!(result.payload, json!({ "data": { "ping": true } }))
            }
            _ => panic!("expected a single result"),
        }
    }

    #[tokio::test]
    async fn unknown_field_is_rejected_before_execution() {
        let (executor, contexts) = setup();
        let rejection = executor
            .execute(args(&executor, &contexts, "{ nope }"))
            .await
            .err()
            .unwrap();
        assert!(matches!(rejection, Rejection::Validation(_)));
        assert_eq!(rejection.status(), 400);
    }

    #[tokio::test]
    async fn deferred_field_arrives_as_patch() {
        let (executor, contexts) = setup();
        let outcome = executor
            .execute(args(
                &executor,
                &contexts,
                r#"{ deferTest { name ... @defer(label: "slow") { deferThisField } } }"#,
            ))
            .await
            .unwrap();
        let ExecutionOutcome::Incremental(execution) = outcome else {
            panic!("expected incremental outcome");
        };

        assert!(execution.initial.has_next);
        assert_eq!(
            execution.initial.payload,
            json!({ "data": { "deferTest": { "name": "Peter Parker" } }, "hasNext": true })
        );

        let patches: Vec<Patch> = execution.patches.collect().await;
        assert_eq!(
            patches[0].payload,
            json!({
                "data": { "deferThisField": "Took a long time ,he?" },
                "path": ["deferTest"],
                "label": "slow",
                "hasNext": true
            })
        );
        assert_eq!(patches.last().unwrap().payload, json!({ "hasNext": false }));
    }

    #[tokio::test]
    async fn streamed_list_is_split_after_initial_count() {
        let (executor, contexts) = setup();
        let outcome = executor
            .execute(args(&executor, &contexts, "{ streamTest @stream(initialCount: 1) }"))
            .await
            .unwrap();
        let ExecutionOutcome::Incremental(execution) = outcome else {
            panic!("expected incremental outcome");
        };
        assert_eq!(execution.initial.payload["data"]["streamTest"], json!(["Hi"]));

        let patches: Vec<Value> = execution.patches.map(|p| p.payload).collect().await;
        assert_eq!(patches[0]["items"], json!(["My"]));
        assert_eq!(patches[0]["path"], json!(["streamTest", 1]));
        assert_eq!(patches[1]["items"], json!(["Friend"]));
        assert_eq!(patches[2], json!({ "hasNext": false }));
    }

    #[tokio::test]
    async fn large_initial_count_collapses_to_single() {
        let (executor, contexts) = setup();
        let outcome = executor
            .execute(args(&executor, &contexts, "{ streamTest @stream(initialCount: 5) }"))
            .await
            .unwrap();
        let info = OperationInfo {
            name: None,
            kind: OperationKind::Query,
            live: false,
            incremental: true,
        };
        match classify(outcome, &info) {
            Delivery::Single(result) => assert_eq!(
                result.payload,
                json!({ "data": { "streamTest": ["Hi", "My", "Friend"] } })
            ),
            other => panic!("expected single, got {other:?}"),
        }
        assert_eq!(executor.active_work().count(), 0);
    }

    #[tokio::test]
    async fn live_query_re_executes_once_per_invalidation() {
        let (executor, contexts) = setup();
        let outcome = executor
            .execute(args(&executor, &contexts, "query @live { greetings }"))
            .await
            .unwrap();
        let ExecutionOutcome::Incremental(execution) = outcome else {
            panic!("expected incremental outcome");
        };
        assert_eq!(
            execution.initial.payload["data"]["greetings"],
            json!(["Hello", "Hi", "Ay", "Sup"])
        );

        let mut patches = execution.patches;
        contexts.state().rotate_greetings();
        assert_eq!(executor.live_store().invalidate(GREETINGS_KEY), 1);
        let first = patches.next().await.unwrap();
        assert_eq!(first.payload["data"]["greetings"][0], "Sup");

        contexts.state().rotate_greetings();
        assert_eq!(executor.live_store().invalidate(GREETINGS_KEY), 1);
        let second = patches.next().await.unwrap();
        assert_eq!(second.payload["data"]["greetings"][0], "Ay");
        assert!(patches.next().now_or_never().is_none());

        assert_eq!(executor.active_work().count(), 1);
        drop(patches);
        assert_eq!(executor.live_store().registration_count(), 0);
        assert_eq!(executor.active_work().count(), 0);
    }

    async fn live_patches(executor: &SchemaExecutor, contexts: &ContextFactory, source: &str) -> PatchStream {
        match executor.execute(args(executor, contexts, source)).await.unwrap() {
            ExecutionOutcome::Incremental(execution) => execution.patches,
            _ => panic!("expected incremental outcome"),
        }
    }

    #[tokio::test]
    async fn live_patch_leaves_out_unrelated_fields() {
        let (executor, contexts) = setup();
        let mut patches = live_patches(&executor, &contexts, "query @live { greetings ping }").await;

        contexts.state().rotate_greetings();
        assert_eq!(executor.live_store().invalidate(GREETINGS_KEY), 1);
        assert_eq!(
            patches.next().await.unwrap().payload,
            json!({ "data": { "greetings": ["Sup", "Hello", "Hi", "Ay"] } })
        );
    }

    #[tokio::test]
    async fn failed_re_execution_is_an_error_patch_and_keeps_registration() {
        let (executor, contexts) = setup();
        let mut patches = live_patches(&executor, &contexts, "query @live { greetings }").await;

        contexts.state().replace_greetings(Vec::new());
        assert_eq!(executor.live_store().invalidate(GREETINGS_KEY), 1);
        let failed = patches.next().await.unwrap();
        assert!(failed.has_next);
        assert_eq!(failed.payload["data"], Value::Null);
        assert_eq!(failed.payload["errors"][0]["message"], "No greetings to show.");
        assert_eq!(executor.live_store().registration_count(), 1);

        contexts.state().replace_greetings(vec!["Yo".into()]);
        assert_eq!(executor.live_store().invalidate(GREETINGS_KEY), 1);
        assert_eq!(
            patches.next().await.unwrap().payload,
            json!({ "data": { "greetings": ["Yo"] } })
        );
    }

    #[tokio::test]
    async fn count_subscription_streams_values() {
        let (executor, contexts) = setup();
        let outcome = executor
            .subscribe(args(&executor, &contexts, "subscription { count(to: 3) }"))
            .await
            .unwrap();
        let ExecutionOutcome::EventStream(values) = outcome else {
            panic!("expected an event stream");
        };
        let values: Vec<Value> = values.collect().await;
        assert_eq!(
            values,
            vec![
                json!({ "data": { "count": "1" } }),
                json!({ "data": { "count": "2" } }),
                json!({ "data": { "count": "3" } }),
            ]
        );
        assert_eq!(executor.active_work().count(), 0);
    }

    #[tokio::test]
    async fn broken_subscription_is_rejected() {
        let (executor, contexts) = setup();
        let rejection = executor
            .subscribe(args(&executor, &contexts, "subscription { nope }"))
            .await
            .err()
            .unwrap();
        assert!(!rejection.errors().is_empty());
    }

    #[test]
    fn one_of_rule_uses_schema_index() {
        let (executor, _) = setup();
        let doc = executor
            .parse(r#"{ oneOfTest(input: { byId: "1", byName: "x" }) }"#)
            .unwrap();
        let errors = executor.validate(&doc, None, &Map::new(), &ValidationRules::default());
        assert_eq!(errors.len(), 1);
    }
}
