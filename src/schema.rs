use async_graphql::{Context, Object, OneofObject, Result, Schema, Subscription, ID};
use futures::{stream, Stream};

use crate::context::{RequestContext, RANDOM_HASH_TOPIC};

pub type GqlSchema = Schema<QueryRoot, MutationRoot, SubscriptionRoot>;

const STREAM_TEST_ITEMS: [&str; 3] = ["Hi", "My", "Friend"];

pub fn build_schema() -> GqlSchema {
    Schema::build(QueryRoot, MutationRoot, SubscriptionRoot).finish()
}

fn request_context<'a>(ctx: &Context<'a>) -> Result<&'a RequestContext> {
    ctx.data::<RequestContext>()
}

#[derive(Default)]
pub struct QueryRoot;

#[Object(name = "Query")]
impl QueryRoot {
    async fn ping(&self) -> bool {
        true
    }

    async fn defer_test(&self) -> DeferTest {
        DeferTest
    }

    async fn stream_test(&self) -> Vec<String> {
        STREAM_TEST_ITEMS.iter().map(|s| s.to_string()).collect()
    }

    async fn greetings(&self, ctx: &Context<'_>) -> Result<Vec<String>> {
        let greetings = request_context(ctx)?.state.greetings();
        if greetings.is_empty() {
            return Err("No greetings to show.".into());
        }
        Ok(greetings)
    }

    async fn one_of_test(&self, #[graphql(name = "input")] _input: OneOfInput) -> bool {
        true
    }
}

pub struct DeferTest;

#[Object(name = "GraphQLDeferTest")]
impl DeferTest {
    async fn name(&self) -> String {
        "Peter Parker".to_string()
    }

    async fn defer_this_field(&self, ctx: &Context<'_>) -> Result<String> {
        let delay = request_context(ctx)?.timings.defer_delay;
        tokio::time::sleep(delay).await;
        Ok("Took a long time ,he?".to_string())
    }
}

#[derive(OneofObject)]
#[graphql(name = "GraphQLOneOfInput")]
pub enum OneOfInput {
    ById(ID),
    ByName(String),
}

#[derive(Default)]
pub struct MutationRoot;

#[Object(name = "Mutation")]
impl MutationRoot {
    async fn ping(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct SubscriptionRoot;

#[Subscription(name = "Subscription")]
impl SubscriptionRoot {
    async fn count(&self, ctx: &Context<'_>, to: i32) -> Result<impl Stream<Item = String>> {
        let interval = request_context(ctx)?.timings.count_interval;
        Ok(stream::unfold(1, move |i| async move {
            if i > to {
                return None;
            }
            if i > 1 {
                tokio::time::sleep(interval).await;
            }
            Some((i.to_string(), i + 1))
        }))
    }

    async fn random_hash(&self, ctx: &Context<'_>) -> Result<impl Stream<Item = String>> {
        Ok(request_context(ctx)?
            .bus
            .subscribe::<String>(RANDOM_HASH_TOPIC))
    }
}
