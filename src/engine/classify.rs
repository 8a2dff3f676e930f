use futures::stream;
use futures::StreamExt;

use super::document::OperationInfo;
use super::{ExecutionOutcome, PatchStream, SingleResult, ValueStream};

pub enum Delivery {
    Single(SingleResult),
    Multipart(PatchStream),
    EventStream(ValueStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Single,
    Multipart,
    EventStream,
}

impl Delivery {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            Delivery::Single(_) => DeliveryMode::Single,
            Delivery::Multipart(_) => DeliveryMode::Multipart,
            Delivery::EventStream(_) => DeliveryMode::EventStream,
        }
    }

    pub fn into_values(self) -> ValueStream {
        match self {
            Delivery::Single(result) => stream::once(async move { result.payload }).boxed(),
            Delivery::Multipart(patches) => patches.map(|patch| patch.payload).boxed(),
            Delivery::EventStream(values) => values,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Single(result) => f.debug_tuple("Single").field(result).finish(),
            Delivery::Multipart(_) => f.write_str("Multipart(..)"),
            Delivery::EventStream(_) => f.write_str("EventStream(..)"),
        }
    }
}

pub fn classify(outcome: ExecutionOutcome, info: &OperationInfo) -> Delivery {
    match outcome {
        ExecutionOutcome::Single(result) => Delivery::Single(result),
        ExecutionOutcome::Incremental(execution) if !execution.initial.has_next => {
            Delivery::Single(SingleResult::ok(execution.initial.payload))
        }
        ExecutionOutcome::Incremental(execution) => {
            let first = stream::once(async move { execution.initial });
            if info.live {
                Delivery::EventStream(
                    first
                        .chain(execution.patches)
                        .map(|patch| patch.payload)
                        .boxed(),
                )
            } else {
                Delivery::Multipart(first.chain(execution.patches).boxed())
            }
        }
        ExecutionOutcome::EventStream(values) => Delivery::EventStream(values),
    }
}
