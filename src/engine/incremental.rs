use std::time::Duration;

use async_graphql_parser::types::{
    Field, InlineFragment, OperationDefinition, Selection, SelectionSet,
};
use async_graphql_parser::{Pos, Positioned};
use async_graphql_value::Name;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Map, Value};

use super::document::{
    directive_argument, directive_enabled, find_directive, print_operation, resolve_value,
    Fragments, DEFER, STREAM,
};
use super::{Patch, PatchStream};

/// Alias of the `__typename` selection that keeps an emptied selection set valid.
pub const PLACEHOLDER: &str = "_gqlplex_placeholder";

#[derive(Debug, Clone, PartialEq)]
pub struct DeferredFragment {
    pub label: Option<String>,
    pub path: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamedField {
    pub label: Option<String>,
    pub path: Vec<String>,
    pub initial_count: usize,
}

#[derive(Debug, Clone)]
pub struct IncrementalPlan {
    pub initial: String,
    pub deferred: Vec<DeferredFragment>,
    pub streamed: Vec<StreamedField>,
}

impl IncrementalPlan {
    pub fn has_pending(&self) -> bool {
        !self.deferred.is_empty() || !self.streamed.is_empty()
    }
}

pub fn plan(
    name: Option<&Name>,
    operation: &OperationDefinition,
    fragments: &Fragments,
    variables: &Map<String, Value>,
) -> IncrementalPlan {
    let mut stack = Vec::new();
    let inlined = inline_spreads(&operation.selection_set.node, fragments, &mut stack);

    let mut planner = Planner {
        name,
        operation,
        variables,
        deferred: Vec::new(),
        streamed: Vec::new(),
    };
    let initial_set = planner.split(&inlined, &[]);

    let initial = OperationDefinition {
        ty: operation.ty,
        variable_definitions: operation.variable_definitions.clone(),
        directives: operation.directives.clone(),
        selection_set: Positioned::new(initial_set, operation.selection_set.pos),
    };

    IncrementalPlan {
        initial: print_operation(name, &initial, &Fragments::new()),
        deferred: planner.deferred,
        streamed: planner.streamed,
    }
}

fn inline_spreads(set: &SelectionSet, fragments: &Fragments, stack: &mut Vec<Name>) -> SelectionSet {
    let mut items = Vec::with_capacity(set.items.len());
    for item in &set.items {
        let selection = match &item.node {
            Selection::Field(field) => {
                let mut field = field.clone();
                field.node.selection_set.node =
                    inline_spreads(&field.node.selection_set.node, fragments, stack);
                Selection::Field(field)
            }
            Selection::InlineFragment(fragment) => {
                let mut fragment = fragment.clone();
                fragment.node.selection_set.node =
                    inline_spreads(&fragment.node.selection_set.node, fragments, stack);
                Selection::InlineFragment(fragment)
            }
            Selection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                let Some(definition) = fragments.get(name) else {
                    continue;
                };
                if stack.contains(name) {
                    continue;
                }
                stack.push(name.clone());
                let selection_set = inline_spreads(&definition.node.selection_set.node, fragments, stack);
                stack.pop();
                Selection::InlineFragment(Positioned::new(
                    InlineFragment {
                        type_condition: Some(definition.node.type_condition.clone()),
                        directives: spread.node.directives.clone(),
                        selection_set: Positioned::new(selection_set, definition.node.selection_set.pos),
                    },
                    spread.pos,
                ))
            }
        };
        items.push(Positioned::new(selection, item.pos));
    }
    SelectionSet { items }
}

struct Planner<'a> {
    name: Option<&'a Name>,
    operation: &'a OperationDefinition,
    variables: &'a Map<String, Value>,
    deferred: Vec<DeferredFragment>,
    streamed: Vec<StreamedField>,
}

impl Planner<'_> {
    fn split(&mut self, set: &SelectionSet, ancestors: &[Positioned<Field>]) -> SelectionSet {
        let mut items = Vec::with_capacity(set.items.len());

        for item in &set.items {
            match &item.node {
                Selection::Field(field) => {
                    let mut path: Vec<String> = ancestors.iter().map(response_key).collect();
                    path.push(response_key(field));

                    if let Some(stream) = find_directive(&field.node.directives, STREAM)
                        .filter(|d| directive_enabled(&d.node, self.variables))
                    {
                        let initial_count = directive_argument(&stream.node, "initialCount")
                            .map(|v| resolve_value(v, self.variables))
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0) as usize;
                        self.streamed.push(StreamedField {
                            label: self.label(&stream.node),
                            path,
                            initial_count,
                        });
                    }

                    let mut kept = field.clone();
                    if !field.node.selection_set.node.items.is_empty() {
                        let mut chain = ancestors.to_vec();
                        chain.push(field.clone());
                        kept.node.selection_set.node =
                            self.split(&field.node.selection_set.node, &chain);
                    }
                    items.push(Positioned::new(Selection::Field(kept), item.pos));
                }
                Selection::InlineFragment(fragment) => {
                    let deferred = find_directive(&fragment.node.directives, DEFER)
                        .filter(|d| directive_enabled(&d.node, self.variables));
                    match deferred {
                        Some(directive) => {
                            let label = self.label(&directive.node);
                            self.defer(fragment, ancestors, label);
                        }
                        None => {
                            let mut kept = fragment.clone();
                            kept.node.selection_set.node =
                                self.split(&fragment.node.selection_set.node, ancestors);
                            items.push(Positioned::new(Selection::InlineFragment(kept), item.pos));
                        }
                    }
                }
                Selection::FragmentSpread(_) => items.push(item.clone()),
            }
        }

        if items.is_empty() && !set.items.is_empty() {
            items.push(placeholder());
        }
        SelectionSet { items }
    }

    fn defer(
        &mut self,
        fragment: &Positioned<InlineFragment>,
        ancestors: &[Positioned<Field>],
        label: Option<String>,
    ) {
        let mut set = SelectionSet {
            items: vec![Positioned::new(
                Selection::InlineFragment(fragment.clone()),
                fragment.pos,
            )],
        };
        for ancestor in ancestors.iter().rev() {
            let mut wrapper = ancestor.clone();
            wrapper.node.selection_set.node = set;
            set = SelectionSet {
                items: vec![Positioned::new(Selection::Field(wrapper), ancestor.pos)],
            };
        }

        let operation = OperationDefinition {
            ty: self.operation.ty,
            variable_definitions: self.operation.variable_definitions.clone(),
            directives: self.operation.directives.clone(),
            selection_set: Positioned::new(set, self.operation.selection_set.pos),
        };

        self.deferred.push(DeferredFragment {
            label,
            path: ancestors.iter().map(response_key).collect(),
            source: print_operation(self.name, &operation, &Fragments::new()),
        });
    }

    fn label(&self, directive: &async_graphql_parser::types::Directive) -> Option<String> {
        directive_argument(directive, "label")
            .map(|v| resolve_value(v, self.variables))
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

fn response_key(field: &Positioned<Field>) -> String {
    field
        .node
        .alias
        .as_ref()
        .map(|a| a.node.to_string())
        .unwrap_or_else(|| field.node.name.node.to_string())
}

fn placeholder() -> Positioned<Selection> {
    let pos = Pos::default();
    let field = Field {
        alias: Some(Positioned::new(Name::new(PLACEHOLDER), pos)),
        name: Positioned::new(Name::new("__typename"), pos),
        arguments: Vec::new(),
        directives: Vec::new(),
        selection_set: Positioned::new(SelectionSet { items: Vec::new() }, pos),
    };
    Positioned::new(Selection::Field(Positioned::new(field, pos)), pos)
}

pub fn strip_placeholders(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(PLACEHOLDER);
            map.values_mut().for_each(strip_placeholders);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_placeholders),
        _ => {}
    }
}

pub fn split_streamed(data: &mut Value, field: &StreamedField) -> Vec<Value> {
    let mut cut = Vec::new();
    let mut path = Vec::new();
    take_tail(data, &field.path, field.initial_count, &mut path, &mut cut);

    cut.into_iter()
        .map(|(path, item)| {
            let mut payload = json!({ "items": [item], "path": path });
            with_label(&mut payload, &field.label);
            payload
        })
        .collect()
}

fn take_tail(
    value: &mut Value,
    keys: &[String],
    keep: usize,
    path: &mut Vec<Value>,
    out: &mut Vec<(Vec<Value>, Value)>,
) {
    match value {
        Value::Array(items) if !keys.is_empty() => {
            for (index, item) in items.iter_mut().enumerate() {
                path.push(index.into());
                take_tail(item, keys, keep, path, out);
                path.pop();
            }
        }
        Value::Object(map) => {
            let Some((key, rest)) = keys.split_first() else {
                return;
            };
            let Some(child) = map.get_mut(key) else {
                return;
            };
            path.push(Value::String(key.clone()));
            if rest.is_empty() {
                if let Value::Array(items) = child {
                    if items.len() > keep {
                        for (offset, item) in items.split_off(keep).into_iter().enumerate() {
                            let mut item_path = path.clone();
                            item_path.push((keep + offset).into());
                            out.push((item_path, item));
                        }
                    }
                }
            } else {
                take_tail(child, rest, keep, path, out);
            }
            path.pop();
        }
        _ => {}
    }
}

pub fn deferred_patches(data: &Value, fragment: &DeferredFragment) -> Vec<Value> {
    let mut found = Vec::new();
    let mut path = Vec::new();
    find_targets(data, &fragment.path, &mut path, &mut found);

    found
        .into_iter()
        .map(|(path, data)| {
            let mut payload = json!({ "data": data, "path": path });
            with_label(&mut payload, &fragment.label);
            payload
        })
        .collect()
}

fn find_targets(
    value: &Value,
    keys: &[String],
    path: &mut Vec<Value>,
    out: &mut Vec<(Vec<Value>, Value)>,
) {
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                path.push(index.into());
                find_targets(item, keys, path, out);
                path.pop();
            }
        }
        Value::Object(map) => match keys.split_first() {
            None => out.push((path.clone(), value.clone())),
            Some((key, rest)) => {
                if let Some(child) = map.get(key) {
                    path.push(Value::String(key.clone()));
                    find_targets(child, rest, path, out);
                    path.pop();
                }
            }
        },
        _ => {}
    }
}

fn with_label(payload: &mut Value, label: &Option<String>) {
    if let (Some(label), Some(map)) = (label, payload.as_object_mut()) {
        map.insert("label".into(), Value::String(label.clone()));
    }
}

pub fn paced(items: Vec<Value>, interval: Duration) -> BoxStream<'static, Value> {
    stream::iter(items)
        .then(move |item| async move {
            tokio::time::sleep(interval).await;
            item
        })
        .boxed()
}

/// Merges patch sources in arrival order. Every patch announces
/// `hasNext: true`; a closing `{"hasNext": false}` ends the sequence.
pub fn patch_stream(sources: Vec<BoxStream<'static, Value>>) -> PatchStream {
    stream::select_all(sources)
        .map(|mut payload| {
            if let Some(map) = payload.as_object_mut() {
                map.insert("hasNext".into(), Value::Bool(true));
            }
            Patch::new(payload, true)
        })
        .chain(stream::once(async {
            Patch::new(json!({ "hasNext": false }), false)
        }))
        .boxed()
}
