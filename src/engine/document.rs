use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use async_graphql::ServerError;
use async_graphql_parser::types::{
    Directive, DocumentOperations, ExecutableDocument, FragmentDefinition, OperationDefinition,
    OperationType, Selection, SelectionSet,
};
use async_graphql_parser::Positioned;
use async_graphql_value::{Name, Value as GqlValue};
use serde_json::{Map, Value};

pub const LIVE: &str = "live";
pub const DEFER: &str = "defer";
pub const STREAM: &str = "stream";

const TRANSPORT_DIRECTIVES: [&str; 3] = [LIVE, DEFER, STREAM];

pub type Fragments = HashMap<Name, Positioned<FragmentDefinition>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl From<OperationType> for OperationKind {
    fn from(ty: OperationType) -> Self {
        match ty {
            OperationType::Query => OperationKind::Query,
            OperationType::Mutation => OperationKind::Mutation,
            OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationInfo {
    pub name: Option<String>,
    pub kind: OperationKind,
    pub live: bool,
    pub incremental: bool,
}

impl OperationInfo {
    pub fn resolve(
        document: &ExecutableDocument,
        operation_name: Option<&str>,
        variables: &Map<String, Value>,
    ) -> Result<Self, ServerError> {
        let (name, operation) = select_operation(document, operation_name)?;
        let operation = &operation.node;
        let kind = OperationKind::from(operation.ty);

        let live = kind == OperationKind::Query
            && find_directive(&operation.directives, LIVE)
                .map(|d| directive_enabled(&d.node, variables))
                .unwrap_or(false);

        let mut visited = HashSet::new();
        let incremental = uses_incremental(
            &operation.selection_set.node,
            &document.fragments,
            variables,
            &mut visited,
        );

        Ok(Self {
            name: name.map(|n| n.to_string()),
            kind,
            live,
            incremental,
        })
    }
}

pub fn parse(source: &str) -> Result<ExecutableDocument, ServerError> {
    async_graphql_parser::parse_query(source).map_err(|e| ServerError::new(e.to_string(), None))
}

pub fn select_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<(Option<Name>, &'a Positioned<OperationDefinition>), ServerError> {
    match &document.operations {
        DocumentOperations::Single(operation) => Ok((None, operation)),
        DocumentOperations::Multiple(operations) => match operation_name {
            Some(wanted) => operations
                .iter()
                .find(|(name, _)| name.as_str() == wanted)
                .map(|(name, op)| (Some(name.clone()), op))
                .ok_or_else(|| {
                    ServerError::new(format!("Unknown operation named \"{wanted}\"."), None)
                }),
            None if operations.len() == 1 => operations
                .iter()
                .next()
                .map(|(name, op)| (Some(name.clone()), op))
                .ok_or_else(|| ServerError::new("Document contains no operation.", None)),
            None => Err(ServerError::new(
                "Must provide operation name if query contains multiple operations.",
                None,
            )),
        },
    }
}

pub fn find_directive<'a>(
    directives: &'a [Positioned<Directive>],
    name: &str,
) -> Option<&'a Positioned<Directive>> {
    directives.iter().find(|d| d.node.name.node.as_str() == name)
}

pub fn directive_argument<'a>(directive: &'a Directive, name: &str) -> Option<&'a GqlValue> {
    directive
        .arguments
        .iter()
        .find(|(arg, _)| arg.node.as_str() == name)
        .map(|(_, value)| &value.node)
}

pub fn directive_enabled(directive: &Directive, variables: &Map<String, Value>) -> bool {
    match directive_argument(directive, "if") {
        Some(value) => resolve_value(value, variables).as_bool().unwrap_or(true),
        None => true,
    }
}

pub fn resolve_value(value: &GqlValue, variables: &Map<String, Value>) -> Value {
    match value {
        GqlValue::Variable(name) => variables.get(name.as_str()).cloned().unwrap_or(Value::Null),
        GqlValue::Null => Value::Null,
        GqlValue::Number(n) => Value::Number(n.clone()),
        GqlValue::String(s) => Value::String(s.clone()),
        GqlValue::Boolean(b) => Value::Bool(*b),
        GqlValue::Binary(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        GqlValue::Enum(name) => Value::String(name.to_string()),
        GqlValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, variables))
                .collect(),
        ),
        GqlValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), resolve_value(v, variables)))
                .collect(),
        ),
    }
}

fn uses_incremental(
    set: &SelectionSet,
    fragments: &Fragments,
    variables: &Map<String, Value>,
    visited: &mut HashSet<Name>,
) -> bool {
    let enabled = |directives: &[Positioned<Directive>], name: &str| {
        find_directive(directives, name)
            .map(|d| directive_enabled(&d.node, variables))
            .unwrap_or(false)
    };

    set.items.iter().any(|item| match &item.node {
        Selection::Field(field) => {
            enabled(&field.node.directives, STREAM)
                || uses_incremental(&field.node.selection_set.node, fragments, variables, visited)
        }
        Selection::InlineFragment(fragment) => {
            enabled(&fragment.node.directives, DEFER)
                || uses_incremental(
                    &fragment.node.selection_set.node,
                    fragments,
                    variables,
                    visited,
                )
        }
        Selection::FragmentSpread(spread) => {
            if enabled(&spread.node.directives, DEFER) {
                return true;
            }
            let name = &spread.node.fragment_name.node;
            if !visited.insert(name.clone()) {
                return false;
            }
            fragments
                .get(name)
                .map(|f| uses_incremental(&f.node.selection_set.node, fragments, variables, visited))
                .unwrap_or(false)
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootField {
    pub response_key: String,
    pub keys: Vec<String>,
}

/// `Query.<field>` for each root field, plus `Query.<field>(id:"<id>")` when
/// the field takes an `id`.
pub fn root_fields(
    operation: &OperationDefinition,
    fragments: &Fragments,
    variables: &Map<String, Value>,
) -> Vec<RootField> {
    let mut fields = Vec::new();
    let mut visited = HashSet::new();
    collect_root_fields(
        &operation.selection_set.node,
        fragments,
        variables,
        &mut visited,
        &mut fields,
    );
    fields
}

pub fn root_resource_keys(fields: &[RootField]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in fields.iter().flat_map(|field| &field.keys) {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

fn collect_root_fields(
    set: &SelectionSet,
    fragments: &Fragments,
    variables: &Map<String, Value>,
    visited: &mut HashSet<Name>,
    fields: &mut Vec<RootField>,
) {
    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                let name = field.node.name.node.as_str();
                if name.starts_with("__") {
                    continue;
                }
                let mut keys = vec![format!("Query.{name}")];
                let id = field
                    .node
                    .arguments
                    .iter()
                    .find(|(arg, _)| arg.node.as_str() == "id")
                    .map(|(_, value)| resolve_value(&value.node, variables));
                if let Some(id) = id.filter(|v| !v.is_null()) {
                    keys.push(format!("Query.{name}(id:{id})"));
                }

                let response_key = field.node.response_key().node.to_string();
                match fields.iter_mut().find(|f| f.response_key == response_key) {
                    Some(existing) => {
                        for key in keys {
                            if !existing.keys.contains(&key) {
                                existing.keys.push(key);
                            }
                        }
                    }
                    None => fields.push(RootField { response_key, keys }),
                }
            }
            Selection::InlineFragment(fragment) => {
                collect_root_fields(
                    &fragment.node.selection_set.node,
                    fragments,
                    variables,
                    visited,
                    fields,
                );
            }
            Selection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                if visited.insert(name.clone()) {
                    if let Some(fragment) = fragments.get(name) {
                        collect_root_fields(
                            &fragment.node.selection_set.node,
                            fragments,
                            variables,
                            visited,
                            fields,
                        );
                    }
                }
            }
        }
    }
}

pub fn print_operation(
    name: Option<&Name>,
    operation: &OperationDefinition,
    fragments: &Fragments,
) -> String {
    let mut used_fragments = Vec::new();
    let mut seen = HashSet::new();
    collect_fragments(
        &operation.selection_set.node,
        fragments,
        &mut seen,
        &mut used_fragments,
    );

    let mut used_variables = HashSet::new();
    collect_directive_variables(&operation.directives, &mut used_variables);
    collect_variables(&operation.selection_set.node, &mut used_variables);
    for fragment in used_fragments.iter().filter_map(|n| fragments.get(n)) {
        collect_directive_variables(&fragment.node.directives, &mut used_variables);
        collect_variables(&fragment.node.selection_set.node, &mut used_variables);
    }

    let mut out = String::new();
    out.push_str(match operation.ty {
        OperationType::Query => "query",
        OperationType::Mutation => "mutation",
        OperationType::Subscription => "subscription",
    });
    if let Some(name) = name {
        let _ = write!(out, " {name}");
    }

    let definitions: Vec<_> = operation
        .variable_definitions
        .iter()
        .filter(|d| used_variables.contains(d.node.name.node.as_str()))
        .collect();
    if !definitions.is_empty() {
        out.push('(');
        for (i, definition) in definitions.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(
                out,
                "${}: {}",
                definition.node.name.node, definition.node.var_type.node
            );
            if let Some(default) = &definition.node.default_value {
                let _ = write!(out, " = {}", default.node);
            }
        }
        out.push(')');
    }

    write_directives(&mut out, &operation.directives);
    out.push(' ');
    write_selection_set(&mut out, &operation.selection_set.node);

    for name in &used_fragments {
        if let Some(fragment) = fragments.get(name) {
            let _ = write!(
                out,
                "\nfragment {} on {}",
                name, fragment.node.type_condition.node.on.node
            );
            write_directives(&mut out, &fragment.node.directives);
            out.push(' ');
            write_selection_set(&mut out, &fragment.node.selection_set.node);
        }
    }

    out
}

fn collect_fragments(
    set: &SelectionSet,
    fragments: &Fragments,
    seen: &mut HashSet<Name>,
    used: &mut Vec<Name>,
) {
    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                collect_fragments(&field.node.selection_set.node, fragments, seen, used)
            }
            Selection::InlineFragment(fragment) => {
                collect_fragments(&fragment.node.selection_set.node, fragments, seen, used)
            }
            Selection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                if seen.insert(name.clone()) {
                    if let Some(fragment) = fragments.get(name) {
                        used.push(name.clone());
                        collect_fragments(&fragment.node.selection_set.node, fragments, seen, used);
                    }
                }
            }
        }
    }
}

fn collect_variables(set: &SelectionSet, out: &mut HashSet<String>) {
    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                for (_, value) in &field.node.arguments {
                    value_variables(&value.node, out);
                }
                collect_directive_variables(&field.node.directives, out);
                collect_variables(&field.node.selection_set.node, out);
            }
            Selection::InlineFragment(fragment) => {
                collect_directive_variables(&fragment.node.directives, out);
                collect_variables(&fragment.node.selection_set.node, out);
            }
            Selection::FragmentSpread(spread) => {
                collect_directive_variables(&spread.node.directives, out);
            }
        }
    }
}

fn collect_directive_variables(directives: &[Positioned<Directive>], out: &mut HashSet<String>) {
    for directive in directives.iter().filter(|d| is_printed(&d.node)) {
        for (_, value) in &directive.node.arguments {
            value_variables(&value.node, out);
        }
    }
}

fn value_variables(value: &GqlValue, out: &mut HashSet<String>) {
    match value {
        GqlValue::Variable(name) => {
            out.insert(name.to_string());
        }
        GqlValue::List(items) => items.iter().for_each(|v| value_variables(v, out)),
        GqlValue::Object(fields) => fields.values().for_each(|v| value_variables(v, out)),
        _ => {}
    }
}

fn is_printed(directive: &Directive) -> bool {
    !TRANSPORT_DIRECTIVES.contains(&directive.name.node.as_str())
}

fn write_directives(out: &mut String, directives: &[Positioned<Directive>]) {
    for directive in directives.iter().filter(|d| is_printed(&d.node)) {
        let _ = write!(out, " @{}", directive.node.name.node);
        write_arguments(out, &directive.node.arguments);
    }
}

fn write_arguments(out: &mut String, arguments: &[(Positioned<Name>, Positioned<GqlValue>)]) {
    if arguments.is_empty() {
        return;
    }
    out.push('(');
    for (i, (name, value)) in arguments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}: {}", name.node, value.node);
    }
    out.push(')');
}

fn write_selection_set(out: &mut String, set: &SelectionSet) {
    out.push('{');
    for item in &set.items {
        out.push(' ');
        match &item.node {
            Selection::Field(field) => {
                let field = &field.node;
                if let Some(alias) = &field.alias {
                    let _ = write!(out, "{}: ", alias.node);
                }
                out.push_str(field.name.node.as_str());
                write_arguments(out, &field.arguments);
                write_directives(out, &field.directives);
                if !field.selection_set.node.items.is_empty() {
                    out.push(' ');
                    write_selection_set(out, &field.selection_set.node);
                }
            }
            Selection::FragmentSpread(spread) => {
                let _ = write!(out, "...{}", spread.node.fragment_name.node);
                write_directives(out, &spread.node.directives);
            }
            Selection::InlineFragment(fragment) => {
                out.push_str("...");
                if let Some(condition) = &fragment.node.type_condition {
                    let _ = write!(out, " on {}", condition.node.on.node);
                }
                write_directives(out, &fragment.node.directives);
                out.push(' ');
                write_selection_set(out, &fragment.node.selection_set.node);
            }
        }
    }
    out.push_str(" }");
}
