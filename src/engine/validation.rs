use std::collections::{HashMap, HashSet};

use async_graphql::ServerError;
use async_graphql_parser::types::{
    BaseType, Directive, DocumentOperations, ExecutableDocument, OperationDefinition,
    OperationType, Selection, SelectionSet, Type, TypeKind, TypeSystemDefinition,
};
use async_graphql_parser::{Pos, Positioned};
use async_graphql_value::{Name, Value as GqlValue};
use serde_json::{Map, Value};
use tracing::warn;

use super::document::{find_directive, select_operation, Fragments, DEFER, LIVE, STREAM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    pub no_live_mixed_with_defer_stream: bool,
    pub one_of_input_objects: bool,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            no_live_mixed_with_defer_stream: true,
            one_of_input_objects: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct FieldShape {
    ty: String,
    list: bool,
    args: HashMap<String, String>,
}

#[derive(Debug, Default, Clone)]
struct InputShape {
    one_of: bool,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SchemaIndex {
    objects: HashMap<String, HashMap<String, FieldShape>>,
    inputs: HashMap<String, InputShape>,
    query: String,
    mutation: String,
    subscription: String,
}

impl SchemaIndex {
    pub fn from_sdl(sdl: &str) -> Self {
        let mut index = SchemaIndex {
            objects: HashMap::new(),
            inputs: HashMap::new(),
            query: "Query".into(),
            mutation: "Mutation".into(),
            subscription: "Subscription".into(),
        };

        let document = match async_graphql_parser::parse_schema(sdl) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "schema sdl did not parse; one-of checks disabled");
                return index;
            }
        };

        for definition in document.definitions {
            match definition {
                TypeSystemDefinition::Schema(schema) => {
                    let schema = schema.node;
                    if let Some(query) = schema.query {
                        index.query = query.node.to_string();
                    }
                    if let Some(mutation) = schema.mutation {
                        index.mutation = mutation.node.to_string();
                    }
                    if let Some(subscription) = schema.subscription {
                        index.subscription = subscription.node.to_string();
                    }
                }
                TypeSystemDefinition::Type(ty) => {
                    let ty = ty.node;
                    let name = ty.name.node.to_string();
                    let one_of = ty
                        .directives
                        .iter()
                        .any(|d| d.node.name.node.as_str() == "oneOf");
                    match ty.kind {
                        TypeKind::Object(object) => {
                            index.objects.entry(name).or_default().extend(
                                object.fields.into_iter().map(|field| {
                                    let field = field.node;
                                    let shape = FieldShape {
                                        ty: named_type(&field.ty.node).to_string(),
                                        list: matches!(field.ty.node.base, BaseType::List(_)),
                                        args: field
                                            .arguments
                                            .into_iter()
                                            .map(|arg| {
                                                (
                                                    arg.node.name.node.to_string(),
                                                    named_type(&arg.node.ty.node).to_string(),
                                                )
                                            })
                                            .collect(),
                                    };
                                    (field.name.node.to_string(), shape)
                                }),
                            );
                        }
                        TypeKind::Interface(interface) => {
                            index.objects.entry(name).or_default().extend(
                                interface.fields.into_iter().map(|field| {
                                    let field = field.node;
                                    let shape = FieldShape {
                                        ty: named_type(&field.ty.node).to_string(),
                                        list: matches!(field.ty.node.base, BaseType::List(_)),
                                        args: field
                                            .arguments
                                            .into_iter()
                                            .map(|arg| {
                                                (
                                                    arg.node.name.node.to_string(),
                                                    named_type(&arg.node.ty.node).to_string(),
                                                )
                                            })
                                            .collect(),
                                    };
                                    (field.name.node.to_string(), shape)
                                }),
                            );
                        }
                        TypeKind::InputObject(input) => {
                            let entry = index.inputs.entry(name).or_default();
                            entry.one_of |= one_of;
                            entry.fields.extend(input.fields.into_iter().map(|field| {
                                (
                                    field.node.name.node.to_string(),
                                    named_type(&field.node.ty.node).to_string(),
                                )
                            }));
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        index
    }

    pub fn is_one_of(&self, input_type: &str) -> bool {
        self.inputs.get(input_type).map(|i| i.one_of).unwrap_or(false)
    }

    fn root(&self, ty: OperationType) -> &str {
        match ty {
            OperationType::Query => &self.query,
            OperationType::Mutation => &self.mutation,
            OperationType::Subscription => &self.subscription,
        }
    }

    fn field(&self, parent: &str, name: &str) -> Option<&FieldShape> {
        self.objects.get(parent).and_then(|fields| fields.get(name))
    }
}

fn named_type(ty: &Type) -> &str {
    match &ty.base {
        BaseType::Named(name) => name.as_str(),
        BaseType::List(inner) => named_type(inner),
    }
}

pub fn validate(
    document: &ExecutableDocument,
    operation_name: Option<&str>,
    variables: &Map<String, Value>,
    index: &SchemaIndex,
    rules: &ValidationRules,
) -> Vec<ServerError> {
    let mut errors = Vec::new();

    let mut document_rules = DocumentRules {
        index,
        errors: &mut errors,
    };
    document_rules.check(document);

    if rules.no_live_mixed_with_defer_stream {
        for operation in operations(document) {
            no_live_mixed_with_defer_stream(&operation.node, &document.fragments, &mut errors);
        }
    }

    if rules.one_of_input_objects {
        if let Ok((_, operation)) = select_operation(document, operation_name) {
            let checker = OneOfInputObjects {
                index,
                fragments: &document.fragments,
                variables,
                variable_types: operation
                    .node
                    .variable_definitions
                    .iter()
                    .map(|d| {
                        (
                            d.node.name.node.to_string(),
                            named_type(&d.node.var_type.node).to_string(),
                        )
                    })
                    .collect(),
            };
            let mut visited = HashSet::new();
            checker.check_set(
                &operation.node.selection_set.node,
                index.root(operation.node.ty),
                &mut visited,
                &mut errors,
            );
        }
    }

    errors
}

fn operations(document: &ExecutableDocument) -> Vec<&Positioned<OperationDefinition>> {
    named_operations(document)
        .into_iter()
        .map(|(_, operation)| operation)
        .collect()
}

fn named_operations(
    document: &ExecutableDocument,
) -> Vec<(Option<&Name>, &Positioned<OperationDefinition>)> {
    match &document.operations {
        DocumentOperations::Single(operation) => vec![(None, operation)],
        DocumentOperations::Multiple(operations) => operations
            .iter()
            .map(|(name, operation)| (Some(name), operation))
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Query,
    Mutation,
    Subscription,
    Field,
    FragmentDefinition,
    FragmentSpread,
    InlineFragment,
}

impl Location {
    fn as_str(self) -> &'static str {
        match self {
            Location::Query => "QUERY",
            Location::Mutation => "MUTATION",
            Location::Subscription => "SUBSCRIPTION",
            Location::Field => "FIELD",
            Location::FragmentDefinition => "FRAGMENT_DEFINITION",
            Location::FragmentSpread => "FRAGMENT_SPREAD",
            Location::InlineFragment => "INLINE_FRAGMENT",
        }
    }

    fn allows(self, directive: &str) -> bool {
        match directive {
            LIVE => self == Location::Query,
            DEFER => matches!(self, Location::FragmentSpread | Location::InlineFragment),
            STREAM => self == Location::Field,
            _ => true,
        }
    }
}

struct DocumentRules<'a> {
    index: &'a SchemaIndex,
    errors: &'a mut Vec<ServerError>,
}

impl<'a> DocumentRules<'a> {
    fn check(&mut self, document: &ExecutableDocument) {
        let index = self.index;
        let mut reachable = HashSet::new();

        for (name, operation) in named_operations(document) {
            let operation = &operation.node;
            let location = match operation.ty {
                OperationType::Query => Location::Query,
                OperationType::Mutation => Location::Mutation,
                OperationType::Subscription => Location::Subscription,
            };
            self.directives(&operation.directives, location);
            self.selection_set(&operation.selection_set.node, Some(index.root(operation.ty)));

            let mut spread = HashSet::new();
            let mut used = HashSet::new();
            directive_variables(&operation.directives, &mut used);
            used_in_set(
                &operation.selection_set.node,
                &document.fragments,
                &mut spread,
                &mut used,
            );
            for definition in &operation.variable_definitions {
                let variable = definition.node.name.node.as_str();
                if used.contains(variable) {
                    continue;
                }
                let message = match name {
                    Some(name) => {
                        format!("Variable \"${variable}\" is never used in operation \"{name}\".")
                    }
                    None => format!("Variable \"${variable}\" is never used."),
                };
                self.errors.push(ServerError::new(message, Some(definition.pos)));
            }
            reachable.extend(spread);
        }

        for (name, fragment) in &document.fragments {
            if !reachable.contains(name) {
                self.errors.push(ServerError::new(
                    format!("Fragment \"{name}\" is never used."),
                    Some(fragment.pos),
                ));
            }
            self.directives(&fragment.node.directives, Location::FragmentDefinition);
            self.selection_set(
                &fragment.node.selection_set.node,
                Some(fragment.node.type_condition.node.on.node.as_str()),
            );
        }
    }

    fn directives(&mut self, directives: &[Positioned<Directive>], location: Location) {
        for directive in directives {
            let name = directive.node.name.node.as_str();
            if !location.allows(name) {
                self.errors.push(ServerError::new(
                    format!(
                        "Directive \"@{name}\" may not be used on {}.",
                        location.as_str()
                    ),
                    Some(directive.pos),
                ));
            }
        }
    }

    fn selection_set(&mut self, set: &SelectionSet, parent: Option<&str>) {
        for item in &set.items {
            match &item.node {
                Selection::Field(field) => {
                    let field_name = field.node.name.node.as_str();
                    self.directives(&field.node.directives, Location::Field);
                    let shape = match parent {
                        Some(parent) if !field_name.starts_with("__") => {
                            self.field(parent, field_name, field.pos)
                        }
                        _ => None,
                    };
                    if let (Some(shape), Some(stream)) =
                        (shape, find_directive(&field.node.directives, STREAM))
                    {
                        if !shape.list {
                            self.errors.push(ServerError::new(
                                format!(
                                    "Stream directive cannot be used on non-list field \"{field_name}\" on type \"{}\".",
                                    parent.unwrap_or_default()
                                ),
                                Some(stream.pos),
                            ));
                        }
                    }
                    let child = shape.map(|shape| shape.ty.as_str());
                    self.selection_set(&field.node.selection_set.node, child);
                }
                Selection::InlineFragment(fragment) => {
                    self.directives(&fragment.node.directives, Location::InlineFragment);
                    let ty = match &fragment.node.type_condition {
                        Some(condition) => Some(condition.node.on.node.as_str()),
                        None => parent,
                    };
                    self.selection_set(&fragment.node.selection_set.node, ty);
                }
                Selection::FragmentSpread(spread) => {
                    self.directives(&spread.node.directives, Location::FragmentSpread);
                }
            }
        }
    }

    fn field(&mut self, parent: &str, name: &str, pos: Pos) -> Option<&'a FieldShape> {
        // Unions and scalars are not indexed; their selections are left to the schema.
        let index: &'a SchemaIndex = self.index;
        let fields = index.objects.get(parent)?;
        let shape = fields.get(name);
        if shape.is_none() {
            self.errors.push(ServerError::new(
                format!("Unknown field \"{name}\" on type \"{parent}\"."),
                Some(pos),
            ));
        }
        shape
    }
}

fn used_in_set(
    set: &SelectionSet,
    fragments: &Fragments,
    spread: &mut HashSet<Name>,
    used: &mut HashSet<String>,
) {
    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                for (_, value) in &field.node.arguments {
                    value_variables(&value.node, used);
                }
                directive_variables(&field.node.directives, used);
                used_in_set(&field.node.selection_set.node, fragments, spread, used);
            }
            Selection::InlineFragment(fragment) => {
                directive_variables(&fragment.node.directives, used);
                used_in_set(&fragment.node.selection_set.node, fragments, spread, used);
            }
            Selection::FragmentSpread(fragment_spread) => {
                directive_variables(&fragment_spread.node.directives, used);
                let name = &fragment_spread.node.fragment_name.node;
                if spread.insert(name.clone()) {
                    if let Some(fragment) = fragments.get(name) {
                        directive_variables(&fragment.node.directives, used);
                        used_in_set(&fragment.node.selection_set.node, fragments, spread, used);
                    }
                }
            }
        }
    }
}

fn directive_variables(directives: &[Positioned<Directive>], used: &mut HashSet<String>) {
    for directive in directives {
        for (_, value) in &directive.node.arguments {
            value_variables(&value.node, used);
        }
    }
}

fn value_variables(value: &GqlValue, used: &mut HashSet<String>) {
    match value {
        GqlValue::Variable(name) => {
            used.insert(name.to_string());
        }
        GqlValue::List(items) => items.iter().for_each(|v| value_variables(v, used)),
        GqlValue::Object(fields) => fields.values().for_each(|v| value_variables(v, used)),
        _ => {}
    }
}

fn no_live_mixed_with_defer_stream(
    operation: &OperationDefinition,
    fragments: &Fragments,
    errors: &mut Vec<ServerError>,
) {
    if find_directive(&operation.directives, LIVE).is_none() {
        return;
    }
    let mut visited = HashSet::new();
    report_incremental(&operation.selection_set.node, fragments, &mut visited, errors);
}

fn report_incremental(
    set: &SelectionSet,
    fragments: &Fragments,
    visited: &mut HashSet<Name>,
    errors: &mut Vec<ServerError>,
) {
    let report = |directives: &[Positioned<Directive>], errors: &mut Vec<ServerError>| {
        for name in [DEFER, STREAM] {
            if let Some(directive) = find_directive(directives, name) {
                errors.push(ServerError::new(
                    format!("Cannot mix \"@{name}\" with \"@live\"."),
                    Some(directive.pos),
                ));
            }
        }
    };

    for item in &set.items {
        match &item.node {
            Selection::Field(field) => {
                report(&field.node.directives, errors);
                report_incremental(&field.node.selection_set.node, fragments, visited, errors);
            }
            Selection::InlineFragment(fragment) => {
                report(&fragment.node.directives, errors);
                report_incremental(&fragment.node.selection_set.node, fragments, visited, errors);
            }
            Selection::FragmentSpread(spread) => {
                report(&spread.node.directives, errors);
                let name = &spread.node.fragment_name.node;
                if visited.insert(name.clone()) {
                    if let Some(fragment) = fragments.get(name) {
                        report_incremental(
                            &fragment.node.selection_set.node,
                            fragments,
                            visited,
                            errors,
                        );
                    }
                }
            }
        }
    }
}

struct OneOfInputObjects<'a> {
    index: &'a SchemaIndex,
    fragments: &'a Fragments,
    variables: &'a Map<String, Value>,
    variable_types: HashMap<String, String>,
}

impl OneOfInputObjects<'_> {
    fn check_set(
        &self,
        set: &SelectionSet,
        parent: &str,
        visited: &mut HashSet<Name>,
        errors: &mut Vec<ServerError>,
    ) {
        for item in &set.items {
            match &item.node {
                Selection::Field(field) => {
                    let Some(shape) = self.index.field(parent, field.node.name.node.as_str())
                    else {
                        continue;
                    };
                    for (name, value) in &field.node.arguments {
                        if let Some(input_type) = shape.args.get(name.node.as_str()) {
                            self.check_value(&value.node, input_type, value.pos, errors);
                        }
                    }
                    self.check_set(&field.node.selection_set.node, &shape.ty, visited, errors);
                }
                Selection::InlineFragment(fragment) => {
                    let ty = fragment
                        .node
                        .type_condition
                        .as_ref()
                        .map(|c| c.node.on.node.as_str())
                        .unwrap_or(parent);
                    self.check_set(&fragment.node.selection_set.node, ty, visited, errors);
                }
                Selection::FragmentSpread(spread) => {
                    let name = &spread.node.fragment_name.node;
                    if !visited.insert(name.clone()) {
                        continue;
                    }
                    if let Some(fragment) = self.fragments.get(name) {
                        self.check_set(
                            &fragment.node.selection_set.node,
                            fragment.node.type_condition.node.on.node.as_str(),
                            visited,
                            errors,
                        );
                    }
                }
            }
        }
    }

    fn check_value(
        &self,
        value: &GqlValue,
        input_type: &str,
        pos: Pos,
        errors: &mut Vec<ServerError>,
    ) {
        match value {
            GqlValue::List(items) => {
                for item in items {
                    self.check_value(item, input_type, pos, errors);
                }
            }
            GqlValue::Object(fields) => {
                if self.index.is_one_of(input_type) {
                    let populated = fields.values().filter(|v| !self.is_null(v)).count();
                    if populated != 1 {
                        errors.push(one_of_error(input_type, pos));
                    }
                }
                if let Some(input) = self.index.inputs.get(input_type) {
                    for (name, nested) in fields {
                        if let Some(nested_type) = input.fields.get(name.as_str()) {
                            self.check_value(nested, nested_type, pos, errors);
                        }
                    }
                }
            }
            GqlValue::Variable(name) => {
                let declared = self.variable_types.get(name.as_str());
                if declared.map(String::as_str) != Some(input_type) {
                    return;
                }
                self.check_json(self.variables.get(name.as_str()), input_type, pos, errors);
            }
            _ => {}
        }
    }

    fn check_json(
        &self,
        value: Option<&Value>,
        input_type: &str,
        pos: Pos,
        errors: &mut Vec<ServerError>,
    ) {
        match value {
            Some(Value::Array(items)) => {
                for item in items {
                    self.check_json(Some(item), input_type, pos, errors);
                }
            }
            Some(Value::Object(fields)) => {
                if self.index.is_one_of(input_type) {
                    let populated = fields.values().filter(|v| !v.is_null()).count();
                    if populated != 1 {
                        errors.push(one_of_error(input_type, pos));
                    }
                }
                if let Some(input) = self.index.inputs.get(input_type) {
                    for (name, nested) in fields {
                        if let Some(nested_type) = input.fields.get(name) {
                            self.check_json(Some(nested), nested_type, pos, errors);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn is_null(&self, value: &GqlValue) -> bool {
        match value {
            GqlValue::Null => true,
            GqlValue::Variable(name) => self
                .variables
                .get(name.as_str())
                .map(Value::is_null)
                .unwrap_or(true),
            _ => false,
        }
    }
}

fn one_of_error(input_type: &str, pos: Pos) -> ServerError {
    ServerError::new(
        format!("OneOf Input Object \"{input_type}\" must specify exactly one key."),
        Some(pos),
    )
}
