//! Binding expressions.
//!
//! A binding reads a dotted path (or a `${...}` template) from a source
//! entity and folds the result through its filters. Filters return a new
//! binding with a fresh id; the original is unchanged.

use std::fmt;
use std::rc::Rc;

use crate::container::ManagedMap;
use crate::model::{BindingId, EntityId, Value};
use crate::Graph;

type MapFn = Rc<dyn Fn(&Value) -> Value>;

#[derive(Clone)]
enum Source {
    Path(Vec<String>),
    Template(Vec<Part>),
}

#[derive(Clone)]
enum Part {
    Text(String),
    Nested(Binding),
}

#[derive(Clone)]
enum Filter {
    Not,
    Truthy,
    Format(String),
    OrElse(Value),
    Then(Value),
    And(Binding),
    Or(Binding),
    Map(MapFn),
}

struct BindingDef {
    id: BindingId,
    source: Source,
    default: Option<Value>,
    filters: Vec<Filter>,
}

/// Shared binding handle.
#[derive(Clone)]
pub struct Binding(Rc<BindingDef>);

fn parse_path(path: &str) -> Vec<String> {
    path.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

impl Binding {
    fn from_parts(source: Source, default: Option<Value>, filters: Vec<Filter>) -> Self {
        Self(Rc::new(BindingDef { id: BindingId::next(), source, default, filters }))
    }

    /// Bind to a dotted path. A leading `!` negates the value, `!!` coerces
    /// it to a boolean.
    pub fn new(path: &str) -> Self {
        let path = path.trim();
        if let Some(rest) = path.strip_prefix("!!") {
            return Self::from_parts(Source::Path(parse_path(rest)), None, vec![Filter::Truthy]);
        }
        if let Some(rest) = path.strip_prefix('!') {
            return Self::from_parts(Source::Path(parse_path(rest)), None, vec![Filter::Not]);
        }
        Self::from_parts(Source::Path(parse_path(path)), None, Vec::new())
    }

    /// Bind to a path, reading `default` while the path is null.
    pub fn with_default(path: &str, default: impl Into<Value>) -> Self {
        let base = Self::new(path);
        Self::from_parts(base.0.source.clone(), Some(default.into()), base.0.filters.clone())
    }

    /// Interpolate `${path}` segments into a string. An unterminated `${`
    /// is kept as text.
    pub fn template(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            let Some(len) = rest[start + 2..].find('}') else {
                break;
            };
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_string()));
            }
            parts.push(Part::Nested(Binding::new(&rest[start + 2..start + 2 + len])));
            rest = &rest[start + 3 + len..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        Self::from_parts(Source::Template(parts), None, Vec::new())
    }

    fn with_filter(&self, filter: Filter) -> Self {
        let mut filters = self.0.filters.clone();
        filters.push(filter);
        Self::from_parts(self.0.source.clone(), self.0.default.clone(), filters)
    }

    pub fn not(&self) -> Self {
        self.with_filter(Filter::Not)
    }

    pub fn truthy(&self) -> Self {
        self.with_filter(Filter::Truthy)
    }

    /// Substitute the value's text for every `{}` in `pattern`.
    pub fn format(&self, pattern: &str) -> Self {
        self.with_filter(Filter::Format(pattern.to_string()))
    }

    /// Replace a null result.
    pub fn or_else(&self, value: impl Into<Value>) -> Self {
        self.with_filter(Filter::OrElse(value.into()))
    }

    /// `value` when the result is truthy, null otherwise.
    pub fn then(&self, value: impl Into<Value>) -> Self {
        self.with_filter(Filter::Then(value.into()))
    }

    /// `other` when the result is truthy, the result otherwise.
    pub fn and(&self, other: &Binding) -> Self {
        self.with_filter(Filter::And(other.clone()))
    }

    /// The result when truthy, `other` otherwise.
    pub fn or(&self, other: &Binding) -> Self {
        self.with_filter(Filter::Or(other.clone()))
    }

    pub fn map(&self, f: impl Fn(&Value) -> Value + 'static) -> Self {
        self.with_filter(Filter::Map(Rc::new(f)))
    }

    pub fn id(&self) -> BindingId {
        self.0.id
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.0.default.as_ref()
    }

    /// Top-level properties of the source this binding reads, nested
    /// bindings included.
    pub fn dependencies(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_dependencies(&mut out);
        out
    }

    fn collect_dependencies(&self, out: &mut Vec<String>) {
        match &self.0.source {
            Source::Path(path) => {
                if let Some(first) = path.first() {
                    if !out.contains(first) {
                        out.push(first.clone());
                    }
                }
            }
            Source::Template(parts) => {
                for part in parts {
                    if let Part::Nested(nested) = part {
                        nested.collect_dependencies(out);
                    }
                }
            }
        }
        for filter in &self.0.filters {
            if let Filter::And(other) | Filter::Or(other) = filter {
                other.collect_dependencies(out);
            }
        }
    }

    pub fn depends_on(&self, property: &str) -> bool {
        self.dependencies().iter().any(|d| d == property)
    }

    /// Evaluate against `source`.
    pub fn read(&self, graph: &Graph, source: EntityId) -> Value {
        let raw = match &self.0.source {
            Source::Path(path) => walk(graph, source, path),
            Source::Template(parts) => {
                let text: String = parts
                    .iter()
                    .map(|part| match part {
                        Part::Text(text) => text.clone(),
                        Part::Nested(nested) => nested.read(graph, source).to_text(),
                    })
                    .collect();
                Value::String(text)
            }
        };
        let raw = match (&raw, &self.0.default) {
            (Value::Null, Some(default)) => default.clone(),
            _ => raw,
        };
        self.0.filters.iter().fold(raw, |value, filter| apply(filter, graph, source, value))
    }
}

fn apply(filter: &Filter, graph: &Graph, source: EntityId, value: Value) -> Value {
    match filter {
        Filter::Not => Value::Bool(!value.is_truthy()),
        Filter::Truthy => Value::Bool(value.is_truthy()),
        Filter::Format(pattern) => Value::String(pattern.replace("{}", &value.to_text())),
        Filter::OrElse(fallback) if value.is_null() => fallback.clone(),
        Filter::OrElse(_) => value,
        Filter::Then(result) if value.is_truthy() => result.clone(),
        Filter::Then(_) => Value::Null,
        Filter::And(other) if value.is_truthy() => other.read(graph, source),
        Filter::And(_) => value,
        Filter::Or(_) if value.is_truthy() => value,
        Filter::Or(other) => other.read(graph, source),
        Filter::Map(f) => f(&value),
    }
}

/// Follow `path` from `source` through entity properties, map containers
/// and map values. Anything unresolvable reads as null.
fn walk(graph: &Graph, source: EntityId, path: &[String]) -> Value {
    let mut current = Value::Entity(source);
    for segment in path {
        current = match current {
            Value::Entity(id) => lookup(graph, id, segment),
            Value::Map(mut map) => map.remove(segment).unwrap_or_default(),
            _ => return Value::Null,
        };
    }
    current
}

fn lookup(graph: &Graph, id: EntityId, segment: &str) -> Value {
    if let Ok(map) = ManagedMap::from_entity(graph, id) {
        if let Some(target) = map.get(segment) {
            return Value::Entity(target);
        }
    }
    graph.get(id, segment).unwrap_or_default()
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.0.id)
            .field("dependencies", &self.dependencies())
            .field("filters", &self.0.filters.len())
            .finish()
    }
}
