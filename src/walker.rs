//! Lazy evaluation of heap path expressions.
//!
//! A path is applied left to right to a set of current results, seeded with
//! one instance. Every step is a lazy stage in an iterator pipeline, so
//! `walk_first` on a path over a large array only decodes what it needs.
//!
//! Nulls are results: `[*]` yields null slots, and a later field step skips
//! them silently. Steps that match nothing produce an empty walk, never an
//! error. Once a step can yield several candidates (`[*]`, `[k=v]`, `?view`,
//! `*`), candidates of the wrong shape for a later step (missing field,
//! scalar, non-array) are dropped instead of failing the walk. On a
//! single-candidate chain the same mismatch is an error, reported before
//! anything is yielded. Errors end the walk after being reported once.

use log::debug;
use std::collections::HashSet;
use std::fmt;
use std::iter::{self, FusedIterator};
use std::rc::Rc;

use crate::config::WalkerConfig;
use crate::convert::{JavaValue, convert_instance};
use crate::error::{HeapError, HeapResult, QueryError, QueryResult};
use crate::heap::Heap;
use crate::instance::{Instance, InstanceKind};
use crate::path::{HeapPath, Selector, Step, Target, TypeFilter};
use crate::pattern::ClassPattern;
use crate::types::{ObjectId, Value};
use crate::views::{SyntheticEntry, ViewRegistry, value_hit};

/// One result of a walk.
#[derive(Debug, Clone)]
pub enum Hit<'h> {
    Null,
    Instance(Instance<'h>),
    Scalar(Value),
    /// A pseudo-instance synthesized by a view, e.g. a map entry.
    Entry(Rc<SyntheticEntry<'h>>),
}

impl<'h> Hit<'h> {
    pub fn is_null(&self) -> bool {
        matches!(self, Hit::Null)
    }

    pub fn as_instance(&self) -> Option<&Instance<'h>> {
        match self {
            Hit::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    /// Runtime class of instances and entries; `None` for null and scalars.
    pub fn class_name(&self) -> HeapResult<Option<String>> {
        Ok(match self {
            Hit::Instance(instance) => Some(instance.class_name()?.to_string()),
            Hit::Entry(entry) => Some(entry.class_name.clone()),
            Hit::Null | Hit::Scalar(_) => None,
        })
    }

    /// Native form of scalars, strings, primitive wrappers and primitive
    /// arrays. Null and other references yield `None`.
    pub fn java_value(&self) -> HeapResult<Option<JavaValue>> {
        match self {
            Hit::Null | Hit::Entry(_) => Ok(None),
            Hit::Scalar(value) => Ok(JavaValue::from_scalar(*value)),
            Hit::Instance(instance) => convert_instance(instance),
        }
    }

    /// Human-readable text: converted values as Java prints them, other
    /// references as `class@id`, entries as `key=value`.
    pub fn render(&self) -> HeapResult<String> {
        if let Some(value) = self.java_value()? {
            return Ok(value.to_string());
        }
        Ok(match self {
            Hit::Null => "null".to_string(),
            Hit::Scalar(value) => value.to_string(),
            Hit::Instance(instance) => format!("{}@{}", instance.class_name()?, instance.id()),
            Hit::Entry(entry) => {
                let mut parts = Vec::with_capacity(entry.fields.len());
                for (_, value) in &entry.fields {
                    parts.push(value_hit(entry.heap, *value)?.render()?);
                }
                parts.join("=")
            }
        })
    }
}

type HitIter<'h> = Box<dyn Iterator<Item = QueryResult<Hit<'h>>> + 'h>;

fn single<'h>(item: QueryResult<Hit<'h>>) -> HitIter<'h> {
    Box::new(iter::once(item))
}

fn nothing<'h>() -> HitIter<'h> {
    Box::new(iter::empty())
}

/// Lazy result sequence of one path evaluation. Yields at most one error,
/// after which it is exhausted.
pub struct Walk<'h> {
    inner: HitIter<'h>,
    failed: bool,
}

impl<'h> Iterator for Walk<'h> {
    type Item = QueryResult<Hit<'h>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.inner.next()?;
        self.failed = item.is_err();
        Some(item)
    }
}

impl FusedIterator for Walk<'_> {}

impl fmt::Debug for Walk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walk").field("failed", &self.failed).finish()
    }
}

/// Path evaluator with its configuration and view registry.
#[derive(Clone, Default)]
pub struct Walker {
    config: WalkerConfig,
    views: ViewRegistry,
}

impl Walker {
    pub fn new(config: WalkerConfig) -> Self {
        Self {
            config,
            views: ViewRegistry::with_defaults(),
        }
    }

    pub fn with_views(mut self, views: ViewRegistry) -> Self {
        self.views = views;
        self
    }

    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    pub fn views_mut(&mut self) -> &mut ViewRegistry {
        &mut self.views
    }

    /// Parses `path` and evaluates it lazily from `root`. Syntax errors are
    /// reported here, before any evaluation.
    pub fn walk<'h>(&self, root: &Instance<'h>, path: &str) -> QueryResult<Walk<'h>> {
        let path = HeapPath::parse(path)?;
        Ok(self.walk_path(root, &path))
    }

    pub fn walk_path<'h>(&self, root: &Instance<'h>, path: &HeapPath) -> Walk<'h> {
        debug!("walking '{path}' from {}", root.id());
        let eval = Rc::new(Evaluation {
            path: path.clone(),
            views: self.views.clone(),
            reach_limit: self.config.reach_limit,
        });
        let mut hits: HitIter<'h> = single(Ok(Hit::Instance(root.clone())));
        for index in 0..path.steps().len() {
            let eval = Rc::clone(&eval);
            hits = Box::new(hits.flat_map(move |hit| match hit {
                Ok(hit) => apply(&eval, index, hit),
                Err(e) => single(Err(e)),
            }));
        }
        Walk {
            inner: hits,
            failed: false,
        }
    }

    /// First result, or `None` when the walk is empty.
    pub fn walk_first<'h>(&self, root: &Instance<'h>, path: &str) -> QueryResult<Option<Hit<'h>>> {
        self.walk(root, path)?.next().transpose()
    }

    /// First result unwrapped to native form. Null yields `None`; a
    /// reference that does not convert is an error.
    pub fn value_of(&self, root: &Instance<'_>, path: &str) -> QueryResult<Option<JavaValue>> {
        let path = HeapPath::parse(path)?;
        let Some(hit) = self.walk_path(root, &path).next().transpose()? else {
            return Ok(None);
        };
        let converted = hit.java_value().and_then(|value| {
            if value.is_some() || hit.is_null() {
                return Ok(Ok(value));
            }
            hit.class_name().map(|class| Err(class.unwrap_or_default()))
        });
        let last_step = path
            .steps()
            .last()
            .map(|s| s.text.clone())
            .unwrap_or_default();
        match converted {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(class)) => Err(QueryError::NotConvertible {
                path: path.to_string(),
                class,
            }),
            Err(source) => Err(QueryError::Heap {
                path: path.to_string(),
                step: last_step,
                source,
            }),
        }
    }

    pub fn string_value(&self, root: &Instance<'_>, path: &str) -> QueryResult<Option<String>> {
        Ok(self.value_of(root, path)?.map(|v| v.to_string()))
    }
}

/// Evaluates `path` from `root` with the default configuration and views.
pub fn walk<'h>(root: &Instance<'h>, path: &str) -> QueryResult<Walk<'h>> {
    Walker::default().walk(root, path)
}

pub fn walk_first<'h>(root: &Instance<'h>, path: &str) -> QueryResult<Option<Hit<'h>>> {
    Walker::default().walk_first(root, path)
}

pub fn value_of(root: &Instance<'_>, path: &str) -> QueryResult<Option<JavaValue>> {
    Walker::default().value_of(root, path)
}

pub fn string_value(root: &Instance<'_>, path: &str) -> QueryResult<Option<String>> {
    Walker::default().string_value(root, path)
}

struct Evaluation {
    path: HeapPath,
    views: ViewRegistry,
    reach_limit: usize,
}

impl Evaluation {
    fn step(&self, index: usize) -> &Step {
        &self.path.steps()[index]
    }

    fn heap_error(&self, index: usize, source: HeapError) -> QueryError {
        let path = self.path.to_string();
        let step = self.step(index).text.clone();
        match source {
            HeapError::IndexOutOfBounds { index, length, .. } => QueryError::OutOfBounds {
                path,
                step,
                index,
                length,
            },
            source => QueryError::Heap { path, step, source },
        }
    }

    /// Whether steps before `index` may have produced several candidates.
    fn fanned_out(&self, index: usize) -> bool {
        self.path.steps()[..index].iter().any(fans_out)
    }

    /// Like `fanned_out`, also counting the field target of step `index`.
    fn targets_many(&self, index: usize) -> bool {
        self.fanned_out(index) || self.step(index).target == Target::AnyField
    }

    fn type_error(&self, index: usize, message: impl Into<String>) -> QueryError {
        QueryError::Type {
            path: self.path.to_string(),
            step: self.step(index).text.clone(),
            message: message.into(),
        }
    }
}

fn fans_out(step: &Step) -> bool {
    step.target == Target::AnyField
        || step.view.is_some()
        || matches!(step.selector, Some(Selector::All | Selector::Match { .. }))
}

fn apply<'h>(eval: &Rc<Evaluation>, index: usize, hit: Hit<'h>) -> HitIter<'h> {
    let targets = match targets(eval, index, hit) {
        Ok(targets) => targets,
        Err(e) => return single(Err(e)),
    };
    let e = Rc::clone(eval);
    let expanded: HitIter<'h> = Box::new(
        targets
            .into_iter()
            .flat_map(move |target| expand(&e, index, target)),
    );
    if eval.step(index).filter.is_none() {
        return expanded;
    }
    let e = Rc::clone(eval);
    Box::new(expanded.filter_map(move |item| {
        let hit = match item {
            Ok(hit) => hit,
            Err(err) => return Some(Err(err)),
        };
        let filter = e.step(index).filter.as_ref()?;
        match keep(&e, &hit, filter) {
            Ok(true) => Some(Ok(hit)),
            Ok(false) => None,
            Err(source) => Some(Err(e.heap_error(index, source))),
        }
    }))
}

/// Field lookup on any hit. `None` when the hit has no such field.
fn field_of<'h>(hit: &Hit<'h>, name: &str) -> HeapResult<Option<Hit<'h>>> {
    match hit {
        Hit::Null | Hit::Scalar(_) => Ok(None),
        Hit::Instance(instance) if instance.is_array() => Ok(match name {
            "length" => instance
                .array_length()
                .map(|len| Hit::Scalar(Value::Int(i32::try_from(len).unwrap_or(i32::MAX)))),
            _ => None,
        }),
        Hit::Instance(instance) => match instance.try_field(name)? {
            Some(value) => value_hit(instance.heap(), value).map(Some),
            None => Ok(None),
        },
        Hit::Entry(entry) => {
            let value = match (entry.field(name), entry.node.as_ref()) {
                (Some(value), _) => Some(value),
                (None, Some(node)) => node.try_field(name)?,
                (None, None) => None,
            };
            value.map(|v| value_hit(entry.heap, v)).transpose()
        }
    }
}

fn targets<'h>(eval: &Evaluation, index: usize, hit: Hit<'h>) -> QueryResult<Vec<Hit<'h>>> {
    let step = eval.step(index);
    if step.target == Target::Current {
        return Ok(vec![hit]);
    }
    match (&step.target, &hit) {
        (_, Hit::Null) => Ok(Vec::new()),
        (_, Hit::Scalar(_)) if eval.fanned_out(index) => Ok(Vec::new()),
        (Target::Field(name), Hit::Scalar(value)) => {
            Err(eval.type_error(index, format!("cannot read field '{name}' of scalar {value}")))
        }
        (Target::AnyField, Hit::Scalar(value)) => {
            Err(eval.type_error(index, format!("scalar {value} has no fields")))
        }
        (Target::Field(name), _) => match field_of(&hit, name) {
            Ok(Some(found)) => Ok(vec![found]),
            Ok(None) if eval.fanned_out(index) => Ok(Vec::new()),
            Ok(None) => {
                let class = hit
                    .class_name()
                    .map_err(|e| eval.heap_error(index, e))?
                    .unwrap_or_default();
                if matches!(&hit, Hit::Instance(i) if i.is_array()) {
                    return Err(eval.type_error(index, format!("array {class} has no field '{name}'")));
                }
                Err(eval.heap_error(
                    index,
                    HeapError::UnknownField {
                        class,
                        field: name.clone(),
                    },
                ))
            }
            Err(e) => Err(eval.heap_error(index, e)),
        },
        (Target::AnyField, _) => all_fields(&hit).map_err(|e| eval.heap_error(index, e)),
        (Target::Current, _) => Ok(vec![hit.clone()]),
    }
}

fn all_fields<'h>(hit: &Hit<'h>) -> HeapResult<Vec<Hit<'h>>> {
    match hit {
        Hit::Instance(instance) => instance
            .field_values()?
            .into_iter()
            .map(|fv| value_hit(instance.heap(), fv.value))
            .collect(),
        Hit::Entry(entry) => entry
            .fields
            .iter()
            .map(|(_, value)| value_hit(entry.heap, *value))
            .collect(),
        Hit::Null | Hit::Scalar(_) => Ok(Vec::new()),
    }
}

/// Applies the step's view and selector to one target.
fn expand<'h>(eval: &Rc<Evaluation>, index: usize, target: Hit<'h>) -> HitIter<'h> {
    let step = eval.step(index);
    if let Some(view) = &step.view {
        let instance = match target {
            Hit::Null => return nothing(),
            Hit::Instance(instance) => instance,
            _ if eval.targets_many(index) => return nothing(),
            other => {
                let what = match other {
                    Hit::Scalar(value) => format!("scalar {value}"),
                    _ => "a view entry".to_string(),
                };
                return single(Err(eval.type_error(index, format!("view '?{view}' cannot open {what}"))));
            }
        };
        let sequence = match eval.views.open(view, &instance) {
            Ok(Some(sequence)) => sequence,
            Ok(None) if eval.targets_many(index) => return nothing(),
            Ok(None) => {
                return single(Err(QueryError::UnknownView {
                    path: eval.path.to_string(),
                    step: step.text.clone(),
                    view: view.clone(),
                    class: instance.class_name().unwrap_or("<unknown>").to_string(),
                }));
            }
            Err(e) => return single(Err(eval.heap_error(index, e))),
        };
        let e = Rc::clone(eval);
        let sequence: HitIter<'h> =
            Box::new(sequence.map(move |item| item.map_err(|err| e.heap_error(index, err))));
        return select_sequence(eval, index, sequence);
    }

    match &step.selector {
        None => single(Ok(target)),
        Some(selector) => select_array(eval, index, target, selector),
    }
}

/// Selector over a logical sequence produced by a view.
fn select_sequence<'h>(eval: &Rc<Evaluation>, index: usize, sequence: HitIter<'h>) -> HitIter<'h> {
    match &eval.step(index).selector {
        None | Some(Selector::All) => sequence,
        Some(Selector::Index(wanted)) => {
            let wanted = *wanted;
            let mut length = 0usize;
            for item in sequence {
                let hit = match item {
                    Ok(hit) => hit,
                    Err(e) => return single(Err(e)),
                };
                if i64::try_from(length).ok() == Some(wanted) {
                    return single(Ok(hit));
                }
                length += 1;
            }
            single(Err(QueryError::OutOfBounds {
                path: eval.path.to_string(),
                step: eval.step(index).text.clone(),
                index: wanted,
                length,
            }))
        }
        Some(Selector::Match { .. }) => keep_matching(eval, index, sequence),
    }
}

/// Selector over the elements of an array target.
fn select_array<'h>(
    eval: &Rc<Evaluation>,
    index: usize,
    target: Hit<'h>,
    selector: &Selector,
) -> HitIter<'h> {
    let array = match target {
        Hit::Null => return nothing(),
        Hit::Instance(instance) if instance.is_array() => instance,
        other => {
            if matches!(selector, Selector::Match { .. }) {
                return keep_matching(eval, index, single(Ok(other)));
            }
            if eval.targets_many(index) {
                return nothing();
            }
            let what = match other.class_name() {
                Ok(Some(class)) => class,
                Ok(None) => "a scalar".to_string(),
                Err(e) => return single(Err(eval.heap_error(index, e))),
            };
            return single(Err(eval.type_error(index, format!("cannot index into {what}"))));
        }
    };

    if let (Selector::Match { .. }, InstanceKind::PrimitiveArray(ty)) = (selector, array.kind()) {
        if eval.targets_many(index) {
            return nothing();
        }
        return single(Err(eval.type_error(
            index,
            format!("[k=v] needs object elements, not {}[]", ty.java_name()),
        )));
    }

    let heap = array.heap();
    match selector {
        Selector::Index(i) => {
            let hit = array
                .element(*i)
                .and_then(|value| value_hit(heap, value))
                .map_err(|e| eval.heap_error(index, e));
            single(hit)
        }
        Selector::All | Selector::Match { .. } => {
            let elements = match array.elements() {
                Ok(elements) => elements,
                Err(e) => return single(Err(eval.heap_error(index, e))),
            };
            let e = Rc::clone(eval);
            let hits: HitIter<'h> = Box::new(elements.map(move |value| {
                value
                    .and_then(|v| value_hit(heap, v))
                    .map_err(|err| e.heap_error(index, err))
            }));
            if matches!(selector, Selector::All) {
                hits
            } else {
                keep_matching(eval, index, hits)
            }
        }
    }
}

fn keep_matching<'h>(eval: &Rc<Evaluation>, index: usize, hits: HitIter<'h>) -> HitIter<'h> {
    let e = Rc::clone(eval);
    Box::new(hits.filter_map(move |item| {
        let hit = match item {
            Ok(hit) => hit,
            Err(err) => return Some(Err(err)),
        };
        let Some(Selector::Match { key, literal }) = &e.step(index).selector else {
            return Some(Ok(hit));
        };
        match key_matches(&hit, key, literal) {
            Ok(true) => Some(Ok(hit)),
            Ok(false) => None,
            Err(source) => Some(Err(e.heap_error(index, source))),
        }
    }))
}

/// Follows `key` from `hit` and compares its text form with `literal`.
/// Missing fields, nulls and unconvertible references do not match.
fn key_matches(hit: &Hit<'_>, key: &[String], literal: &str) -> HeapResult<bool> {
    let mut current = hit.clone();
    for name in key {
        current = match field_of(&current, name)? {
            Some(next) => next,
            None => return Ok(false),
        };
    }
    Ok(current
        .java_value()?
        .is_some_and(|value| value.to_string() == literal))
}

fn keep(eval: &Evaluation, hit: &Hit<'_>, filter: &TypeFilter) -> HeapResult<bool> {
    if hit
        .class_name()?
        .is_some_and(|class| filter.pattern.matches(&class))
    {
        return Ok(true);
    }
    if !filter.reachable {
        return Ok(false);
    }
    let (heap, roots) = match hit {
        Hit::Instance(instance) => (instance.heap(), outgoing(instance)?),
        Hit::Entry(entry) => (
            entry.heap,
            entry.fields.iter().filter_map(|(_, v)| v.object_id()).collect(),
        ),
        Hit::Null | Hit::Scalar(_) => return Ok(false),
    };
    reaches(heap, roots, &filter.pattern, eval.reach_limit)
}

/// Non-static references held by an instance.
fn outgoing(instance: &Instance<'_>) -> HeapResult<Vec<ObjectId>> {
    match instance.kind() {
        InstanceKind::Object => Ok(instance
            .field_values()?
            .iter()
            .filter_map(|fv| fv.value.object_id())
            .collect()),
        InstanceKind::ObjectArray => {
            let mut ids = Vec::new();
            for value in instance.elements()? {
                if let Some(id) = value?.object_id() {
                    ids.push(id);
                }
            }
            Ok(ids)
        }
        InstanceKind::PrimitiveArray(_) | InstanceKind::ClassObject => Ok(Vec::new()),
    }
}

/// Depth-first search for an instance whose class matches `pattern`.
/// Visits at most `limit` objects; an exhausted budget counts as not found.
fn reaches(heap: &Heap, roots: Vec<ObjectId>, pattern: &ClassPattern, limit: usize) -> HeapResult<bool> {
    let mut visited = HashSet::new();
    let mut stack = roots;
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        if visited.len() > limit {
            debug!("reachability search for {pattern} stopped after {limit} objects");
            return Ok(false);
        }
        let instance = match heap.instance(id) {
            Ok(instance) => instance,
            Err(HeapError::DanglingObject(_) | HeapError::DanglingClass { .. }) => continue,
            Err(e) => return Err(e),
        };
        if pattern.matches(instance.class_name()?) {
            return Ok(true);
        }
        stack.extend(outgoing(&instance)?);
    }
    Ok(false)
}
