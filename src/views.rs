//! Logical views over well-known collection layouts.
//!
//! A view turns a container's physical backing structure into one result per
//! logical element: `map?entrySet` yields one synthetic entry per mapping no
//! matter how the hash table distributes them across buckets. Views are looked
//! up by name in a [`ViewRegistry`]; new layouts plug in through
//! [`ViewRegistry::register`].

use log::debug;
use std::collections::HashSet;
use std::rc::Rc;

use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::instance::{Elements, Instance, InstanceKind};
use crate::types::{ObjectId, Value};
use crate::walker::Hit;

pub type ViewIter<'h> = Box<dyn Iterator<Item = HeapResult<Hit<'h>>> + 'h>;

/// Pseudo-instance produced by a view, e.g. one map entry.
#[derive(Debug, Clone)]
pub struct SyntheticEntry<'h> {
    pub class_name: String,
    pub heap: &'h Heap,
    /// Backing node, when the entry mirrors one heap object.
    pub node: Option<Instance<'h>>,
    pub fields: Vec<(&'static str, Value)>,
}

impl SyntheticEntry<'_> {
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

pub trait ContainerView {
    fn name(&self) -> &str;

    /// Whether `instance` has the backing layout this view understands.
    fn applies_to(&self, instance: &Instance<'_>) -> HeapResult<bool>;

    fn entries<'h>(&self, instance: Instance<'h>) -> HeapResult<ViewIter<'h>>;
}

#[derive(Clone)]
pub struct ViewRegistry {
    views: Vec<Rc<dyn ContainerView>>,
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ViewRegistry {
    pub fn empty() -> Self {
        Self { views: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(HashTableView::new("entrySet", MapPart::Entry));
        registry.register(HashTableView::new("keySet", MapPart::Key));
        registry.register(HashTableView::new("values", MapPart::Value));
        registry.register(ArrayListView);
        registry
    }

    /// Later registrations take precedence over earlier ones with the same name.
    pub fn register(&mut self, view: impl ContainerView + 'static) {
        self.views.push(Rc::new(view));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.views.iter().map(|v| v.name()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Opens view `name` over `instance`; `None` when no registered view with
    /// that name understands the instance's layout.
    pub fn open<'h>(&self, name: &str, instance: &Instance<'h>) -> HeapResult<Option<ViewIter<'h>>> {
        for view in self.views.iter().rev().filter(|v| v.name() == name) {
            if view.applies_to(instance)? {
                return view.entries(instance.clone()).map(Some);
            }
        }
        Ok(None)
    }
}

fn has_fields(instance: &Instance<'_>, names: &[&str]) -> HeapResult<bool> {
    if instance.kind() != InstanceKind::Object {
        return Ok(false);
    }
    let fields = instance.java_class()?.all_fields()?;
    Ok(names
        .iter()
        .all(|name| fields.iter().any(|f| f.name == *name)))
}

pub(crate) fn value_hit<'h>(heap: &'h Heap, value: Value) -> HeapResult<Hit<'h>> {
    Ok(match value {
        Value::Null => Hit::Null,
        Value::Object(id) => Hit::Instance(heap.instance(id)?),
        scalar => Hit::Scalar(scalar),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPart {
    Entry,
    Key,
    Value,
}

/// Chained hash tables: `HashMap`, `LinkedHashMap`, `Hashtable`,
/// `ConcurrentHashMap` and anything else with a `table` of nodes carrying
/// `key`, `value` (or `val`) and `next`.
pub struct HashTableView {
    name: &'static str,
    part: MapPart,
}

impl HashTableView {
    pub fn new(name: &'static str, part: MapPart) -> Self {
        Self { name, part }
    }
}

impl ContainerView for HashTableView {
    fn name(&self) -> &str {
        self.name
    }

    fn applies_to(&self, instance: &Instance<'_>) -> HeapResult<bool> {
        has_fields(instance, &["table"])
    }

    fn entries<'h>(&self, instance: Instance<'h>) -> HeapResult<ViewIter<'h>> {
        let heap = instance.heap();
        let Some(table) = instance.reference("table")? else {
            return Ok(Box::new(std::iter::empty()));
        };
        if table.kind() != InstanceKind::ObjectArray {
            return Err(HeapError::NotAnArray {
                object: table.id(),
                class: table.class_name()?.to_string(),
            });
        }
        Ok(Box::new(HashEntries {
            heap,
            part: self.part,
            buckets: table.elements()?,
            chain: None,
            seen: HashSet::new(),
            failed: false,
        }))
    }
}

struct HashEntries<'h> {
    heap: &'h Heap,
    part: MapPart,
    buckets: Elements<'h>,
    chain: Option<Instance<'h>>,
    seen: HashSet<ObjectId>,
    failed: bool,
}

impl<'h> HashEntries<'h> {
    /// Next node in bucket order, following `next` links within a bucket.
    fn next_node(&mut self) -> HeapResult<Option<Instance<'h>>> {
        loop {
            if let Some(node) = self.chain.take() {
                if !self.seen.insert(node.id()) {
                    debug!("hash chain revisits {}, cutting it", node.id());
                    continue;
                }
                self.chain = match node.try_field("next")? {
                    Some(next) => self.heap.resolve(next)?,
                    None => None,
                };
                // ConcurrentHashMap tree bins hold their nodes under `first`
                if let Some(first) = node.try_field("first")? {
                    self.chain = self.heap.resolve(first)?;
                    continue;
                }
                return Ok(Some(node));
            }
            match self.buckets.next() {
                None => return Ok(None),
                Some(head) => self.chain = self.heap.resolve(head?)?,
            }
        }
    }

    fn hit(&self, node: Instance<'h>) -> HeapResult<Hit<'h>> {
        let key = node.field("key")?;
        let value = match node.try_field("value")? {
            Some(v) => v,
            None => node.field("val")?,
        };
        match self.part {
            MapPart::Key => value_hit(self.heap, key),
            MapPart::Value => value_hit(self.heap, value),
            MapPart::Entry => Ok(Hit::Entry(Rc::new(SyntheticEntry {
                class_name: node.class_name()?.to_string(),
                heap: self.heap,
                node: Some(node),
                fields: vec![("key", key), ("value", value)],
            }))),
        }
    }
}

impl<'h> Iterator for HashEntries<'h> {
    type Item = HeapResult<Hit<'h>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = match self.next_node() {
            Ok(Some(node)) => self.hit(node),
            Ok(None) => return None,
            Err(e) => Err(e),
        };
        self.failed = item.is_err();
        Some(item)
    }
}

/// Array-backed lists (`ArrayList`, `Vector`): the first `size` slots of
/// `elementData`, nulls included.
pub struct ArrayListView;

impl ArrayListView {
    fn size_of(instance: &Instance<'_>) -> HeapResult<usize> {
        let size = match instance.try_field("size")? {
            Some(v) => v,
            None => instance.field("elementCount")?,
        };
        Ok(size.as_i64().and_then(|s| usize::try_from(s).ok()).unwrap_or(0))
    }
}

impl ContainerView for ArrayListView {
    fn name(&self) -> &str {
        "elements"
    }

    fn applies_to(&self, instance: &Instance<'_>) -> HeapResult<bool> {
        Ok(has_fields(instance, &["elementData", "size"])?
            || has_fields(instance, &["elementData", "elementCount"])?)
    }

    fn entries<'h>(&self, instance: Instance<'h>) -> HeapResult<ViewIter<'h>> {
        let heap = instance.heap();
        let size = Self::size_of(&instance)?;
        let Some(data) = instance.reference("elementData")? else {
            return Ok(Box::new(std::iter::empty()));
        };
        let elements = data.elements()?;
        Ok(Box::new(
            elements
                .take(size)
                .map(move |value| value.and_then(|v| value_hit(heap, v))),
        ))
    }
}
