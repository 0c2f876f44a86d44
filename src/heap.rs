//! Read model over an indexed dump: [`Heap`] and [`JavaClass`].

use log::info;
use memmap2::Mmap;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{HeapError, HeapResult};
use crate::index::{ClassMeta, FieldDecl, GcRoot, HeapIndex, StaticValue};
use crate::instance::Instance;
use crate::reader::{ByteCursor, DumpHeader, SubRecord, read_sub_record};
use crate::types::{BasicType, ObjectId, Value};

enum DumpData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for DumpData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            DumpData::Mapped(map) => map,
            DumpData::Owned(bytes) => bytes,
        }
    }
}

/// Position of one instance field in the flattened layout of a class.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutSlot {
    pub class_slot: usize,
    pub field_slot: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeapSummary {
    pub source: Option<String>,
    pub version: String,
    pub id_size: usize,
    pub timestamp_ms: u64,
    pub classes: usize,
    pub instances: usize,
    pub gc_roots: usize,
}

/// An opened heap dump.
///
/// The dump stays mapped for the lifetime of the value. Layout caches use
/// interior mutability, so a `Heap` must not be shared between threads; open
/// one handle per thread instead.
pub struct Heap {
    data: DumpData,
    index: HeapIndex,
    source: Option<PathBuf>,
    layouts: RefCell<HashMap<ObjectId, Rc<[LayoutSlot]>>>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("source", &self.source)
            .field("bytes", &self.data.len())
            .field("classes", &self.index.classes().len())
            .finish()
    }
}

impl Heap {
    pub fn open(path: impl AsRef<Path>) -> HeapResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| HeapError::Open {
            path: path.display().to_string(),
            source,
        })?;
        // SAFETY: The file is mapped read-only and dumps are not modified while
        // analysed. The file handle can be closed once the mapping exists.
        let map = unsafe { Mmap::map(&file) }.map_err(|source| HeapError::Open {
            path: path.display().to_string(),
            source,
        })?;
        drop(file);
        info!("opened {} ({} bytes)", path.display(), map.len());
        Self::from_data(DumpData::Mapped(map), Some(path.to_path_buf()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> HeapResult<Self> {
        Self::from_data(DumpData::Owned(bytes), None)
    }

    fn from_data(data: DumpData, source: Option<PathBuf>) -> HeapResult<Self> {
        let index = HeapIndex::build(&data)?;
        Ok(Self {
            data,
            index,
            source,
            layouts: RefCell::new(HashMap::new()),
        })
    }

    pub fn header(&self) -> &DumpHeader {
        self.index.header()
    }

    pub fn summary(&self) -> HeapSummary {
        let header = self.index.header();
        HeapSummary {
            source: self.source.as_ref().map(|p| p.display().to_string()),
            version: header.version.clone(),
            id_size: header.id_size,
            timestamp_ms: header.timestamp_ms,
            classes: self.index.classes().len(),
            instances: self.index.object_offsets().len(),
            gc_roots: self.index.roots().len(),
        }
    }

    pub fn classes(&self) -> impl Iterator<Item = JavaClass<'_>> + '_ {
        self.index
            .classes()
            .iter()
            .map(move |meta| JavaClass { heap: self, meta })
    }

    pub fn class_by_name(&self, name: &str) -> Option<JavaClass<'_>> {
        self.index
            .class_by_name(name)
            .map(|meta| JavaClass { heap: self, meta })
    }

    pub fn require_class(&self, name: &str) -> HeapResult<JavaClass<'_>> {
        self.class_by_name(name)
            .ok_or_else(|| HeapError::UnknownClass(name.to_string()))
    }

    pub fn class_by_id(&self, id: ObjectId) -> Option<JavaClass<'_>> {
        self.index.class(id).map(|meta| JavaClass { heap: self, meta })
    }

    /// Every instance and array in dump order. Class objects are excluded.
    pub fn all_instances(&self) -> Instances<'_> {
        Instances::new(self, self.index.object_offsets())
    }

    pub fn instance_count(&self) -> usize {
        self.index.object_offsets().len()
    }

    /// Resolves any object id, including class objects.
    pub fn instance(&self, id: ObjectId) -> HeapResult<Instance<'_>> {
        if let Some(offset) = self.index.object_offset(id) {
            return self.materialize(offset);
        }
        if let Some(meta) = self.index.class(id) {
            return Ok(Instance::class_object(self, meta.id, self.class_object_type()));
        }
        Err(HeapError::DanglingObject(id))
    }

    /// Follows a reference value. Null and scalars resolve to `None`.
    pub fn resolve(&self, value: Value) -> HeapResult<Option<Instance<'_>>> {
        match value {
            Value::Object(id) => self.instance(id).map(Some),
            _ => Ok(None),
        }
    }

    pub fn gc_roots(&self) -> &[GcRoot] {
        self.index.roots()
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn id_size(&self) -> usize {
        self.index.id_size()
    }

    pub(crate) fn class_meta(&self, id: ObjectId) -> Option<&ClassMeta> {
        self.index.class(id)
    }

    pub(crate) fn meta_at(&self, slot: usize) -> &ClassMeta {
        &self.index.classes()[slot]
    }

    fn class_object_type(&self) -> ObjectId {
        self.index
            .class_by_name("java.lang.Class")
            .map(|meta| meta.id)
            .unwrap_or(ObjectId::NULL)
    }

    pub(crate) fn materialize(&self, offset: usize) -> HeapResult<Instance<'_>> {
        let mut cursor = ByteCursor::new(&self.data, offset, self.id_size());
        match read_sub_record(&mut cursor)? {
            SubRecord::Instance {
                object_id,
                class_id,
                data_offset,
                data_len,
            } => {
                self.check_class(object_id, class_id)?;
                Ok(Instance::object(self, object_id, class_id, data_offset, data_len))
            }
            SubRecord::ObjectArray {
                object_id,
                array_class_id,
                length,
                data_offset,
            } => {
                self.check_class(object_id, array_class_id)?;
                Ok(Instance::object_array(
                    self,
                    object_id,
                    array_class_id,
                    data_offset,
                    length,
                ))
            }
            SubRecord::PrimitiveArray {
                object_id,
                element_type,
                length,
                data_offset,
            } => {
                let class_id = self
                    .index
                    .primitive_array_class(element_type)
                    .unwrap_or(ObjectId::NULL);
                Ok(Instance::primitive_array(
                    self,
                    object_id,
                    class_id,
                    element_type,
                    data_offset,
                    length,
                ))
            }
            _ => Err(HeapError::Corrupt {
                offset,
                reason: "indexed offset does not hold an object".to_string(),
            }),
        }
    }

    fn check_class(&self, object: ObjectId, class: ObjectId) -> HeapResult<()> {
        if self.index.class(class).is_none() {
            return Err(HeapError::DanglingClass { object, class });
        }
        Ok(())
    }

    /// Flattened field layout: the class's own fields, then each superclass's.
    pub(crate) fn layout(&self, class_id: ObjectId) -> HeapResult<Rc<[LayoutSlot]>> {
        if let Some(layout) = self.layouts.borrow().get(&class_id) {
            return Ok(Rc::clone(layout));
        }

        let mut slots = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(class_id);
        while let Some(id) = current {
            if !seen.insert(id) {
                return Err(HeapError::Corrupt {
                    offset: 0,
                    reason: format!("superclass cycle through class {id}"),
                });
            }
            let class_slot = self.index.class_slot(id).ok_or(HeapError::DanglingClass {
                object: class_id,
                class: id,
            })?;
            let meta = self.meta_at(class_slot);
            slots.extend((0..meta.fields.len()).map(|field_slot| LayoutSlot {
                class_slot,
                field_slot,
            }));
            current = meta.super_id;
        }

        let layout: Rc<[LayoutSlot]> = slots.into();
        self.layouts
            .borrow_mut()
            .insert(class_id, Rc::clone(&layout));
        Ok(layout)
    }
}

/// Forward-only cursor materializing one instance per pull.
pub struct Instances<'h> {
    heap: &'h Heap,
    offsets: std::slice::Iter<'h, usize>,
}

impl<'h> Instances<'h> {
    fn new(heap: &'h Heap, offsets: &'h [usize]) -> Self {
        Self {
            heap,
            offsets: offsets.iter(),
        }
    }
}

impl<'h> Iterator for Instances<'h> {
    type Item = HeapResult<Instance<'h>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.offsets
            .next()
            .map(|offset| self.heap.materialize(*offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.offsets.size_hint()
    }
}

impl ExactSizeIterator for Instances<'_> {}

/// Handle to one class of the dump. Copyable; compares by class id.
#[derive(Clone, Copy)]
pub struct JavaClass<'h> {
    heap: &'h Heap,
    meta: &'h ClassMeta,
}

impl<'h> JavaClass<'h> {
    pub fn id(&self) -> ObjectId {
        self.meta.id
    }

    pub fn name(&self) -> &'h str {
        &self.meta.name
    }

    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    pub fn loader_id(&self) -> ObjectId {
        self.meta.loader_id
    }

    pub fn instance_size(&self) -> u32 {
        self.meta.instance_size
    }

    pub fn is_array(&self) -> bool {
        self.meta.name.ends_with("[]")
    }

    /// Whether the dump carried a class record; primitive array classes may
    /// be synthesized by the index.
    pub fn is_synthetic(&self) -> bool {
        !self.meta.from_dump
    }

    pub fn super_class(&self) -> Option<JavaClass<'h>> {
        self.meta
            .super_id
            .and_then(|id| self.heap.class_by_id(id))
    }

    /// Instance fields declared by this class only.
    pub fn declared_fields(&self) -> &'h [FieldDecl] {
        &self.meta.fields
    }

    /// Declared and inherited instance fields in instance-data order.
    pub fn all_fields(&self) -> HeapResult<Vec<&'h FieldDecl>> {
        let layout = self.heap.layout(self.meta.id)?;
        Ok(layout
            .iter()
            .map(|slot| &self.heap.meta_at(slot.class_slot).fields[slot.field_slot])
            .collect())
    }

    pub fn static_values(&self) -> &'h [StaticValue] {
        &self.meta.statics
    }

    pub fn static_value(&self, name: &str) -> Option<Value> {
        self.meta
            .statics
            .iter()
            .find(|s| s.field.name == name)
            .map(|s| s.value)
    }

    /// Instances whose concrete class is exactly this class.
    pub fn instances(&self) -> Instances<'h> {
        Instances::new(self.heap, self.heap.index.instance_offsets(self.meta.id))
    }

    pub fn instance_count(&self) -> usize {
        self.heap.index.instance_offsets(self.meta.id).len()
    }

    pub fn subclasses(&self) -> Vec<JavaClass<'h>> {
        self.heap
            .classes()
            .filter(|c| c.meta.super_id == Some(self.meta.id))
            .collect()
    }

    pub fn is_subclass_of(&self, ancestor: &JavaClass<'_>) -> bool {
        let mut current = Some(*self);
        let mut hops = 0;
        while let Some(class) = current {
            if class.id() == ancestor.id() {
                return true;
            }
            hops += 1;
            if hops > self.heap.index.classes().len() {
                return false;
            }
            current = class.super_class();
        }
        false
    }

    /// The class object itself, whose fields are the static fields.
    pub fn as_instance(&self) -> Instance<'h> {
        Instance::class_object(self.heap, self.meta.id, self.heap.class_object_type())
    }

    pub(crate) fn primitive_element(&self) -> Option<BasicType> {
        BasicType::PRIMITIVES
            .into_iter()
            .find(|t| self.heap.index.primitive_array_class(*t) == Some(self.meta.id))
    }
}

impl PartialEq for JavaClass<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.meta.id == other.meta.id
    }
}

impl Eq for JavaClass<'_> {}

impl fmt::Debug for JavaClass<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JavaClass({} {})", self.meta.name, self.meta.id)
    }
}
