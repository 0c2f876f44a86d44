//! One-pass index over a heap dump.
//!
//! The index keeps class metadata fully decoded (classes are few) and keeps
//! only the record offset for every object, so instances can be materialized
//! on demand straight from the mapped file.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{HeapError, HeapResult};
use crate::reader::{
    ByteCursor, ClassDump, DumpHeader, GcRootKind, Records, SubRecord, SubRecords, read_header,
    tag,
};
use crate::types::{BasicType, ObjectId, Value, java_class_name};

#[derive(Debug, Clone, Serialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: BasicType,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticValue {
    pub field: FieldDecl,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct ClassMeta {
    pub id: ObjectId,
    pub name: String,
    pub super_id: Option<ObjectId>,
    pub loader_id: ObjectId,
    pub instance_size: u32,
    pub fields: Vec<FieldDecl>,
    pub statics: Vec<StaticValue>,
    /// `false` for primitive array classes the dump never described.
    pub from_dump: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GcRoot {
    pub kind: GcRootKind,
    pub object_id: ObjectId,
}

#[derive(Debug)]
pub struct HeapIndex {
    header: DumpHeader,
    classes: Vec<ClassMeta>,
    class_slots: HashMap<ObjectId, usize>,
    class_names: HashMap<String, usize>,
    primitive_array_classes: HashMap<BasicType, ObjectId>,
    objects: Vec<usize>,
    object_offsets: HashMap<ObjectId, usize>,
    class_instances: HashMap<ObjectId, Vec<usize>>,
    roots: Vec<GcRoot>,
}

#[derive(Default)]
struct Builder {
    strings: HashMap<ObjectId, String>,
    loaded_names: HashMap<ObjectId, ObjectId>,
    dumps: Vec<ClassDump>,
    objects: Vec<usize>,
    object_offsets: HashMap<ObjectId, usize>,
    class_instances: HashMap<ObjectId, Vec<usize>>,
    primitive_arrays: HashMap<BasicType, Vec<usize>>,
    roots: Vec<GcRoot>,
    skipped_records: usize,
}

impl HeapIndex {
    /// Scans the whole dump once. Any decode failure aborts the build.
    pub fn build(data: &[u8]) -> HeapResult<Self> {
        let header = read_header(data)?;
        info!(
            "indexing {} dump: {} bytes, id size {}",
            header.version,
            data.len(),
            header.id_size
        );

        let mut builder = Builder::default();
        for record in Records::new(data, &header) {
            let record = record?;
            match record.tag {
                tag::UTF8 => {
                    let mut cursor = ByteCursor::new(data, record.body_offset, header.id_size);
                    let id = cursor.id()?;
                    let len = record.body_len.checked_sub(header.id_size).ok_or_else(|| {
                        HeapError::Corrupt {
                            offset: record.offset,
                            reason: "UTF8 record shorter than an id".to_string(),
                        }
                    })?;
                    let text = String::from_utf8_lossy(cursor.bytes(len)?).into_owned();
                    builder.strings.insert(id, text);
                }
                tag::LOAD_CLASS => {
                    let mut cursor = ByteCursor::new(data, record.body_offset, header.id_size);
                    let _serial = cursor.u4()?;
                    let class_id = cursor.id()?;
                    let _stack_serial = cursor.u4()?;
                    let name_id = cursor.id()?;
                    builder.loaded_names.insert(class_id, name_id);
                }
                tag::HEAP_DUMP | tag::HEAP_DUMP_SEGMENT => {
                    for sub in SubRecords::new(data, &record, header.id_size) {
                        let (offset, sub) = sub?;
                        builder.add(offset, sub);
                    }
                }
                tag::HEAP_DUMP_END => {}
                other => {
                    builder.skipped_records += 1;
                    debug!("skipping record tag 0x{other:02x} at offset {}", record.offset);
                }
            }
        }

        let index = builder.finish(header);
        info!(
            "indexed {} classes, {} objects, {} gc roots",
            index.classes.len(),
            index.objects.len(),
            index.roots.len()
        );
        Ok(index)
    }

    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    pub fn id_size(&self) -> usize {
        self.header.id_size
    }

    pub fn classes(&self) -> &[ClassMeta] {
        &self.classes
    }

    pub fn class(&self, id: ObjectId) -> Option<&ClassMeta> {
        self.class_slot(id).map(|slot| &self.classes[slot])
    }

    pub fn class_slot(&self, id: ObjectId) -> Option<usize> {
        self.class_slots.get(&id).copied()
    }

    /// First class dumped under `name`; other loaders' copies keep their ids
    /// but are reachable only through `class`.
    pub fn class_by_name(&self, name: &str) -> Option<&ClassMeta> {
        self.class_names.get(name).map(|slot| &self.classes[*slot])
    }

    pub fn primitive_array_class(&self, ty: BasicType) -> Option<ObjectId> {
        self.primitive_array_classes.get(&ty).copied()
    }

    pub fn object_offset(&self, id: ObjectId) -> Option<usize> {
        self.object_offsets.get(&id).copied()
    }

    pub fn object_offsets(&self) -> &[usize] {
        &self.objects
    }

    pub fn instance_offsets(&self, class_id: ObjectId) -> &[usize] {
        self.class_instances
            .get(&class_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn roots(&self) -> &[GcRoot] {
        &self.roots
    }
}

impl Builder {
    fn add(&mut self, offset: usize, record: SubRecord) {
        match record {
            SubRecord::Root { kind, object_id } => self.roots.push(GcRoot { kind, object_id }),
            SubRecord::Class(dump) => self.dumps.push(dump),
            SubRecord::Instance {
                object_id,
                class_id,
                ..
            } => self.add_object(offset, object_id, Some(class_id)),
            SubRecord::ObjectArray {
                object_id,
                array_class_id,
                ..
            } => self.add_object(offset, object_id, Some(array_class_id)),
            SubRecord::PrimitiveArray {
                object_id,
                element_type,
                ..
            } => {
                self.add_object(offset, object_id, None);
                self.primitive_arrays
                    .entry(element_type)
                    .or_default()
                    .push(offset);
            }
        }
    }

    fn add_object(&mut self, offset: usize, id: ObjectId, class_id: Option<ObjectId>) {
        self.objects.push(offset);
        self.object_offsets.insert(id, offset);
        if let Some(class_id) = class_id {
            self.class_instances.entry(class_id).or_default().push(offset);
        }
    }

    fn string(&self, id: ObjectId) -> String {
        match self.strings.get(&id) {
            Some(s) => s.clone(),
            None => {
                warn!("missing UTF8 record {id}");
                format!("<unresolved {id}>")
            }
        }
    }

    fn finish(mut self, header: DumpHeader) -> HeapIndex {
        if self.skipped_records > 0 {
            debug!("skipped {} records with unhandled tags", self.skipped_records);
        }

        let mut classes = Vec::with_capacity(self.dumps.len());
        let mut class_slots = HashMap::with_capacity(self.dumps.len());
        let mut class_names = HashMap::with_capacity(self.dumps.len());

        for dump in std::mem::take(&mut self.dumps) {
            if class_slots.contains_key(&dump.class_id) {
                warn!("duplicate class dump for {}", dump.class_id);
                continue;
            }
            let name = match self.loaded_names.get(&dump.class_id) {
                Some(name_id) => java_class_name(&self.string(*name_id)),
                None => {
                    warn!("class dump {} has no LOAD CLASS record", dump.class_id);
                    format!("<unnamed class {}>", dump.class_id)
                }
            };
            let fields = dump
                .fields
                .iter()
                .map(|f| FieldDecl {
                    name: self.string(f.name_id),
                    ty: f.ty,
                })
                .collect();
            let statics = dump
                .statics
                .iter()
                .map(|s| StaticValue {
                    field: FieldDecl {
                        name: self.string(s.name_id),
                        ty: s.ty,
                    },
                    value: s.value,
                })
                .collect();

            let slot = classes.len();
            class_slots.insert(dump.class_id, slot);
            class_names.entry(name.clone()).or_insert(slot);
            classes.push(ClassMeta {
                id: dump.class_id,
                name,
                super_id: (!dump.super_id.is_null()).then_some(dump.super_id),
                loader_id: dump.loader_id,
                instance_size: dump.instance_size,
                fields,
                statics,
                from_dump: true,
            });
        }

        let object_class = class_names
            .get("java.lang.Object")
            .map(|slot: &usize| classes[*slot].id);
        let mut primitive_array_classes = HashMap::new();
        for ty in BasicType::PRIMITIVES {
            let name = format!("{}[]", ty.java_name());
            let offsets = self.primitive_arrays.remove(&ty).unwrap_or_default();
            let class_id = match class_names.get(&name) {
                Some(slot) => classes[*slot].id,
                None if offsets.is_empty() => continue,
                None => {
                    let id = ObjectId(u64::MAX - u64::from(ty.code()));
                    debug!("synthesizing class {name} as {id}");
                    let slot = classes.len();
                    class_slots.insert(id, slot);
                    class_names.insert(name.clone(), slot);
                    classes.push(ClassMeta {
                        id,
                        name,
                        super_id: object_class,
                        loader_id: ObjectId::NULL,
                        instance_size: 0,
                        fields: Vec::new(),
                        statics: Vec::new(),
                        from_dump: false,
                    });
                    id
                }
            };
            primitive_array_classes.insert(ty, class_id);
            if !offsets.is_empty() {
                self.class_instances
                    .entry(class_id)
                    .or_default()
                    .extend(offsets);
            }
        }

        for (class_id, name_id) in &self.loaded_names {
            if !class_slots.contains_key(class_id) {
                debug!(
                    "class {} ({class_id}) loaded but never dumped",
                    self.strings.get(name_id).map(String::as_str).unwrap_or("?")
                );
            }
        }

        HeapIndex {
            header,
            classes,
            class_slots,
            class_names,
            primitive_array_classes,
            objects: self.objects,
            object_offsets: self.object_offsets,
            class_instances: self.class_instances,
            roots: self.roots,
        }
    }
}
