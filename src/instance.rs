use std::fmt;

use crate::error::{HeapError, HeapResult};
use crate::heap::{Heap, JavaClass};
use crate::index::FieldDecl;
use crate::reader::ByteCursor;
use crate::types::{BasicType, ObjectId, Value};

/// Shape of an instance, fixed by the record it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    Object,
    ObjectArray,
    PrimitiveArray(BasicType),
    /// A class object; its fields are the class's static fields.
    ClassObject,
}

/// One field of an instance together with its decoded value.
#[derive(Debug, Clone, Copy)]
pub struct FieldValue<'h> {
    pub field: &'h FieldDecl,
    pub declaring_class: ObjectId,
    pub value: Value,
}

impl FieldValue<'_> {
    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn ty(&self) -> BasicType {
        self.field.ty
    }
}

/// A lazily materialized object or array. Cheap to clone; holds no decoded
/// data beyond its record position.
#[derive(Clone)]
pub struct Instance<'h> {
    heap: &'h Heap,
    id: ObjectId,
    class_id: ObjectId,
    kind: InstanceKind,
    data_offset: usize,
    /// Payload bytes for objects, element count for arrays.
    len: usize,
}

impl<'h> Instance<'h> {
    pub(crate) fn object(
        heap: &'h Heap,
        id: ObjectId,
        class_id: ObjectId,
        data_offset: usize,
        data_len: usize,
    ) -> Self {
        Self {
            heap,
            id,
            class_id,
            kind: InstanceKind::Object,
            data_offset,
            len: data_len,
        }
    }

    pub(crate) fn object_array(
        heap: &'h Heap,
        id: ObjectId,
        class_id: ObjectId,
        data_offset: usize,
        length: usize,
    ) -> Self {
        Self {
            heap,
            id,
            class_id,
            kind: InstanceKind::ObjectArray,
            data_offset,
            len: length,
        }
    }

    pub(crate) fn primitive_array(
        heap: &'h Heap,
        id: ObjectId,
        class_id: ObjectId,
        element_type: BasicType,
        data_offset: usize,
        length: usize,
    ) -> Self {
        Self {
            heap,
            id,
            class_id,
            kind: InstanceKind::PrimitiveArray(element_type),
            data_offset,
            len: length,
        }
    }

    pub(crate) fn class_object(heap: &'h Heap, described: ObjectId, class_type: ObjectId) -> Self {
        Self {
            heap,
            id: described,
            class_id: class_type,
            kind: InstanceKind::ClassObject,
            data_offset: 0,
            len: 0,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    pub fn class_id(&self) -> ObjectId {
        self.class_id
    }

    pub fn java_class(&self) -> HeapResult<JavaClass<'h>> {
        self.heap
            .class_by_id(self.class_id)
            .ok_or(HeapError::DanglingClass {
                object: self.id,
                class: self.class_id,
            })
    }

    /// Runtime class name. Class objects report `java.lang.Class` even when
    /// the dump lacks that class.
    pub fn class_name(&self) -> HeapResult<&'h str> {
        if self.kind == InstanceKind::ClassObject && self.heap.class_meta(self.class_id).is_none() {
            return Ok("java.lang.Class");
        }
        self.java_class().map(|c| c.name())
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.kind,
            InstanceKind::ObjectArray | InstanceKind::PrimitiveArray(_)
        )
    }

    pub fn array_length(&self) -> Option<usize> {
        self.is_array().then_some(self.len)
    }

    /// For class objects, the class they describe.
    pub fn described_class(&self) -> Option<JavaClass<'h>> {
        match self.kind {
            InstanceKind::ClassObject => self.heap.class_by_id(self.id),
            _ => None,
        }
    }

    /// Bytes of instance payload as recorded in the dump.
    pub fn shallow_size(&self) -> usize {
        match self.kind {
            InstanceKind::Object => self.len,
            InstanceKind::ObjectArray => self.len * self.heap.id_size(),
            InstanceKind::PrimitiveArray(ty) => self.len * ty.size(self.heap.id_size()),
            InstanceKind::ClassObject => 0,
        }
    }

    /// Field values in instance-data order: own fields first, then inherited.
    /// Arrays have no fields.
    pub fn field_values(&self) -> HeapResult<Vec<FieldValue<'h>>> {
        match self.kind {
            InstanceKind::Object => self.object_fields(),
            InstanceKind::ClassObject => Ok(self.static_fields()),
            InstanceKind::ObjectArray | InstanceKind::PrimitiveArray(_) => Ok(Vec::new()),
        }
    }

    fn object_fields(&self) -> HeapResult<Vec<FieldValue<'h>>> {
        let heap = self.heap;
        let layout = heap.layout(self.class_id)?;
        let mut cursor = ByteCursor::new(heap.data(), self.data_offset, heap.id_size());
        let mut values = Vec::with_capacity(layout.len());
        for slot in layout.iter() {
            let meta = heap.meta_at(slot.class_slot);
            let field = &meta.fields[slot.field_slot];
            values.push(FieldValue {
                field,
                declaring_class: meta.id,
                value: cursor.value(field.ty)?,
            });
        }
        let consumed = cursor.position() - self.data_offset;
        if consumed != self.len {
            return Err(HeapError::Corrupt {
                offset: self.data_offset,
                reason: format!(
                    "instance {} has {} bytes of field data, layout needs {consumed}",
                    self.id, self.len
                ),
            });
        }
        Ok(values)
    }

    fn static_fields(&self) -> Vec<FieldValue<'h>> {
        let Some(meta) = self.heap.class_meta(self.id) else {
            return Vec::new();
        };
        meta.statics
            .iter()
            .map(|s| FieldValue {
                field: &s.field,
                declaring_class: meta.id,
                value: s.value,
            })
            .collect()
    }

    /// Looks up a field by name; the most derived declaration wins.
    pub fn field(&self, name: &str) -> HeapResult<Value> {
        match self.try_field(name)? {
            Some(value) => Ok(value),
            None => Err(HeapError::UnknownField {
                class: self.class_name().unwrap_or("<unknown>").to_string(),
                field: name.to_string(),
            }),
        }
    }

    pub fn try_field(&self, name: &str) -> HeapResult<Option<Value>> {
        Ok(self
            .field_values()?
            .into_iter()
            .find(|fv| fv.name() == name)
            .map(|fv| fv.value))
    }

    /// Follows a reference field. Null yields `None`.
    pub fn reference(&self, name: &str) -> HeapResult<Option<Instance<'h>>> {
        let value = self.field(name)?;
        self.heap.resolve(value)
    }

    fn require_array(&self) -> HeapResult<BasicType> {
        match self.kind {
            InstanceKind::ObjectArray => Ok(BasicType::Object),
            InstanceKind::PrimitiveArray(ty) => Ok(ty),
            _ => Err(HeapError::NotAnArray {
                object: self.id,
                class: self.class_name().unwrap_or("<unknown>").to_string(),
            }),
        }
    }

    /// Indexed element access; negative or too-large indices are bounds errors.
    pub fn element(&self, index: i64) -> HeapResult<Value> {
        let ty = self.require_array()?;
        let slot = usize::try_from(index)
            .ok()
            .filter(|i| *i < self.len)
            .ok_or(HeapError::IndexOutOfBounds {
                object: self.id,
                index,
                length: self.len,
            })?;
        let width = ty.size(self.heap.id_size());
        let mut cursor = ByteCursor::new(
            self.heap.data(),
            self.data_offset + slot * width,
            self.heap.id_size(),
        );
        cursor.value(ty)
    }

    /// Lazy iterator over array elements. Null slots yield `Value::Null`.
    pub fn elements(&self) -> HeapResult<Elements<'h>> {
        let ty = self.require_array()?;
        Ok(Elements {
            cursor: ByteCursor::new(self.heap.data(), self.data_offset, self.heap.id_size()),
            ty,
            remaining: self.len,
        })
    }
}

impl PartialEq for Instance<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && std::ptr::eq(self.heap, other.heap)
    }
}

impl fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance({} {} {:?})",
            self.class_name().unwrap_or("<dangling>"),
            self.id,
            self.kind
        )
    }
}

/// Cursor over the elements of an array instance.
pub struct Elements<'h> {
    cursor: ByteCursor<'h>,
    ty: BasicType,
    remaining: usize,
}

impl Iterator for Elements<'_> {
    type Item = HeapResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let value = self.cursor.value(self.ty);
        if value.is_err() {
            self.remaining = 0;
        }
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{DumpBuilder, FieldKind, Val};

    fn heap_with(build: impl FnOnce(&mut DumpBuilder)) -> Heap {
        let mut dump = DumpBuilder::with_id_size(4);
        dump.class("java.lang.Object", None, &[]);
        build(&mut dump);
        Heap::from_bytes(dump.finish()).expect("fixture dump indexes")
    }

    #[test]
    fn field_values_are_stable_and_complete() -> HeapResult<()> {
        let mut id = 0;
        let heap = heap_with(|dump| {
            dump.class("a.Base", Some("java.lang.Object"), &[("id", FieldKind::Long)]);
            dump.class(
                "a.Node",
                Some("a.Base"),
                &[("next", FieldKind::Object), ("weight", FieldKind::Double)],
            );
            let tail = dump.instance("a.Node", &[("id", Val::Long(2))]);
            id = dump.instance(
                "a.Node",
                &[
                    ("id", Val::Long(1)),
                    ("next", Val::Ref(tail)),
                    ("weight", Val::Double(0.5)),
                ],
            );
        });

        let node = heap.instance(ObjectId(id))?;
        let first = node.field_values()?;
        let second = node.field_values()?;
        assert_eq!(first.len(), 3);
        let names: Vec<&str> = first.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["next", "weight", "id"]);
        assert_eq!(
            first.iter().map(|f| f.value).collect::<Vec<_>>(),
            second.iter().map(|f| f.value).collect::<Vec<_>>()
        );
        assert_eq!(node.field("id")?, Value::Long(1));
        assert_eq!(node.field("weight")?, Value::Double(0.5));

        let tail = node.reference("next")?.expect("next is set");
        assert_eq!(tail.field("id")?, Value::Long(2));
        assert!(tail.reference("next")?.is_none());
        assert!(matches!(
            node.field("missing"),
            Err(HeapError::UnknownField { .. })
        ));
        Ok(())
    }

    #[test]
    fn array_access_checks_bounds() -> HeapResult<()> {
        let mut ids = (0, 0);
        let heap = heap_with(|dump| {
            let a = dump.instance("java.lang.Object", &[]);
            ids.0 = dump.object_array("java.lang.Object", &[a, 0, a]);
            ids.1 = dump.int_array(&[i32::MIN, i32::MAX]);
        });

        let objects = heap.instance(ObjectId(ids.0))?;
        assert_eq!(objects.kind(), InstanceKind::ObjectArray);
        assert_eq!(objects.array_length(), Some(3));
        assert_eq!(objects.class_name()?, "java.lang.Object[]");
        let values: Vec<Value> = objects.elements()?.collect::<HeapResult<_>>()?;
        assert_eq!(values.len(), 3);
        assert_eq!(values[1], Value::Null);

        let ints = heap.instance(ObjectId(ids.1))?;
        assert_eq!(ints.kind(), InstanceKind::PrimitiveArray(BasicType::Int));
        assert_eq!(ints.class_name()?, "int[]");
        assert_eq!(ints.element(0)?, Value::Int(i32::MIN));
        assert_eq!(ints.element(1)?, Value::Int(i32::MAX));
        assert!(matches!(
            ints.element(2),
            Err(HeapError::IndexOutOfBounds { index: 2, length: 2, .. })
        ));
        assert!(matches!(
            ints.element(-1),
            Err(HeapError::IndexOutOfBounds { index: -1, .. })
        ));
        assert!(ints.field_values()?.is_empty());
        Ok(())
    }

    #[test]
    fn element_access_on_plain_object_is_a_type_error() -> HeapResult<()> {
        let mut id = 0;
        let heap = heap_with(|dump| {
            id = dump.instance("java.lang.Object", &[]);
        });
        let plain = heap.instance(ObjectId(id))?;
        assert!(matches!(plain.element(0), Err(HeapError::NotAnArray { .. })));
        assert!(plain.elements().is_err());
        Ok(())
    }

    #[test]
    fn class_objects_expose_static_fields() -> HeapResult<()> {
        let mut class_id = 0;
        let heap = heap_with(|dump| {
            let marker = dump.instance("java.lang.Object", &[]);
            class_id = dump.class_with_statics(
                "a.Registry",
                Some("java.lang.Object"),
                &[],
                &[("INSTANCE", Val::Ref(marker)), ("LIMIT", Val::Int(64))],
            );
        });

        let holder = heap.instance(ObjectId(class_id))?;
        assert_eq!(holder.kind(), InstanceKind::ClassObject);
        assert_eq!(holder.class_name()?, "java.lang.Class");
        assert_eq!(holder.field("LIMIT")?, Value::Int(64));
        assert!(holder.reference("INSTANCE")?.is_some());
        assert_eq!(
            holder.described_class().map(|c| c.name()),
            Some("a.Registry")
        );
        Ok(())
    }

    #[test]
    fn short_payload_is_reported_as_corrupt() -> HeapResult<()> {
        let mut id = 0;
        let heap = heap_with(|dump| {
            let class = dump.class("a.Wide", Some("java.lang.Object"), &[("v", FieldKind::Long)]);
            id = dump.instance_raw(class, &[0, 0, 0, 1]);
        });
        let wide = heap.instance(ObjectId(id))?;
        assert!(wide.field_values().is_err());
        Ok(())
    }
}
