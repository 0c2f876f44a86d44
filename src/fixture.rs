//! Test-only HPROF writer producing byte-exact JVM heap dumps.
//!
//! Shared with the integration tests through `#[path]`, so it only uses
//! crates the library already depends on.
#![allow(dead_code)]

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::collections::HashMap;

const TIMESTAMP_MS: u64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl FieldKind {
    fn code(self) -> u8 {
        match self {
            FieldKind::Object => 2,
            FieldKind::Boolean => 4,
            FieldKind::Char => 5,
            FieldKind::Float => 6,
            FieldKind::Double => 7,
            FieldKind::Byte => 8,
            FieldKind::Short => 9,
            FieldKind::Int => 10,
            FieldKind::Long => 11,
        }
    }

    fn descriptor(self) -> &'static str {
        match self {
            FieldKind::Object => "Ljava/lang/Object;",
            FieldKind::Boolean => "Z",
            FieldKind::Char => "C",
            FieldKind::Float => "F",
            FieldKind::Double => "D",
            FieldKind::Byte => "B",
            FieldKind::Short => "S",
            FieldKind::Int => "I",
            FieldKind::Long => "J",
        }
    }

    fn zero(self) -> Val {
        match self {
            FieldKind::Object => Val::Null,
            FieldKind::Boolean => Val::Bool(false),
            FieldKind::Char => Val::Char(0),
            FieldKind::Float => Val::Float(0.0),
            FieldKind::Double => Val::Double(0.0),
            FieldKind::Byte => Val::Byte(0),
            FieldKind::Short => Val::Short(0),
            FieldKind::Int => Val::Int(0),
            FieldKind::Long => Val::Long(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    Null,
    Ref(u64),
    Bool(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl Val {
    fn kind(self) -> FieldKind {
        match self {
            Val::Null | Val::Ref(_) => FieldKind::Object,
            Val::Bool(_) => FieldKind::Boolean,
            Val::Char(_) => FieldKind::Char,
            Val::Float(_) => FieldKind::Float,
            Val::Double(_) => FieldKind::Double,
            Val::Byte(_) => FieldKind::Byte,
            Val::Short(_) => FieldKind::Short,
            Val::Int(_) => FieldKind::Int,
            Val::Long(_) => FieldKind::Long,
        }
    }
}

struct ClassInfo {
    id: u64,
    super_name: Option<String>,
    fields: Vec<(String, FieldKind)>,
}

pub struct DumpBuilder {
    id_size: usize,
    next_id: u64,
    next_serial: u32,
    strings: HashMap<String, u64>,
    records: Vec<u8>,
    heap: Vec<u8>,
    classes: HashMap<String, ClassInfo>,
}

impl Default for DumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpBuilder {
    pub fn new() -> Self {
        Self::with_id_size(8)
    }

    pub fn with_id_size(id_size: usize) -> Self {
        assert!(id_size == 4 || id_size == 8);
        Self {
            id_size,
            next_id: 0x1000,
            next_serial: 1,
            strings: HashMap::new(),
            records: Vec::new(),
            heap: Vec::new(),
            classes: HashMap::new(),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = b"JAVA PROFILE 1.0.2\0".to_vec();
        out.write_u32::<BigEndian>(self.id_size as u32).unwrap();
        out.write_u64::<BigEndian>(TIMESTAMP_MS).unwrap();
        out.extend_from_slice(&self.records);
        push_record(&mut out, 0x1C, &self.heap);
        push_record(&mut out, 0x2C, &[]);
        out
    }

    /// Appends an arbitrary top-level record.
    pub fn raw_record(&mut self, tag: u8, body: &[u8]) {
        push_record(&mut self.records, tag, body);
    }

    pub fn root_sticky(&mut self, id: u64) {
        self.heap.push(0x05);
        self.put_id_heap(id);
    }

    pub fn class(&mut self, name: &str, super_name: Option<&str>, fields: &[(&str, FieldKind)]) -> u64 {
        self.class_with_statics(name, super_name, fields, &[])
    }

    pub fn class_with_statics(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        fields: &[(&str, FieldKind)],
        statics: &[(&str, Val)],
    ) -> u64 {
        let id = self.write_class(name, super_name, fields, statics);
        self.classes.insert(
            name.to_string(),
            ClassInfo {
                id,
                super_name: super_name.map(str::to_string),
                fields: fields.iter().map(|(n, k)| (n.to_string(), *k)).collect(),
            },
        );
        id
    }

    /// Dumps a second class under an already used name, as another class
    /// loader would. Instances keep using the first definition.
    pub fn class_named_again(&mut self, name: &str, fields: &[(&str, FieldKind)]) -> u64 {
        self.write_class(name, None, fields, &[])
    }

    pub fn class_id(&self, name: &str) -> Option<u64> {
        self.classes.get(name).map(|c| c.id)
    }

    fn ensure_class(&mut self, name: &str, super_name: Option<&str>, fields: &[(&str, FieldKind)]) -> u64 {
        if let Some(info) = self.classes.get(name) {
            return info.id;
        }
        if let Some(sup) = super_name
            && !self.classes.contains_key(sup)
        {
            if sup == "java.lang.Object" {
                self.ensure_object();
            } else {
                self.ensure_class(sup, Some("java.lang.Object"), &[]);
            }
        }
        self.class(name, super_name, fields)
    }

    fn ensure_object(&mut self) -> u64 {
        if let Some(info) = self.classes.get("java.lang.Object") {
            return info.id;
        }
        self.class("java.lang.Object", None, &[])
    }

    fn write_class(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        fields: &[(&str, FieldKind)],
        statics: &[(&str, Val)],
    ) -> u64 {
        let id = self.alloc_id();
        let name_id = self.intern(&internal_name(name));
        let super_id = super_name
            .and_then(|s| self.classes.get(s).map(|c| c.id))
            .unwrap_or(0);

        let serial = self.next_serial;
        self.next_serial += 1;
        let mut load = Vec::new();
        load.write_u32::<BigEndian>(serial).unwrap();
        self.put_id(&mut load, id);
        load.write_u32::<BigEndian>(0).unwrap();
        self.put_id(&mut load, name_id);
        push_record(&mut self.records, 0x02, &load);

        let static_names: Vec<u64> = statics.iter().map(|(n, _)| self.intern(n)).collect();
        let field_names: Vec<u64> = fields.iter().map(|(n, _)| self.intern(n)).collect();

        let mut body = vec![0x20];
        self.put_id(&mut body, id);
        body.write_u32::<BigEndian>(0).unwrap();
        self.put_id(&mut body, super_id);
        for _ in 0..5 {
            self.put_id(&mut body, 0);
        }
        let size: usize = fields.iter().map(|(_, k)| self.kind_size(*k)).sum();
        body.write_u32::<BigEndian>(size as u32).unwrap();
        body.write_u16::<BigEndian>(0).unwrap();
        body.write_u16::<BigEndian>(statics.len() as u16).unwrap();
        for ((_, value), name_id) in statics.iter().zip(static_names) {
            self.put_id(&mut body, name_id);
            body.push(value.kind().code());
            self.put_val(&mut body, *value);
        }
        body.write_u16::<BigEndian>(fields.len() as u16).unwrap();
        for ((_, kind), name_id) in fields.iter().zip(field_names) {
            self.put_id(&mut body, name_id);
            body.push(kind.code());
        }
        self.heap.extend_from_slice(&body);
        id
    }

    /// Writes an instance of `class`; unnamed fields get zero values.
    /// Values are laid out own fields first, then up the superclass chain.
    pub fn instance(&mut self, class: &str, values: &[(&str, Val)]) -> u64 {
        let mut chain = Vec::new();
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            let info = self
                .classes
                .get(&name)
                .unwrap_or_else(|| panic!("class {name} not declared"));
            chain.push(info.fields.clone());
            current = info.super_name.clone();
        }
        let class_id = self.classes[class].id;

        let mut data = Vec::new();
        for fields in chain {
            for (name, kind) in fields {
                let value = values
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| *v)
                    .unwrap_or_else(|| kind.zero());
                assert_eq!(value.kind(), kind, "field {name} of {class}");
                self.put_val(&mut data, value);
            }
        }
        self.instance_raw(class_id, &data)
    }

    /// Writes an instance dump with an arbitrary class id and payload.
    pub fn instance_raw(&mut self, class_id: u64, data: &[u8]) -> u64 {
        let id = self.alloc_id();
        let mut body = vec![0x21];
        self.put_id(&mut body, id);
        body.write_u32::<BigEndian>(0).unwrap();
        self.put_id(&mut body, class_id);
        body.write_u32::<BigEndian>(data.len() as u32).unwrap();
        body.extend_from_slice(data);
        self.heap.extend_from_slice(&body);
        id
    }

    pub fn object_array(&mut self, element_class: &str, elements: &[u64]) -> u64 {
        self.ensure_object();
        let array_class = format!("{element_class}[]");
        let class_id = self.ensure_class(&array_class, Some("java.lang.Object"), &[]);
        let id = self.alloc_id();
        let mut body = vec![0x22];
        self.put_id(&mut body, id);
        body.write_u32::<BigEndian>(0).unwrap();
        body.write_u32::<BigEndian>(elements.len() as u32).unwrap();
        self.put_id(&mut body, class_id);
        for e in elements {
            self.put_id(&mut body, *e);
        }
        self.heap.extend_from_slice(&body);
        id
    }

    pub fn primitive_array(&mut self, kind: FieldKind, values: &[Val]) -> u64 {
        assert!(kind != FieldKind::Object);
        let id = self.alloc_id();
        let mut body = vec![0x23];
        self.put_id(&mut body, id);
        body.write_u32::<BigEndian>(0).unwrap();
        body.write_u32::<BigEndian>(values.len() as u32).unwrap();
        body.push(kind.code());
        for v in values {
            assert_eq!(v.kind(), kind);
            self.put_val(&mut body, *v);
        }
        self.heap.extend_from_slice(&body);
        id
    }

    pub fn int_array(&mut self, values: &[i32]) -> u64 {
        let values: Vec<Val> = values.iter().map(|v| Val::Int(*v)).collect();
        self.primitive_array(FieldKind::Int, &values)
    }

    /// A `java.lang.String`. Uses `byte[]` + `coder` when the dump declares
    /// a String class with a `coder` field, `char[]` otherwise.
    pub fn string(&mut self, text: &str) -> u64 {
        self.ensure_object();
        self.ensure_class(
            "java.lang.String",
            Some("java.lang.Object"),
            &[("value", FieldKind::Object), ("hash", FieldKind::Int)],
        );
        let compact = self.classes["java.lang.String"]
            .fields
            .iter()
            .any(|(n, _)| n == "coder");
        if compact {
            let latin1 = text.chars().all(|c| (c as u32) < 256);
            let bytes: Vec<Val> = if latin1 {
                text.chars().map(|c| Val::Byte(c as u32 as u8 as i8)).collect()
            } else {
                let mut raw = Vec::new();
                for unit in text.encode_utf16() {
                    raw.write_u16::<LittleEndian>(unit).unwrap();
                }
                raw.into_iter().map(|b| Val::Byte(b as i8)).collect()
            };
            let value = self.primitive_array(FieldKind::Byte, &bytes);
            let coder = if latin1 { 0 } else { 1 };
            self.instance(
                "java.lang.String",
                &[("value", Val::Ref(value)), ("coder", Val::Byte(coder))],
            )
        } else {
            let chars: Vec<Val> = text.encode_utf16().map(Val::Char).collect();
            let value = self.primitive_array(FieldKind::Char, &chars);
            self.instance("java.lang.String", &[("value", Val::Ref(value))])
        }
    }

    /// A boxed primitive (`java.lang.Integer` and friends).
    pub fn boxed(&mut self, value: Val) -> u64 {
        let (name, numeric) = match value {
            Val::Bool(_) => ("java.lang.Boolean", false),
            Val::Char(_) => ("java.lang.Character", false),
            Val::Float(_) => ("java.lang.Float", true),
            Val::Double(_) => ("java.lang.Double", true),
            Val::Byte(_) => ("java.lang.Byte", true),
            Val::Short(_) => ("java.lang.Short", true),
            Val::Int(_) => ("java.lang.Integer", true),
            Val::Long(_) => ("java.lang.Long", true),
            Val::Null | Val::Ref(_) => panic!("cannot box a reference"),
        };
        self.ensure_object();
        let super_name = if numeric {
            self.ensure_class("java.lang.Number", Some("java.lang.Object"), &[]);
            "java.lang.Number"
        } else {
            "java.lang.Object"
        };
        self.ensure_class(name, Some(super_name), &[("value", value.kind())]);
        self.instance(name, &[("value", value)])
    }

    /// An `ArrayList` whose backing array has spare null slots.
    pub fn array_list(&mut self, elements: &[u64]) -> u64 {
        self.ensure_object();
        self.ensure_class("java.util.AbstractList", Some("java.lang.Object"), &[("modCount", FieldKind::Int)]);
        self.ensure_class(
            "java.util.ArrayList",
            Some("java.util.AbstractList"),
            &[("elementData", FieldKind::Object), ("size", FieldKind::Int)],
        );
        let mut slots = elements.to_vec();
        let capacity = (elements.len() * 3 / 2).max(10);
        slots.resize(capacity, 0);
        let data = self.object_array("java.lang.Object", &slots);
        self.instance(
            "java.util.ArrayList",
            &[
                ("elementData", Val::Ref(data)),
                ("size", Val::Int(elements.len() as i32)),
            ],
        )
    }

    /// A `HashMap` with `capacity` buckets. Entry `i` lands in bucket
    /// `(i * 7) % capacity`, so small capacities produce collision chains.
    pub fn hash_map(&mut self, entries: &[(u64, u64)], capacity: usize) -> u64 {
        self.ensure_object();
        self.ensure_class("java.util.AbstractMap", Some("java.lang.Object"), &[]);
        self.ensure_class(
            "java.util.HashMap",
            Some("java.util.AbstractMap"),
            &[
                ("table", FieldKind::Object),
                ("size", FieldKind::Int),
                ("modCount", FieldKind::Int),
                ("threshold", FieldKind::Int),
                ("loadFactor", FieldKind::Float),
            ],
        );
        self.ensure_class(
            "java.util.HashMap$Node",
            Some("java.lang.Object"),
            &[
                ("hash", FieldKind::Int),
                ("key", FieldKind::Object),
                ("value", FieldKind::Object),
                ("next", FieldKind::Object),
            ],
        );

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); capacity];
        for i in 0..entries.len() {
            buckets[(i * 7) % capacity].push(i);
        }
        let mut table = vec![0u64; capacity];
        for (slot, chain) in buckets.iter().enumerate() {
            let mut next = 0u64;
            for &i in chain.iter().rev() {
                let (key, value) = entries[i];
                next = self.instance(
                    "java.util.HashMap$Node",
                    &[
                        ("hash", Val::Int(i as i32)),
                        ("key", Val::Ref(key)),
                        ("value", Val::Ref(value)),
                        ("next", if next == 0 { Val::Null } else { Val::Ref(next) }),
                    ],
                );
            }
            table[slot] = next;
        }
        let table = self.object_array("java.util.HashMap$Node", &table);
        self.instance(
            "java.util.HashMap",
            &[
                ("table", Val::Ref(table)),
                ("size", Val::Int(entries.len() as i32)),
                ("loadFactor", Val::Float(0.75)),
            ],
        )
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 0x10;
        id
    }

    fn intern(&mut self, text: &str) -> u64 {
        if let Some(id) = self.strings.get(text) {
            return *id;
        }
        let id = self.alloc_id();
        let mut body = Vec::new();
        self.put_id(&mut body, id);
        body.extend_from_slice(text.as_bytes());
        push_record(&mut self.records, 0x01, &body);
        self.strings.insert(text.to_string(), id);
        id
    }

    fn kind_size(&self, kind: FieldKind) -> usize {
        match kind {
            FieldKind::Object => self.id_size,
            FieldKind::Boolean | FieldKind::Byte => 1,
            FieldKind::Char | FieldKind::Short => 2,
            FieldKind::Float | FieldKind::Int => 4,
            FieldKind::Double | FieldKind::Long => 8,
        }
    }

    fn put_id(&self, out: &mut Vec<u8>, id: u64) {
        if self.id_size == 4 {
            out.write_u32::<BigEndian>(id as u32).unwrap();
        } else {
            out.write_u64::<BigEndian>(id).unwrap();
        }
    }

    fn put_id_heap(&mut self, id: u64) {
        let mut buf = Vec::new();
        self.put_id(&mut buf, id);
        self.heap.extend_from_slice(&buf);
    }

    fn put_val(&self, out: &mut Vec<u8>, value: Val) {
        match value {
            Val::Null => self.put_id(out, 0),
            Val::Ref(id) => self.put_id(out, id),
            Val::Bool(v) => out.write_u8(u8::from(v)).unwrap(),
            Val::Char(v) => out.write_u16::<BigEndian>(v).unwrap(),
            Val::Float(v) => out.write_f32::<BigEndian>(v).unwrap(),
            Val::Double(v) => out.write_f64::<BigEndian>(v).unwrap(),
            Val::Byte(v) => out.write_i8(v).unwrap(),
            Val::Short(v) => out.write_i16::<BigEndian>(v).unwrap(),
            Val::Int(v) => out.write_i32::<BigEndian>(v).unwrap(),
            Val::Long(v) => out.write_i64::<BigEndian>(v).unwrap(),
        }
    }
}

fn push_record(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    out.write_u32::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>(body.len() as u32).unwrap();
    out.extend_from_slice(body);
}

/// `a.b.C` to `a/b/C`, `int[]` to `[I`, `a.B[]` to `[La/B;`.
fn internal_name(name: &str) -> String {
    let mut base = name;
    let mut dims = 0;
    while let Some(stripped) = base.strip_suffix("[]") {
        base = stripped;
        dims += 1;
    }
    if dims == 0 {
        return name.replace('.', "/");
    }
    let element = match base {
        "boolean" => FieldKind::Boolean.descriptor().to_string(),
        "char" => FieldKind::Char.descriptor().to_string(),
        "float" => FieldKind::Float.descriptor().to_string(),
        "double" => FieldKind::Double.descriptor().to_string(),
        "byte" => FieldKind::Byte.descriptor().to_string(),
        "short" => FieldKind::Short.descriptor().to_string(),
        "int" => FieldKind::Int.descriptor().to_string(),
        "long" => FieldKind::Long.descriptor().to_string(),
        other => format!("L{};", other.replace('.', "/")),
    };
    format!("{}{element}", "[".repeat(dims))
}
