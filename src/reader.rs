//! Decoding of the HPROF binary layout.
//!
//! The reader never copies the dump: every decoder works over a borrowed byte
//! slice (usually a memory map) and returns offsets that the index keeps for
//! later random access.

use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use serde::Serialize;
use std::io::{self, Cursor};

use crate::error::{HeapError, HeapResult};
use crate::types::{BasicType, ObjectId, Value};

const MAGIC_PREFIX: &str = "JAVA PROFILE 1.0";

pub mod tag {
    pub const UTF8: u8 = 0x01;
    pub const LOAD_CLASS: u8 = 0x02;
    pub const HEAP_DUMP: u8 = 0x0C;
    pub const HEAP_DUMP_SEGMENT: u8 = 0x1C;
    pub const HEAP_DUMP_END: u8 = 0x2C;

    pub const ROOT_UNKNOWN: u8 = 0xFF;
    pub const ROOT_JNI_GLOBAL: u8 = 0x01;
    pub const ROOT_JNI_LOCAL: u8 = 0x02;
    pub const ROOT_JAVA_FRAME: u8 = 0x03;
    pub const ROOT_NATIVE_STACK: u8 = 0x04;
    pub const ROOT_STICKY_CLASS: u8 = 0x05;
    pub const ROOT_THREAD_BLOCK: u8 = 0x06;
    pub const ROOT_MONITOR_USED: u8 = 0x07;
    pub const ROOT_THREAD_OBJECT: u8 = 0x08;
    pub const CLASS_DUMP: u8 = 0x20;
    pub const INSTANCE_DUMP: u8 = 0x21;
    pub const OBJECT_ARRAY_DUMP: u8 = 0x22;
    pub const PRIMITIVE_ARRAY_DUMP: u8 = 0x23;
}

/// Big-endian cursor over a dump region.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    inner: Cursor<&'a [u8]>,
    id_size: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8], pos: usize, id_size: usize) -> Self {
        let mut inner = Cursor::new(data);
        inner.set_position(pos as u64);
        Self { inner, id_size }
    }

    pub fn position(&self) -> usize {
        self.inner.position() as usize
    }

    pub fn id_size(&self) -> usize {
        self.id_size
    }

    fn available(&self) -> usize {
        self.inner.get_ref().len().saturating_sub(self.position())
    }

    fn truncated(&self, needed: usize) -> HeapError {
        HeapError::Truncated {
            offset: self.position(),
            needed,
            available: self.available(),
        }
    }

    /// Runs one fixed-width read; a short read leaves the position alone.
    fn read<T>(
        &mut self,
        width: usize,
        read: impl FnOnce(&mut Cursor<&'a [u8]>) -> io::Result<T>,
    ) -> HeapResult<T> {
        if width > self.available() {
            return Err(self.truncated(width));
        }
        read(&mut self.inner).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => self.truncated(width),
            _ => HeapError::Corrupt {
                offset: self.position(),
                reason: e.to_string(),
            },
        })
    }

    pub fn bytes(&mut self, n: usize) -> HeapResult<&'a [u8]> {
        if n > self.available() {
            return Err(self.truncated(n));
        }
        let data: &'a [u8] = *self.inner.get_ref();
        let start = self.position();
        self.inner.set_position((start + n) as u64);
        Ok(&data[start..start + n])
    }

    pub fn skip(&mut self, n: usize) -> HeapResult<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u1(&mut self) -> HeapResult<u8> {
        self.read(1, |c| c.read_u8())
    }

    pub fn u2(&mut self) -> HeapResult<u16> {
        self.read(2, |c| c.read_u16::<BigEndian>())
    }

    pub fn u4(&mut self) -> HeapResult<u32> {
        self.read(4, |c| c.read_u32::<BigEndian>())
    }

    pub fn u8(&mut self) -> HeapResult<u64> {
        self.read(8, |c| c.read_u64::<BigEndian>())
    }

    pub fn id(&mut self) -> HeapResult<ObjectId> {
        let raw = match self.id_size {
            4 => u64::from(self.u4()?),
            _ => self.u8()?,
        };
        Ok(ObjectId(raw))
    }

    pub fn basic_type(&mut self) -> HeapResult<BasicType> {
        let offset = self.position();
        let code = self.u1()?;
        BasicType::from_code(code).ok_or(HeapError::BadBasicType { code, offset })
    }

    pub fn value(&mut self, ty: BasicType) -> HeapResult<Value> {
        Ok(match ty {
            BasicType::Object => Value::reference(self.id()?),
            BasicType::Boolean => Value::Boolean(self.u1()? != 0),
            BasicType::Char => Value::Char(self.u2()?),
            BasicType::Float => Value::Float(self.read(4, |c| c.read_f32::<BigEndian>())?),
            BasicType::Double => Value::Double(self.read(8, |c| c.read_f64::<BigEndian>())?),
            BasicType::Byte => Value::Byte(self.read(1, |c| c.read_i8())?),
            BasicType::Short => Value::Short(self.read(2, |c| c.read_i16::<BigEndian>())?),
            BasicType::Int => Value::Int(self.read(4, |c| c.read_i32::<BigEndian>())?),
            BasicType::Long => Value::Long(self.read(8, |c| c.read_i64::<BigEndian>())?),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpHeader {
    pub version: String,
    pub id_size: usize,
    pub timestamp_ms: u64,
    #[serde(skip)]
    pub records_offset: usize,
}

pub fn read_header(data: &[u8]) -> HeapResult<DumpHeader> {
    let nul = data
        .iter()
        .take(64)
        .position(|b| *b == 0)
        .ok_or_else(|| HeapError::BadHeader("missing version string".to_string()))?;
    let version = String::from_utf8_lossy(&data[..nul]).to_string();
    if !version.starts_with(MAGIC_PREFIX) {
        return Err(HeapError::BadHeader(format!("unexpected version '{version}'")));
    }

    let mut cursor = ByteCursor::new(data, nul + 1, 8);
    let id_size = cursor.u4()?;
    if id_size != 4 && id_size != 8 {
        return Err(HeapError::UnsupportedIdSize(id_size));
    }
    let timestamp_ms = cursor.u8()?;

    Ok(DumpHeader {
        version,
        id_size: id_size as usize,
        timestamp_ms,
        records_offset: cursor.position(),
    })
}

/// One top-level tag-length-value record.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    pub tag: u8,
    pub offset: usize,
    pub body_offset: usize,
    pub body_len: usize,
}

impl Record {
    pub fn body_end(&self) -> usize {
        self.body_offset + self.body_len
    }
}

/// Sequential iterator over top-level records. Stops after the first error.
pub struct Records<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    pub fn new(data: &'a [u8], header: &DumpHeader) -> Self {
        Self {
            data,
            pos: header.records_offset,
            failed: false,
        }
    }

    fn read_one(&mut self) -> HeapResult<Record> {
        let offset = self.pos;
        let mut cursor = ByteCursor::new(self.data, offset, 8);
        let tag = cursor.u1()?;
        let _time_delta = cursor.u4()?;
        let body_len = cursor.u4()? as usize;
        let body_offset = cursor.position();
        cursor.skip(body_len)?;
        self.pos = cursor.position();
        Ok(Record {
            tag,
            offset,
            body_offset,
            body_len,
        })
    }
}

impl Iterator for Records<'_> {
    type Item = HeapResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let result = self.read_one();
        self.failed = result.is_err();
        Some(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GcRootKind {
    Unknown,
    JniGlobal,
    JniLocal,
    JavaFrame,
    NativeStack,
    StickyClass,
    ThreadBlock,
    MonitorUsed,
    ThreadObject,
}

#[derive(Debug, Clone)]
pub struct RawField {
    pub name_id: ObjectId,
    pub ty: BasicType,
}

#[derive(Debug, Clone)]
pub struct RawStatic {
    pub name_id: ObjectId,
    pub ty: BasicType,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct ClassDump {
    pub class_id: ObjectId,
    pub super_id: ObjectId,
    pub loader_id: ObjectId,
    pub instance_size: u32,
    pub statics: Vec<RawStatic>,
    pub fields: Vec<RawField>,
}

#[derive(Debug, Clone)]
pub enum SubRecord {
    Root {
        kind: GcRootKind,
        object_id: ObjectId,
    },
    Class(ClassDump),
    Instance {
        object_id: ObjectId,
        class_id: ObjectId,
        data_offset: usize,
        data_len: usize,
    },
    ObjectArray {
        object_id: ObjectId,
        array_class_id: ObjectId,
        length: usize,
        data_offset: usize,
    },
    PrimitiveArray {
        object_id: ObjectId,
        element_type: BasicType,
        length: usize,
        data_offset: usize,
    },
}

/// Decodes the heap sub-record whose tag byte sits at the cursor.
pub fn read_sub_record(cursor: &mut ByteCursor<'_>) -> HeapResult<SubRecord> {
    let offset = cursor.position();
    let sub_tag = cursor.u1()?;
    let record = match sub_tag {
        tag::ROOT_UNKNOWN => root(cursor, GcRootKind::Unknown, 0)?,
        tag::ROOT_JNI_GLOBAL => {
            let object_id = cursor.id()?;
            let _global_ref = cursor.id()?;
            SubRecord::Root {
                kind: GcRootKind::JniGlobal,
                object_id,
            }
        }
        tag::ROOT_JNI_LOCAL => root(cursor, GcRootKind::JniLocal, 8)?,
        tag::ROOT_JAVA_FRAME => root(cursor, GcRootKind::JavaFrame, 8)?,
        tag::ROOT_NATIVE_STACK => root(cursor, GcRootKind::NativeStack, 4)?,
        tag::ROOT_STICKY_CLASS => root(cursor, GcRootKind::StickyClass, 0)?,
        tag::ROOT_THREAD_BLOCK => root(cursor, GcRootKind::ThreadBlock, 4)?,
        tag::ROOT_MONITOR_USED => root(cursor, GcRootKind::MonitorUsed, 0)?,
        tag::ROOT_THREAD_OBJECT => root(cursor, GcRootKind::ThreadObject, 8)?,
        tag::CLASS_DUMP => SubRecord::Class(class_dump(cursor)?),
        tag::INSTANCE_DUMP => {
            let object_id = cursor.id()?;
            let _stack_serial = cursor.u4()?;
            let class_id = cursor.id()?;
            let data_len = cursor.u4()? as usize;
            let data_offset = cursor.position();
            cursor.skip(data_len)?;
            SubRecord::Instance {
                object_id,
                class_id,
                data_offset,
                data_len,
            }
        }
        tag::OBJECT_ARRAY_DUMP => {
            let object_id = cursor.id()?;
            let _stack_serial = cursor.u4()?;
            let length = cursor.u4()? as usize;
            let array_class_id = cursor.id()?;
            let data_offset = cursor.position();
            let width = cursor.id_size();
            cursor.skip(length * width)?;
            SubRecord::ObjectArray {
                object_id,
                array_class_id,
                length,
                data_offset,
            }
        }
        tag::PRIMITIVE_ARRAY_DUMP => {
            let object_id = cursor.id()?;
            let _stack_serial = cursor.u4()?;
            let length = cursor.u4()? as usize;
            let element_type = cursor.basic_type()?;
            if element_type == BasicType::Object {
                return Err(HeapError::Corrupt {
                    offset,
                    reason: "primitive array of object type".to_string(),
                });
            }
            let data_offset = cursor.position();
            let width = element_type.size(cursor.id_size());
            cursor.skip(length * width)?;
            SubRecord::PrimitiveArray {
                object_id,
                element_type,
                length,
                data_offset,
            }
        }
        other => {
            return Err(HeapError::UnknownSubRecord { tag: other, offset });
        }
    };
    Ok(record)
}

fn root(cursor: &mut ByteCursor<'_>, kind: GcRootKind, trailing: usize) -> HeapResult<SubRecord> {
    let object_id = cursor.id()?;
    cursor.skip(trailing)?;
    Ok(SubRecord::Root { kind, object_id })
}

fn class_dump(cursor: &mut ByteCursor<'_>) -> HeapResult<ClassDump> {
    let class_id = cursor.id()?;
    let _stack_serial = cursor.u4()?;
    let super_id = cursor.id()?;
    let loader_id = cursor.id()?;
    // signers, protection domain, two reserved ids
    let reserved = 4 * cursor.id_size();
    cursor.skip(reserved)?;
    let instance_size = cursor.u4()?;

    let constants = cursor.u2()?;
    for _ in 0..constants {
        let _pool_index = cursor.u2()?;
        let ty = cursor.basic_type()?;
        cursor.value(ty)?;
    }

    let static_count = cursor.u2()?;
    let mut statics = Vec::with_capacity(static_count as usize);
    for _ in 0..static_count {
        let name_id = cursor.id()?;
        let ty = cursor.basic_type()?;
        let value = cursor.value(ty)?;
        statics.push(RawStatic { name_id, ty, value });
    }

    let field_count = cursor.u2()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let name_id = cursor.id()?;
        let ty = cursor.basic_type()?;
        fields.push(RawField { name_id, ty });
    }

    Ok(ClassDump {
        class_id,
        super_id,
        loader_id,
        instance_size,
        statics,
        fields,
    })
}

/// Iterator over the sub-records of one HEAP DUMP (SEGMENT) record body.
/// Yields the offset of each sub-record's tag byte with the decoded record.
pub struct SubRecords<'a> {
    cursor: ByteCursor<'a>,
    end: usize,
    failed: bool,
}

impl<'a> SubRecords<'a> {
    pub fn new(data: &'a [u8], record: &Record, id_size: usize) -> Self {
        debug!(
            "heap segment at offset {} with {} bytes",
            record.offset, record.body_len
        );
        let end = record.body_end();
        Self {
            cursor: ByteCursor::new(&data[..end], record.body_offset, id_size),
            end,
            failed: false,
        }
    }
}

impl Iterator for SubRecords<'_> {
    type Item = HeapResult<(usize, SubRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.position() >= self.end {
            return None;
        }
        let offset = self.cursor.position();
        let result = read_sub_record(&mut self.cursor).map(|r| (offset, r));
        self.failed = result.is_err();
        Some(result)
    }
}
