//! Unwrapping of heap values into native Rust form.
//!
//! Strings become their text, primitive wrappers their scalar, and primitive
//! arrays typed vectors. Any other reference stays a reference and is not
//! convertible.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Serialize, Serializer};
use std::fmt;

use crate::error::HeapResult;
use crate::instance::{Instance, InstanceKind};
use crate::types::{BasicType, Value, char_text, float_text, float32_text};

const WRAPPERS: [&str; 8] = [
    "java.lang.Boolean",
    "java.lang.Character",
    "java.lang.Byte",
    "java.lang.Short",
    "java.lang.Integer",
    "java.lang.Long",
    "java.lang.Float",
    "java.lang.Double",
];

const LATIN1: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JavaValue {
    Boolean(bool),
    #[serde(serialize_with = "serialize_char")]
    Char(u16),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    BooleanArray(Vec<bool>),
    #[serde(serialize_with = "serialize_chars")]
    CharArray(Vec<u16>),
    ByteArray(Vec<i8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
}

fn serialize_char<S: Serializer>(unit: &u16, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&char_text(*unit))
}

fn serialize_chars<S: Serializer>(units: &[u16], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(units.iter().map(|u| char_text(*u)))
}

impl JavaValue {
    /// Scalar form of a field or element value; references yield `None`.
    pub fn from_scalar(value: Value) -> Option<JavaValue> {
        Some(match value {
            Value::Null | Value::Object(_) => return None,
            Value::Boolean(v) => JavaValue::Boolean(v),
            Value::Char(v) => JavaValue::Char(v),
            Value::Byte(v) => JavaValue::Byte(v),
            Value::Short(v) => JavaValue::Short(v),
            Value::Int(v) => JavaValue::Int(v),
            Value::Long(v) => JavaValue::Long(v),
            Value::Float(v) => JavaValue::Float(v),
            Value::Double(v) => JavaValue::Double(v),
        })
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            JavaValue::BooleanArray(_)
                | JavaValue::CharArray(_)
                | JavaValue::ByteArray(_)
                | JavaValue::ShortArray(_)
                | JavaValue::IntArray(_)
                | JavaValue::LongArray(_)
                | JavaValue::FloatArray(_)
                | JavaValue::DoubleArray(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JavaValue::String(s) => Some(s),
            _ => None,
        }
    }
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    text: impl Fn(&T) -> String,
) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        f.write_str(&text(item))?;
    }
    f.write_str("]")
}

/// Text form as Java would print it; arrays render like `Arrays.toString`.
impl fmt::Display for JavaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JavaValue::Boolean(v) => write!(f, "{v}"),
            JavaValue::Char(v) => f.write_str(&char_text(*v)),
            JavaValue::Byte(v) => write!(f, "{v}"),
            JavaValue::Short(v) => write!(f, "{v}"),
            JavaValue::Int(v) => write!(f, "{v}"),
            JavaValue::Long(v) => write!(f, "{v}"),
            JavaValue::Float(v) => f.write_str(&float32_text(*v)),
            JavaValue::Double(v) => f.write_str(&float_text(*v)),
            JavaValue::String(s) => f.write_str(s),
            JavaValue::BooleanArray(v) => write_list(f, v, |x| x.to_string()),
            JavaValue::CharArray(v) => write_list(f, v, |x| char_text(*x)),
            JavaValue::ByteArray(v) => write_list(f, v, |x| x.to_string()),
            JavaValue::ShortArray(v) => write_list(f, v, |x| x.to_string()),
            JavaValue::IntArray(v) => write_list(f, v, |x| x.to_string()),
            JavaValue::LongArray(v) => write_list(f, v, |x| x.to_string()),
            JavaValue::FloatArray(v) => write_list(f, v, |x| float32_text(*x)),
            JavaValue::DoubleArray(v) => write_list(f, v, |x| float_text(*x)),
        }
    }
}

fn primitive_array(instance: &Instance<'_>, ty: BasicType) -> HeapResult<Option<JavaValue>> {
    let values = instance.elements()?.collect::<HeapResult<Vec<Value>>>()?;
    macro_rules! typed {
        ($variant:ident, $value:ident) => {
            JavaValue::$variant(
                values
                    .iter()
                    .filter_map(|v| match v {
                        Value::$value(x) => Some(*x),
                        _ => None,
                    })
                    .collect(),
            )
        };
    }
    Ok(Some(match ty {
        BasicType::Boolean => typed!(BooleanArray, Boolean),
        BasicType::Char => typed!(CharArray, Char),
        BasicType::Byte => typed!(ByteArray, Byte),
        BasicType::Short => typed!(ShortArray, Short),
        BasicType::Int => typed!(IntArray, Int),
        BasicType::Long => typed!(LongArray, Long),
        BasicType::Float => typed!(FloatArray, Float),
        BasicType::Double => typed!(DoubleArray, Double),
        BasicType::Object => return Ok(None),
    }))
}

/// Converts a String, primitive wrapper or primitive array instance.
/// Other instances yield `None`.
pub fn convert_instance(instance: &Instance<'_>) -> HeapResult<Option<JavaValue>> {
    match instance.kind() {
        InstanceKind::PrimitiveArray(ty) => primitive_array(instance, ty),
        InstanceKind::Object => {
            let class_name = instance.class_name()?;
            if class_name == "java.lang.String" {
                return string_contents(instance).map(|s| s.map(JavaValue::String));
            }
            if WRAPPERS.contains(&class_name) {
                return Ok(JavaValue::from_scalar(instance.field("value")?));
            }
            Ok(None)
        }
        InstanceKind::ObjectArray | InstanceKind::ClassObject => Ok(None),
    }
}

/// Decodes a `java.lang.String` instance. Handles `char[]` storage with
/// optional `offset`/`count` and compact `byte[]` storage with a `coder`.
pub fn string_contents(instance: &Instance<'_>) -> HeapResult<Option<String>> {
    if instance.kind() != InstanceKind::Object || instance.class_name()? != "java.lang.String" {
        return Ok(None);
    }
    let Some(value) = instance.reference("value")? else {
        return Ok(Some(String::new()));
    };
    let units: Vec<u16> = match value.kind() {
        InstanceKind::PrimitiveArray(BasicType::Char) => {
            let chars: Vec<u16> = value
                .elements()?
                .filter_map(|v| match v {
                    Ok(Value::Char(c)) => Some(Ok(c)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect::<HeapResult<_>>()?;
            let offset = int_field(instance, "offset")?.unwrap_or(0);
            let count = int_field(instance, "count")?.unwrap_or(chars.len());
            let start = offset.min(chars.len());
            let end = start.saturating_add(count).min(chars.len());
            chars[start..end].to_vec()
        }
        InstanceKind::PrimitiveArray(BasicType::Byte) => {
            let bytes: Vec<u8> = value
                .elements()?
                .filter_map(|v| match v {
                    Ok(Value::Byte(b)) => Some(Ok(b as u8)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect::<HeapResult<_>>()?;
            let coder = instance
                .try_field("coder")?
                .and_then(|c| c.as_i64())
                .unwrap_or(LATIN1);
            if coder == LATIN1 {
                return Ok(Some(bytes.iter().map(|b| char::from(*b)).collect()));
            }
            bytes
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .collect()
        }
        _ => return Ok(None),
    };
    Ok(Some(String::from_utf16_lossy(&units)))
}

fn int_field(instance: &Instance<'_>, name: &str) -> HeapResult<Option<usize>> {
    Ok(instance
        .try_field(name)?
        .and_then(|v| v.as_i64())
        .and_then(|v| usize::try_from(v).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{DumpBuilder, FieldKind, Val};
    use crate::heap::Heap;
    use crate::types::ObjectId;

    #[test]
    fn text_matches_java_rendering() {
        assert_eq!(JavaValue::Int(i32::MIN).to_string(), "-2147483648");
        assert_eq!(JavaValue::Double(f64::NAN).to_string(), "NaN");
        assert_eq!(JavaValue::Float(f32::NEG_INFINITY).to_string(), "-Infinity");
        assert_eq!(JavaValue::Double(1.0).to_string(), "1.0");
        assert_eq!(JavaValue::Char(u16::from(b'x')).to_string(), "x");
        assert_eq!(
            JavaValue::IntArray(vec![i32::MIN, i32::MAX]).to_string(),
            "[-2147483648, 2147483647]"
        );
        assert_eq!(
            JavaValue::FloatArray(vec![f32::NAN, 0.5]).to_string(),
            "[NaN, 0.5]"
        );
        assert_eq!(JavaValue::BooleanArray(vec![]).to_string(), "[]");
    }

    #[test]
    fn floats_use_java_layout() {
        let cases: [(JavaValue, &str); 8] = [
            (JavaValue::Float(f32::from_bits(1)), "1.4E-45"),
            (JavaValue::Float(f32::MAX), "3.4028235E38"),
            (JavaValue::Double(f64::from_bits(1)), "4.9E-324"),
            (JavaValue::Double(f64::MAX), "1.7976931348623157E308"),
            (JavaValue::Double(1.0e7), "1.0E7"),
            (JavaValue::Double(1234567.0), "1234567.0"),
            (JavaValue::Float(0.001), "0.001"),
            (JavaValue::Double(-0.0), "-0.0"),
        ];
        for (value, text) in cases {
            assert_eq!(value.to_string(), text);
        }
        assert_eq!(JavaValue::Double(1.0e-4).to_string(), "1.0E-4");
        assert_eq!(JavaValue::Float(0.1).to_string(), "0.1");
    }

    #[test]
    fn serializes_chars_as_text() {
        let json = serde_json::to_string(&JavaValue::CharArray(vec![0x61, 0x62])).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let json = serde_json::to_string(&JavaValue::Long(-1)).unwrap();
        assert_eq!(json, "-1");
    }

    #[test]
    fn decodes_char_array_strings_with_offset_and_count() -> HeapResult<()> {
        let mut dump = DumpBuilder::new();
        dump.class("java.lang.Object", None, &[]);
        dump.class(
            "java.lang.String",
            Some("java.lang.Object"),
            &[
                ("value", FieldKind::Object),
                ("offset", FieldKind::Int),
                ("count", FieldKind::Int),
            ],
        );
        let chars: Vec<Val> = "xxsharedxx".encode_utf16().map(Val::Char).collect();
        let backing = dump.primitive_array(FieldKind::Char, &chars);
        let shared = dump.instance(
            "java.lang.String",
            &[
                ("value", Val::Ref(backing)),
                ("offset", Val::Int(2)),
                ("count", Val::Int(6)),
            ],
        );
        let heap = Heap::from_bytes(dump.finish())?;

        let shared = heap.instance(ObjectId(shared))?;
        assert_eq!(string_contents(&shared)?.as_deref(), Some("shared"));
        Ok(())
    }

    #[test]
    fn decodes_compact_strings_in_both_coders() -> HeapResult<()> {
        let mut dump = DumpBuilder::new();
        dump.class("java.lang.Object", None, &[]);
        dump.class(
            "java.lang.String",
            Some("java.lang.Object"),
            &[
                ("value", FieldKind::Object),
                ("hash", FieldKind::Int),
                ("coder", FieldKind::Byte),
            ],
        );
        let latin = dump.string("plain");
        let wide = dump.string("Grüße, 世界");
        let heap = Heap::from_bytes(dump.finish())?;

        let latin = heap.instance(ObjectId(latin))?;
        assert_eq!(
            convert_instance(&latin)?,
            Some(JavaValue::String("plain".to_string()))
        );
        let wide = heap.instance(ObjectId(wide))?;
        assert_eq!(string_contents(&wide)?.as_deref(), Some("Grüße, 世界"));
        Ok(())
    }

    #[test]
    fn unwraps_boxes_and_arrays_but_not_plain_objects() -> HeapResult<()> {
        let mut dump = DumpBuilder::new();
        dump.class("java.lang.Object", None, &[]);
        let boxed = dump.boxed(Val::Long(i64::MIN));
        let flag = dump.boxed(Val::Bool(true));
        let doubles = dump.primitive_array(FieldKind::Double, &[Val::Double(f64::MIN), Val::Double(f64::NAN)]);
        let plain = dump.instance("java.lang.Object", &[]);
        let heap = Heap::from_bytes(dump.finish())?;

        let value = convert_instance(&heap.instance(ObjectId(boxed))?)?;
        assert_eq!(value, Some(JavaValue::Long(i64::MIN)));
        let value = convert_instance(&heap.instance(ObjectId(flag))?)?;
        assert_eq!(value, Some(JavaValue::Boolean(true)));

        let Some(JavaValue::DoubleArray(values)) = convert_instance(&heap.instance(ObjectId(doubles))?)? else {
            panic!("expected a double array");
        };
        assert_eq!(values[0], f64::MIN);
        assert!(values[1].is_nan());

        assert_eq!(convert_instance(&heap.instance(ObjectId(plain))?)?, None);
        Ok(())
    }
}
