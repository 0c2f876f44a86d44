use serde::Serialize;
use std::fmt;

/// Identifier of an object or class inside one dump. Id `0` is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// HPROF basic type codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum BasicType {
    Object = 2,
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl BasicType {
    pub const PRIMITIVES: [BasicType; 8] = [
        BasicType::Boolean,
        BasicType::Char,
        BasicType::Float,
        BasicType::Double,
        BasicType::Byte,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
    ];

    pub fn from_code(code: u8) -> Option<BasicType> {
        match code {
            2 => Some(BasicType::Object),
            4 => Some(BasicType::Boolean),
            5 => Some(BasicType::Char),
            6 => Some(BasicType::Float),
            7 => Some(BasicType::Double),
            8 => Some(BasicType::Byte),
            9 => Some(BasicType::Short),
            10 => Some(BasicType::Int),
            11 => Some(BasicType::Long),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Encoded width in bytes. Object references take the dump's id size.
    pub fn size(self, id_size: usize) -> usize {
        match self {
            BasicType::Object => id_size,
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Float | BasicType::Int => 4,
            BasicType::Double | BasicType::Long => 8,
        }
    }

    pub fn java_name(self) -> &'static str {
        match self {
            BasicType::Object => "java.lang.Object",
            BasicType::Boolean => "boolean",
            BasicType::Char => "char",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Byte => "byte",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
        }
    }

    fn from_descriptor(c: char) -> Option<BasicType> {
        match c {
            'Z' => Some(BasicType::Boolean),
            'C' => Some(BasicType::Char),
            'F' => Some(BasicType::Float),
            'D' => Some(BasicType::Double),
            'B' => Some(BasicType::Byte),
            'S' => Some(BasicType::Short),
            'I' => Some(BasicType::Int),
            'J' => Some(BasicType::Long),
            _ => None,
        }
    }
}

/// One decoded field or array slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Value {
    Null,
    Object(ObjectId),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl Value {
    pub fn reference(id: ObjectId) -> Value {
        if id.is_null() {
            Value::Null
        } else {
            Value::Object(id)
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Null | Value::Object(_))
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(i64::from(v)),
            Value::Short(v) => Some(i64::from(v)),
            Value::Char(v) => Some(i64::from(v)),
            Value::Int(v) => Some(i64::from(v)),
            Value::Long(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Object(id) => write!(f, "{id}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Char(v) => f.write_str(&char_text(*v)),
            Value::Float(v) => f.write_str(&float32_text(*v)),
            Value::Double(v) => f.write_str(&float_text(*v)),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
        }
    }
}

pub(crate) fn float_text(v: f64) -> String {
    java_float_text(v, format!("{v}"), format!("{v:e}"), format!("{v:.1e}"))
}

pub(crate) fn float32_text(v: f32) -> String {
    java_float_text(f64::from(v), format!("{v}"), format!("{v:e}"), format!("{v:.1e}"))
}

/// `Double.toString` layout: plain decimal for magnitudes in `[1e-3, 1e7)`,
/// otherwise `d.ddE±n`, always with a fractional digit.
fn java_float_text(v: f64, plain: String, shortest: String, rounded: String) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if v == 0.0 || (1e-3..1e7).contains(&v.abs()) {
        return if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        };
    }
    // a single shortest digit still gets two, correctly rounded
    let scientific = if shortest.contains('.') { shortest } else { rounded };
    scientific.replace('e', "E")
}

pub(crate) fn char_text(unit: u16) -> String {
    char::decode_utf16([unit])
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Converts a JVM internal class name (`java/lang/String`, `[I`,
/// `[Ljava/lang/Object;`) to its source form.
pub fn java_class_name(internal: &str) -> String {
    let dims = internal.chars().take_while(|c| *c == '[').count();
    if dims == 0 {
        return internal.replace('/', ".");
    }

    let element = &internal[dims..];
    let mut base = if let Some(body) = element.strip_prefix('L') {
        body.trim_end_matches(';').replace('/', ".")
    } else {
        let mut chars = element.chars();
        match (chars.next().and_then(BasicType::from_descriptor), chars.next()) {
            (Some(t), None) => t.java_name().to_string(),
            _ => element.replace('/', "."),
        }
    };
    for _ in 0..dims {
        base.push_str("[]");
    }
    base
}
