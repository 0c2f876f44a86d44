//! Error taxonomy for the heap model and the path query layer.

use thiserror::Error;

use crate::types::ObjectId;

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Failed to open heap dump {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not an HPROF heap dump: {0}")]
    BadHeader(String),

    #[error("Unsupported identifier size {0}")]
    UnsupportedIdSize(u32),

    #[error("Truncated dump: {needed} bytes needed at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Unknown basic type code {code} at offset {offset}")]
    BadBasicType { code: u8, offset: usize },

    #[error("Unknown heap dump sub-record 0x{tag:02x} at offset {offset}")]
    UnknownSubRecord { tag: u8, offset: usize },

    #[error("Corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },

    #[error("Class {0} not found")]
    UnknownClass(String),

    #[error("Class {class} has no field '{field}'")]
    UnknownField { class: String, field: String },

    #[error("Instance {object} refers to missing class {class}")]
    DanglingClass { object: ObjectId, class: ObjectId },

    #[error("Object {0} is not present in the dump")]
    DanglingObject(ObjectId),

    #[error("Index {index} out of bounds for array {object} of length {length}")]
    IndexOutOfBounds {
        object: ObjectId,
        index: i64,
        length: usize,
    },

    #[error("Instance {object} of {class} is not an array")]
    NotAnArray { object: ObjectId, class: String },
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Syntax error in path '{path}' at position {position}: {message}")]
    Syntax {
        path: String,
        position: usize,
        message: String,
    },

    #[error("Step '{step}' of path '{path}' failed: {source}")]
    Heap {
        path: String,
        step: String,
        #[source]
        source: HeapError,
    },

    #[error("Step '{step}' of path '{path}': index {index} out of bounds (length {length})")]
    OutOfBounds {
        path: String,
        step: String,
        index: i64,
        length: usize,
    },

    #[error("Step '{step}' of path '{path}': {message}")]
    Type {
        path: String,
        step: String,
        message: String,
    },

    #[error("Step '{step}' of path '{path}': no view named '{view}' applies to {class}")]
    UnknownView {
        path: String,
        step: String,
        view: String,
        class: String,
    },

    #[error("Result of '{path}' is a reference to {class}, not a convertible value")]
    NotConvertible { path: String, class: String },
}

impl QueryError {
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Self::OutOfBounds { .. })
    }
}

pub type HeapResult<T> = std::result::Result<T, HeapError>;
pub type QueryResult<T> = std::result::Result<T, QueryError>;
