//! # hprof-walker
//!
//! Random-access reading of JVM heap dumps (HPROF) and a small path language
//! for pulling values out of them.
//!
//! ## Architecture
//!
//! - **reader**: HPROF header, record and heap sub-record decoding
//! - **index**: one-pass index of classes, object offsets and GC roots
//! - **heap**: `Heap` and `JavaClass`, the read model over a mapped dump
//! - **instance**: lazily materialized objects and arrays
//! - **pattern**: wildcard class-name patterns
//! - **path**: path expression parser
//! - **views**: logical views over collection layouts (`?entrySet`)
//! - **convert**: unwrapping of strings, wrappers and primitive arrays
//! - **walker**: lazy path evaluation (`walk`, `value_of`, ...)
//! - **histogram**: per-class instance counts and sizes
//!
//! ```no_run
//! use hprof_walker::heap::Heap;
//! use hprof_walker::walker::value_of;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let heap = Heap::open("app.hprof")?;
//! let class = heap.require_class("com.example.Cache")?;
//! for instance in class.instances() {
//!     let size = value_of(&instance?, "map?entrySet[key=size].value")?;
//!     println!("{size:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod convert;
pub mod error;
pub mod heap;
pub mod histogram;
pub mod index;
pub mod instance;
pub mod path;
pub mod pattern;
pub mod reader;
pub mod types;
pub mod views;
pub mod walker;

#[cfg(test)]
mod fixture;

pub use error::{HeapError, QueryError};
pub use heap::{Heap, JavaClass};
pub use instance::Instance;
pub use walker::{Hit, Walker, string_value, value_of, walk, walk_first};
