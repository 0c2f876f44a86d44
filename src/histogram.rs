//! Per-class instance histogram.

use log::info;
use serde::Serialize;

use crate::error::HeapResult;
use crate::heap::Heap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramEntry {
    pub class_name: String,
    pub instances: usize,
    /// Sum of recorded payload bytes; object headers are not counted.
    pub bytes: usize,
}

/// Instance counts and payload bytes per class, largest first. Classes
/// without instances are omitted.
pub fn histogram(heap: &Heap) -> HeapResult<Vec<HistogramEntry>> {
    let mut entries = Vec::new();
    for class in heap.classes() {
        let mut bytes = 0;
        let mut instances = 0;
        for instance in class.instances() {
            bytes += instance?.shallow_size();
            instances += 1;
        }
        if instances > 0 {
            entries.push(HistogramEntry {
                class_name: class.name().to_string(),
                instances,
                bytes,
            });
        }
    }
    entries.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then(b.instances.cmp(&a.instances))
            .then_with(|| a.class_name.cmp(&b.class_name))
    });
    info!("histogram: {} classes with instances", entries.len());
    Ok(entries)
}
