/*!
Cheap size estimation used to choose between buffered and chunked encoding.

The estimate samples the first few elements of the bulk array and
extrapolates linearly, so it assumes elements of roughly uniform size. It is
a heuristic: a wrong estimate only changes which encoding is picked, never
the decoded result.
*/

use std::io::{self, Write};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{KeepsakeError, Result};

/// Number of leading bulk elements measured
pub const SAMPLE_SIZE: usize = 5;

/// `Write` sink that only counts bytes
#[derive(Default)]
struct ByteCounter(u64);

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn serialized_len<T: Serialize + ?Sized>(value: &T) -> Result<u64> {
    let mut counter = ByteCounter::default();
    serde_json::to_writer(&mut counter, value)
        .map_err(|e| KeepsakeError::encoding(format!("Failed to measure document: {e}")))?;
    Ok(counter.0)
}

/// Pick the array field to partition
///
/// With `preferred` set, that field is used if it holds an array and nothing
/// is chunked otherwise. Without it, the array field with the most elements
/// wins; ties go to the lexicographically smallest key.
pub fn select_bulk_field<'a>(document: &'a Map<String, Value>, preferred: Option<&str>) -> Option<&'a str> {
    if let Some(name) = preferred {
        return document
            .get_key_value(name)
            .filter(|(_, value)| value.is_array())
            .map(|(key, _)| key.as_str());
    }

    document
        .iter()
        .filter_map(|(key, value)| value.as_array().map(|items| (key.as_str(), items.len())))
        .fold(None, |best: Option<(&str, usize)>, (key, len)| match best {
            Some((best_key, best_len)) if best_len > len || (best_len == len && best_key <= key) => best,
            _ => Some((key, len)),
        })
        .map(|(key, _)| key)
}

/// Estimate the serialized size of `document` in bytes
///
/// The bulk array contributes `average sampled element size * element count`;
/// every other top-level field contributes its exact serialized size.
pub fn estimate_document_size(document: &Value, bulk_field: Option<&str>) -> Result<u64> {
    let Some(fields) = document.as_object() else {
        return serialized_len(document);
    };

    let mut estimate = 2u64;
    for (key, value) in fields {
        // "key": value,
        estimate += key.len() as u64 + 4;

        match value.as_array() {
            Some(items) if Some(key.as_str()) == bulk_field => {
                estimate += 2 + extrapolate(items)?;
            }
            _ => estimate += serialized_len(value)?,
        }
    }
    Ok(estimate)
}

fn extrapolate(items: &[Value]) -> Result<u64> {
    let sample = &items[..items.len().min(SAMPLE_SIZE)];
    if sample.is_empty() {
        return Ok(0);
    }

    let mut sampled = 0u64;
    for item in sample {
        sampled += serialized_len(item)? + 1;
    }
    let average = sampled as f64 / sample.len() as f64;
    Ok((average * items.len() as f64).round() as u64)
}
