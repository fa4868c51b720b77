//! `x-death` header parsing.
//!
//! Brokers encode the count with whichever integer width they like, and a
//! header rewritten by another client can be missing or malformed. Anything
//! unreadable is skipped rather than failing the delivery.

use lapin::types::{AMQPValue, FieldTable, ShortString};

use crate::messages::DeathRecord;

/// Header carrying the dead-letter history.
pub const X_DEATH: &str = "x-death";

/// Reads the dead-letter history from delivery headers.
#[must_use]
pub fn death_records(headers: Option<&FieldTable>) -> Vec<DeathRecord> {
    let Some(headers) = headers else {
        return Vec::new();
    };
    match field(headers, X_DEATH) {
        Some(AMQPValue::FieldArray(entries)) => entries
            .as_slice()
            .iter()
            .filter_map(|entry| match entry {
                AMQPValue::FieldTable(table) => Some(death_record(table)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn field<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table.inner().get(&ShortString::from(name))
}

fn death_record(table: &FieldTable) -> DeathRecord {
    DeathRecord {
        count: field(table, "count").and_then(as_count).unwrap_or(0),
        reason: field(table, "reason").and_then(as_text),
        queue: field(table, "queue").and_then(as_text),
    }
}

fn as_count(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::Timestamp(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.trim().parse().ok(),
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}
