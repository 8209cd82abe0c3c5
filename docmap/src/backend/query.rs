// Predicate evaluation, ordering and paging shared by the bundled backends

use super::{Predicate, QueryOptions};
use crate::document::Document;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

pub(crate) fn evaluate(predicate: &Predicate, doc: &Document) -> bool {
    match predicate {
        Predicate::All => true,
        Predicate::Match(expected) => expected.iter().all(|(key, value)| {
            let actual = doc.get(key).unwrap_or(&JsonValue::Null);
            json_eq(actual, value)
        }),
        Predicate::Where(f) => f(doc),
        Predicate::And(parts) => parts.iter().all(|p| evaluate(p, doc)),
        Predicate::Or(parts) => parts.iter().any(|p| evaluate(p, doc)),
    }
}

/// Equality where numbers compare by value, so `1` equals `1.0`.
pub(crate) fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::Array(xs), JsonValue::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (JsonValue::Object(xs), JsonValue::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map_or(false, |y| json_eq(x, y)))
        }
        _ => a == b,
    }
}

/// Total order used for `order_by`: null < bool < number < string < list < object.
pub(crate) fn compare_json(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) => 4,
            JsonValue::Object(_) => 5,
        }
    }

    match (a, b) {
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Array(xs), JsonValue::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_json(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Filter documents already in insertion order, then sort, skip and take.
pub(crate) fn run_query<I>(docs: I, predicate: &Predicate, options: &QueryOptions) -> Vec<Document>
where
    I: IntoIterator<Item = Document>,
{
    let mut matched: Vec<Document> = docs
        .into_iter()
        .filter(|doc| evaluate(predicate, doc))
        .collect();

    if let Some(order) = &options.order_by {
        // sort_by is stable: ties keep insertion order
        matched.sort_by(|a, b| {
            let x = a.get(&order.field).unwrap_or(&JsonValue::Null);
            let y = b.get(&order.field).unwrap_or(&JsonValue::Null);
            let ord = compare_json(x, y);
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    let offset = options.offset.unwrap_or(0);
    let limit = options.limit.unwrap_or(usize::MAX);
    matched.into_iter().skip(offset).take(limit).collect()
}
