//! Splitting a loop's input across jobs and joining their outputs.

use serde_json::Value;

use crate::error::{ClusterError, Result};

/// Splits `items` into at most `partitions` contiguous, non-empty slices
/// whose lengths differ by at most one. An empty input yields one empty
/// slice.
pub fn split(items: &[Value], partitions: usize) -> Vec<Vec<Value>> {
    let count = partitions.clamp(1, items.len().max(1));
    let base = items.len() / count;
    let extra = items.len() % count;
    let mut slices = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let len = base + usize::from(index < extra);
        slices.push(items[start..start + len].to_vec());
        start += len;
    }
    slices
}

/// Concatenates partition outputs in partition order. Every output must be
/// an array.
pub fn concat(mut results: Vec<(usize, Value)>) -> Result<Value> {
    results.sort_by_key(|(index, _)| *index);
    let mut joined = Vec::new();
    for (index, value) in results {
        match value {
            Value::Array(items) => joined.extend(items),
            other => {
                return Err(ClusterError::Orchestration(format!(
                    "partition {} returned {} instead of a list",
                    index,
                    kind(&other)
                )))
            }
        }
    }
    Ok(Value::Array(joined))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numbers(n: i64) -> Vec<Value> {
        (1..=n).map(Value::from).collect()
    }

    #[test]
    fn test_split_is_contiguous_and_balanced() {
        let slices = split(&numbers(7), 3);
        assert_eq!(
            slices,
            vec![
                vec![json!(1), json!(2), json!(3)],
                vec![json!(4), json!(5)],
                vec![json!(6), json!(7)],
            ]
        );
    }

    #[test]
    fn test_split_never_makes_empty_slices() {
        assert_eq!(split(&numbers(2), 5).len(), 2);
        assert_eq!(split(&[], 4), vec![Vec::<Value>::new()]);
        assert_eq!(split(&numbers(3), 0).len(), 1);
    }

    #[test]
    fn test_concat_orders_by_partition() {
        let joined = concat(vec![
            (2, json!([25, 36])),
            (0, json!([1, 4])),
            (1, json!([9, 16])),
        ])
        .unwrap();
        assert_eq!(joined, json!([1, 4, 9, 16, 25, 36]));
    }

    #[test]
    fn test_concat_rejects_non_lists() {
        let err = concat(vec![(0, json!([1])), (1, json!(2))]).unwrap_err();
        assert!(err.to_string().contains("partition 1 returned a number"));
    }
}
