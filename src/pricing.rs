//! Cost model - pure pricing of a generation request.
//!
//! Credits are integer units (i64); all arithmetic runs in f64 and the
//! final price is `ceil`ed, so callers are never undercharged by
//! rounding. No I/O, fully deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::ParamMap;

/// How a single parameter influences the price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Multiplier {
    /// Value-keyed multiplier map: the chosen value scales the running
    /// cost; unmapped values scale by 1.
    ValueKeyed(BTreeMap<String, f64>),
    /// Flat per-unit factor: adds `factor × n` for numeric values,
    /// `factor × len` for arrays, and scales the running cost by `factor`
    /// when the parameter is boolean `true`.
    Flat(f64),
}

/// Per-model cost configuration: parameter name → multiplier.
pub type CostTable = BTreeMap<String, Multiplier>;

/// Price a request. Only parameters present in both the request and the
/// cost table participate.
pub fn price(base_cost: i64, table: &CostTable, params: &ParamMap) -> i64 {
    let mut acc = base_cost as f64;

    for (name, multiplier) in table {
        let Some(value) = params.get(name) else {
            continue;
        };
        match multiplier {
            Multiplier::ValueKeyed(map) => {
                if let Some(key) = value.as_str() {
                    acc *= map.get(key).copied().unwrap_or(1.0);
                }
            }
            Multiplier::Flat(factor) => match value {
                Value::Number(n) => {
                    acc += factor * n.as_f64().unwrap_or(0.0);
                }
                Value::Array(items) => {
                    acc += factor * items.len() as f64;
                }
                Value::Bool(true) => {
                    acc *= factor;
                }
                _ => {}
            },
        }
    }

    acc.ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> ParamMap {
        serde_json::from_value(v).unwrap()
    }

    fn keyed(pairs: &[(&str, f64)]) -> Multiplier {
        Multiplier::ValueKeyed(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        )
    }

    #[test]
    fn value_keyed_multiplier() {
        let mut table = CostTable::new();
        table.insert(
            "quality".into(),
            keyed(&[("Standard", 1.0), ("HD", 1.5)]),
        );
        assert_eq!(price(10, &table, &params(json!({"quality": "HD"}))), 15);
        assert_eq!(
            price(10, &table, &params(json!({"quality": "Standard"}))),
            10
        );
    }

    #[test]
    fn unmapped_value_defaults_to_one() {
        let mut table = CostTable::new();
        table.insert("quality".into(), keyed(&[("HD", 1.5)]));
        assert_eq!(price(10, &table, &params(json!({"quality": "Draft"}))), 10);
    }

    #[test]
    fn flat_factor_per_array_element() {
        let mut table = CostTable::new();
        table.insert("uploaded_image".into(), Multiplier::Flat(2.0));
        assert_eq!(
            price(5, &table, &params(json!({"uploaded_image": ["a", "b"]}))),
            9
        );
    }

    #[test]
    fn flat_factor_times_numeric_value() {
        let mut table = CostTable::new();
        table.insert("duration_secs".into(), Multiplier::Flat(0.5));
        assert_eq!(
            price(10, &table, &params(json!({"duration_secs": 30}))),
            25
        );
    }

    #[test]
    fn boolean_true_scales_by_factor() {
        let mut table = CostTable::new();
        table.insert("upscale".into(), Multiplier::Flat(2.0));
        assert_eq!(price(10, &table, &params(json!({"upscale": true}))), 20);
        assert_eq!(price(10, &table, &params(json!({"upscale": false}))), 10);
    }

    #[test]
    fn absent_parameters_do_not_price() {
        let mut table = CostTable::new();
        table.insert("quality".into(), keyed(&[("HD", 1.5)]));
        table.insert("uploaded_image".into(), Multiplier::Flat(2.0));
        assert_eq!(price(7, &table, &params(json!({}))), 7);
    }

    #[test]
    fn fractional_result_rounds_up() {
        let mut table = CostTable::new();
        table.insert("quality".into(), keyed(&[("HD", 1.5)]));
        assert_eq!(price(3, &table, &params(json!({"quality": "HD"}))), 5);
    }
}
