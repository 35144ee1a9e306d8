//! Streaming grouped aggregation.

use std::collections::BTreeMap;
use std::io::Write;

use ahash::AHashMap;

use crate::{CidxError, Result};

/// Aggregation function applied per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggFunc {
    /// Empty function: groups collapse to the marker value 1 (distinct
    /// group listing).
    #[default]
    None,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFunc {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "" => Self::None,
            "count" => Self::Count,
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "avg" => Self::Avg,
            other => {
                return Err(CidxError::BadRequest(format!("unknown agg function: {other}")))
            }
        })
    }

    /// Whether the function reads the aggregation column at all.
    pub fn uses_value(&self) -> bool {
        !matches!(self, Self::None | Self::Count)
    }
}

/// Accumulates `(group, value)` observations one row at a time.
///
/// `avg` keeps parallel sum and count maps and divides once at the end.
/// Values that fail to parse arrive here as 0.0 and still count toward the
/// average's divisor.
pub struct StreamAggregator {
    func: AggFunc,
    results: AHashMap<String, f64>,
    counts: AHashMap<String, i64>,
}

impl StreamAggregator {
    pub fn new(func: AggFunc) -> Self {
        Self {
            func,
            results: AHashMap::new(),
            counts: AHashMap::new(),
        }
    }

    pub fn add(&mut self, group: &str, val: f64) {
        match self.func {
            AggFunc::Count => {
                *self.results.entry(group.to_string()).or_insert(0.0) += 1.0;
            }
            AggFunc::Sum => {
                *self.results.entry(group.to_string()).or_insert(0.0) += val;
            }
            AggFunc::Min => {
                self.results
                    .entry(group.to_string())
                    .and_modify(|curr| {
                        if val < *curr {
                            *curr = val;
                        }
                    })
                    .or_insert(val);
            }
            AggFunc::Max => {
                self.results
                    .entry(group.to_string())
                    .and_modify(|curr| {
                        if val > *curr {
                            *curr = val;
                        }
                    })
                    .or_insert(val);
            }
            AggFunc::Avg => {
                *self.results.entry(group.to_string()).or_insert(0.0) += val;
                *self.counts.entry(group.to_string()).or_insert(0) += 1;
            }
            AggFunc::None => {
                self.results.insert(group.to_string(), 1.0);
            }
        }
    }

    /// Bulk update from block metadata: `n` rows of one group without
    /// decoding them. Only meaningful for `count` and the empty function.
    pub fn add_count(&mut self, group: &str, n: i64) {
        match self.func {
            AggFunc::Count => {
                *self.results.entry(group.to_string()).or_insert(0.0) += n as f64;
            }
            AggFunc::None => {
                self.results.insert(group.to_string(), 1.0);
            }
            _ => {}
        }
    }

    /// Finish and return the groups in sorted order.
    pub fn finalize(mut self) -> BTreeMap<String, f64> {
        if self.func == AggFunc::Avg {
            for (group, sum) in self.results.iter_mut() {
                if let Some(&count) = self.counts.get(group) {
                    if count > 0 {
                        *sum /= count as f64;
                    }
                }
            }
        }
        self.results.into_iter().collect()
    }

    /// Finish and emit the single JSON object output. Whole values are
    /// written as integers (`3`, not `3.0`) to match the wire format.
    pub fn write_json(self, writer: &mut impl Write) -> Result<()> {
        let mut obj = serde_json::Map::new();
        for (group, val) in self.finalize() {
            let num = if val.is_finite() && val.fract() == 0.0 && val.abs() < 9.0e15 {
                serde_json::Number::from(val as i64)
            } else {
                serde_json::Number::from_f64(val)
                    .unwrap_or_else(|| serde_json::Number::from(0))
            };
            obj.insert(group, serde_json::Value::Number(num));
        }
        serde_json::to_writer(&mut *writer, &serde_json::Value::Object(obj))
            .map_err(|e| CidxError::BadRequest(format!("aggregation encode: {e}")))?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(func: AggFunc, obs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        let mut agg = StreamAggregator::new(func);
        for (g, v) in obs {
            agg.add(g, *v);
        }
        agg.finalize()
    }

    #[test]
    fn test_count() {
        let out = run(AggFunc::Count, &[("a", 0.0), ("a", 0.0), ("b", 0.0)]);
        assert_eq!(out["a"], 2.0);
        assert_eq!(out["b"], 1.0);
    }

    #[test]
    fn test_sum_min_max() {
        let obs = [("a", 3.0), ("a", -1.0), ("b", 10.0)];
        assert_eq!(run(AggFunc::Sum, &obs)["a"], 2.0);
        assert_eq!(run(AggFunc::Min, &obs)["a"], -1.0);
        assert_eq!(run(AggFunc::Max, &obs)["a"], 3.0);
        assert_eq!(run(AggFunc::Max, &obs)["b"], 10.0);
    }

    #[test]
    fn test_avg_divides_once() {
        let out = run(AggFunc::Avg, &[("a", 2.0), ("a", 4.0), ("b", 5.0)]);
        assert_eq!(out["a"], 3.0);
        assert_eq!(out["b"], 5.0);
    }

    #[test]
    fn test_avg_counts_zero_contributions() {
        // unparseable cells arrive as 0.0 and still widen the divisor
        let out = run(AggFunc::Avg, &[("a", 6.0), ("a", 0.0)]);
        assert_eq!(out["a"], 3.0);
    }

    #[test]
    fn test_empty_func_marks_groups() {
        let out = run(AggFunc::None, &[("a", 9.0), ("b", 1.0), ("a", 2.0)]);
        assert_eq!(out["a"], 1.0);
        assert_eq!(out["b"], 1.0);
    }

    #[test]
    fn test_add_count_fast_path() {
        let mut agg = StreamAggregator::new(AggFunc::Count);
        agg.add_count("Eng", 3);
        agg.add("Eng", 0.0);
        let out = agg.finalize();
        assert_eq!(out["Eng"], 4.0);
    }

    #[test]
    fn test_parse() {
        assert_eq!(AggFunc::parse("").unwrap(), AggFunc::None);
        assert_eq!(AggFunc::parse("avg").unwrap(), AggFunc::Avg);
        assert!(AggFunc::parse("median").is_err());
        assert!(!AggFunc::Count.uses_value());
        assert!(AggFunc::Sum.uses_value());
    }

    #[test]
    fn test_json_output_sorted() {
        let mut agg = StreamAggregator::new(AggFunc::Count);
        agg.add("Sales", 0.0);
        agg.add("Eng", 0.0);
        agg.add("Eng", 0.0);
        let mut out = Vec::new();
        agg.write_json(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\"Eng\":2,\"Sales\":1}\n");
    }

    #[test]
    fn test_json_output_fractional() {
        let mut agg = StreamAggregator::new(AggFunc::Avg);
        agg.add("a", 1.0);
        agg.add("a", 2.0);
        let mut out = Vec::new();
        agg.write_json(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "{\"a\":1.5}\n");
    }
}
