use std::borrow::Cow;
use std::cmp::Ordering;

use ordered_float::OrderedFloat;
use serde_json::Value;

use crate::database::{MergeConfig, NullOrdering};

/// How two values of one sort key compare during the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    pub null_ordering: NullOrdering,
    pub trim_strings: bool,
    pub case_sensitive: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self::from(&MergeConfig::default())
    }
}

impl From<&MergeConfig> for CompareOptions {
    fn from(config: &MergeConfig) -> Self {
        Self {
            null_ordering: config.null_ordering,
            trim_strings: config.trim_strings,
            case_sensitive: config.case_sensitive,
        }
    }
}

impl CompareOptions {
    fn normalize<'a>(&self, s: &'a str) -> Cow<'a, str> {
        let s = if self.trim_strings { s.trim() } else { s };
        if self.case_sensitive { Cow::Borrowed(s) } else { Cow::Owned(s.to_lowercase()) }
    }

    /// Position of a NULL against a non-null value in output order.
    fn null_first(&self, descending: bool) -> bool {
        match self.null_ordering {
            NullOrdering::First => true,
            NullOrdering::Last => false,
            NullOrdering::High => descending,
            NullOrdering::Low => !descending,
        }
    }
}

pub struct Helpers;

impl Helpers {
    pub fn canonical_tuple(vals: &[Value]) -> String {
        // arrays serialize in order, so equal tuples give equal strings
        serde_json::to_string(vals).unwrap_or_default()
    }

    /// Key under which two rows count as duplicates, honouring string
    /// trimming and case folding.
    pub fn distinct_key(vals: &[Value], options: &CompareOptions) -> String {
        if options.case_sensitive && !options.trim_strings {
            return Self::canonical_tuple(vals);
        }
        let normalized: Vec<Value> = vals
            .iter()
            .map(|v| match v {
                Value::String(s) => Value::String(options.normalize(s).into_owned()),
                other => other.clone(),
            })
            .collect();
        Self::canonical_tuple(&normalized)
    }

    /// Output-order comparison of one sort key.
    pub fn cmp_json_for_sort(a: &Value, b: &Value, descending: bool, options: &CompareOptions) -> Ordering {
        use Ordering::*;
        use serde_json::Value::*;
        let null_first = options.null_first(descending);
        let ord = match (a, b) {
            (Null, Null) => return Equal,
            (Null, _) => return if null_first { Less } else { Greater },
            (_, Null) => return if null_first { Greater } else { Less },
            (Bool(x), Bool(y)) => x.cmp(y),
            (Number(x), Number(y)) => {
                let ax = OrderedFloat(x.as_f64().unwrap_or(f64::NAN));
                let by = OrderedFloat(y.as_f64().unwrap_or(f64::NAN));
                ax.cmp(&by)
            }
            (String(x), String(y)) => options.normalize(x).cmp(&options.normalize(y)),
            (Array(_), Array(_)) | (Object(_), Object(_)) => {
                let sa = serde_json::to_string(a).unwrap_or_default();
                let sb = serde_json::to_string(b).unwrap_or_default();
                sa.cmp(&sb)
            }
            (lhs, rhs) => Self::type_rank(lhs).cmp(&Self::type_rank(rhs)),
        };
        if descending { ord.reverse() } else { ord }
    }

    fn type_rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0, Value::Bool(_) => 1, Value::Number(_) => 2, Value::String(_) => 3,
            Value::Array(_) => 4, Value::Object(_) => 5
        }
    }
}
