//! Query filters for primary collection subscriptions
//!
//! A [`QueryFilter`] describes one change-feed query: a collection, a set of
//! field constraints, an ordering, and an optional limit. It is what the
//! backing store receives; the sync core never interprets it beyond the
//! `in` constraint used for chunking.

use crate::time::parse_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Field value is one of a list of values
    In,
    /// Array field contains the value
    ArrayContains,
}

/// A single field constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate this constraint against a document's fields.
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(field_value) = doc.get(&self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::Eq => field_value == &self.value,
            FilterOperator::In => self
                .value
                .as_array()
                .is_some_and(|values| values.contains(field_value)),
            FilterOperator::ArrayContains => field_value
                .as_array()
                .is_some_and(|values| values.contains(&self.value)),
        }
    }
}

/// Sort direction for ordered queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordering clause of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// A change-feed query against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub collection: String,
    pub constraints: Vec<FilterExpr>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    /// Start a query over `collection` with no constraints.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            constraints: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Add an equality constraint.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints
            .push(FilterExpr::new(field, FilterOperator::Eq, value.into()));
        self
    }

    /// Add an `in` constraint, replacing any existing one.
    pub fn where_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.constraints
            .retain(|c| c.operator != FilterOperator::In);
        let values = values.into_iter().map(Into::into).collect();
        self.constraints
            .push(FilterExpr::new(field, FilterOperator::In, Value::Array(values)));
        self
    }

    /// Add an array-contains constraint.
    pub fn where_array_contains(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.push(FilterExpr::new(
            field,
            FilterOperator::ArrayContains,
            value.into(),
        ));
        self
    }

    /// Order results by `field`.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The `in` constraint's field and values, if the query has one.
    pub fn in_constraint(&self) -> Option<(&str, &[Value])> {
        self.constraints
            .iter()
            .find(|c| c.operator == FilterOperator::In)
            .and_then(|c| c.value.as_array().map(|v| (c.field.as_str(), v.as_slice())))
    }

    /// A copy of this query whose `in` constraint matches only `values`.
    ///
    /// Returns the query unchanged when it has no `in` constraint.
    pub fn with_in_values(&self, values: Vec<Value>) -> Self {
        let mut filter = self.clone();
        for constraint in &mut filter.constraints {
            if constraint.operator == FilterOperator::In {
                constraint.value = Value::Array(values);
                break;
            }
        }
        filter
    }

    /// Whether a serialized document satisfies every constraint.
    pub fn matches(&self, doc: &Value) -> bool {
        self.constraints.iter().all(|c| c.matches(doc))
    }

    /// Compare two serialized documents by this query's ordering clause.
    ///
    /// Queries without an ordering treat every pair as equal.
    pub fn compare_documents(&self, a: &Value, b: &Value) -> Ordering {
        let Some(order) = &self.order_by else {
            return Ordering::Equal;
        };
        let ord = compare_values(
            a.get(&order.field).unwrap_or(&Value::Null),
            b.get(&order.field).unwrap_or(&Value::Null),
        );
        match order.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    }

    /// Stable-sort serialized documents by this query's ordering clause.
    pub fn sort_documents(&self, docs: &mut [Value]) {
        docs.sort_by(|a, b| self.compare_documents(a, b));
    }
}

/// Total order over JSON field values as a backend would sort them.
///
/// Nulls sort first, then booleans, numbers, timestamps, and strings.
/// Strings that parse as timestamps compare chronologically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Ok(tx), Ok(ty)) => tx.cmp(&ty),
            _ => x.cmp(y),
        },
        (Value::Object(_), Value::Object(_)) => match (parse_timestamp(a), parse_timestamp(b)) {
            (Ok(tx), Ok(ty)) => tx.cmp(&ty),
            _ => Ordering::Equal,
        },
        _ => rank(a).cmp(&rank(b)),
    }
}
