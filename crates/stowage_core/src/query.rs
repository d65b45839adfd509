//! Query specifications.
//!
//! A [`Query`] names a class, an ordered list of filter predicates, an
//! optional sort key and an optional limit. It is built with a consuming
//! builder and cannot be changed afterwards:
//!
//! ```
//! use stowage_core::{Query, SortDirection};
//!
//! let query = Query::new("Food")
//!     .unwrap()
//!     .where_equal_to("name", "taco")
//!     .order_by_ascending("name");
//!
//! assert_eq!(query.class_name(), "Food");
//! assert_eq!(query.predicates().len(), 1);
//! assert_eq!(query.sort().unwrap().direction, SortDirection::Ascending);
//! ```
//!
//! Queries are sent to a remote endpoint. [`Query::evaluate`] implements the
//! matching rules for endpoints that hold their data in memory.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::entity::{validate_class_name, Entity};
use crate::error::CoreResult;
use crate::value::Value;

/// How a predicate compares a field to its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    /// Field equals the operand.
    Equal,
    /// Field is missing or differs from the operand.
    NotEqual,
    /// Field orders before the operand.
    LessThan,
    /// Field orders before or equal to the operand.
    LessThanOrEqual,
    /// Field orders after the operand.
    GreaterThan,
    /// Field orders after or equal to the operand.
    GreaterThanOrEqual,
    /// Array field contains the operand.
    Contains,
    /// Field is present (operand ignored).
    Exists,
}

/// A single `(field, comparator, value)` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Field name.
    pub field: String,
    /// Comparison to apply.
    pub comparator: Comparator,
    /// Right-hand operand.
    pub value: Value,
}

impl Predicate {
    /// Returns true if the entity satisfies this predicate.
    pub fn matches(&self, entity: &Entity) -> bool {
        let field = entity.get(&self.field);
        match self.comparator {
            Comparator::Exists => field.is_some(),
            Comparator::NotEqual => !field.is_some_and(|v| v.loosely_equals(&self.value)),
            Comparator::Equal => field.is_some_and(|v| v.loosely_equals(&self.value)),
            Comparator::Contains => field
                .and_then(Value::as_array)
                .is_some_and(|items| items.iter().any(|item| item.loosely_equals(&self.value))),
            Comparator::LessThan => self.ordering(field) == Some(Ordering::Less),
            Comparator::LessThanOrEqual => {
                matches!(self.ordering(field), Some(Ordering::Less | Ordering::Equal))
            }
            Comparator::GreaterThan => self.ordering(field) == Some(Ordering::Greater),
            Comparator::GreaterThanOrEqual => {
                matches!(
                    self.ordering(field),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }
        }
    }

    fn ordering(&self, field: Option<&Value>) -> Option<Ordering> {
        field.and_then(|v| v.compare(&self.value))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Sort key and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    /// Field to sort by.
    pub field: String,
    /// Direction.
    pub direction: SortDirection,
}

/// An immutable query against one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    class_name: String,
    predicates: Vec<Predicate>,
    sort: Option<SortOrder>,
    limit: Option<usize>,
}

impl Query {
    /// Starts a query returning every entity of the class.
    pub fn new(class_name: impl Into<String>) -> CoreResult<Self> {
        let class_name = class_name.into();
        validate_class_name(&class_name)?;
        Ok(Self {
            class_name,
            predicates: Vec::new(),
            sort: None,
            limit: None,
        })
    }

    /// Adds a predicate.
    #[must_use]
    pub fn filter(
        mut self,
        field: impl Into<String>,
        comparator: Comparator,
        value: impl Into<Value>,
    ) -> Self {
        self.predicates.push(Predicate {
            field: field.into(),
            comparator,
            value: value.into(),
        });
        self
    }

    /// Only entities whose field equals `value`.
    #[must_use]
    pub fn where_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Comparator::Equal, value)
    }

    /// Only entities whose field differs from `value`.
    #[must_use]
    pub fn where_not_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Comparator::NotEqual, value)
    }

    /// Only entities whose field orders before `value`.
    #[must_use]
    pub fn where_less_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Comparator::LessThan, value)
    }

    /// Only entities whose field orders after `value`.
    #[must_use]
    pub fn where_greater_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Comparator::GreaterThan, value)
    }

    /// Only entities whose array field contains `value`.
    #[must_use]
    pub fn where_contains(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Comparator::Contains, value)
    }

    /// Only entities that have the field.
    #[must_use]
    pub fn where_exists(self, field: impl Into<String>) -> Self {
        self.filter(field, Comparator::Exists, Value::Null)
    }

    /// Sorts by the field, smallest first. Replaces any earlier sort.
    #[must_use]
    pub fn order_by_ascending(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(SortOrder {
            field: field.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    /// Sorts by the field, largest first. Replaces any earlier sort.
    #[must_use]
    pub fn order_by_descending(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(SortOrder {
            field: field.into(),
            direction: SortDirection::Descending,
        });
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The class being queried.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Predicates in the order they were added.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Sort key, if any.
    pub fn sort(&self) -> Option<&SortOrder> {
        self.sort.as_ref()
    }

    /// Result cap, if any.
    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Returns true if the entity belongs to the class and satisfies every
    /// predicate.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.class_name() == self.class_name && self.predicates.iter().all(|p| p.matches(entity))
    }

    /// Filters, sorts and truncates a candidate set.
    ///
    /// Entities missing the sort field (or holding a value of an unrelated
    /// kind) sort after all others. The sort is stable.
    pub fn evaluate<I>(&self, candidates: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = Entity>,
    {
        let mut results: Vec<Entity> = candidates
            .into_iter()
            .filter(|entity| self.matches(entity))
            .collect();

        if let Some(sort) = &self.sort {
            results.sort_by(|a, b| compare_by(a, b, sort));
        }
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }
}

fn compare_by(a: &Entity, b: &Entity, sort: &SortOrder) -> Ordering {
    match (a.get(&sort.field), b.get(&sort.field)) {
        (Some(x), Some(y)) => match x.compare(y) {
            Some(ord) => match sort.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            },
            None => Ordering::Equal,
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn food(name: &str, price: i64, ingredients: &[&str]) -> Entity {
        let mut food = Entity::new("Food").unwrap();
        food.set("name", name).unwrap();
        food.set("price", price).unwrap();
        food.set("ingredients", ingredients.to_vec()).unwrap();
        food
    }

    fn menu() -> Vec<Entity> {
        vec![
            food("taco", 4, &["corn", "beef", "salsa"]),
            food("burrito", 9, &["flour", "beef", "rice"]),
            food("nachos", 6, &["corn", "cheese"]),
            food("taco", 5, &["flour", "chicken"]),
        ]
    }

    fn names(results: &[Entity]) -> Vec<&str> {
        results.iter().filter_map(|e| e.get_text("name")).collect()
    }

    #[test]
    fn query_rejects_invalid_class() {
        assert!(Query::new("").is_err());
        assert!(Query::new("9lives").is_err());
    }

    #[test]
    fn equality_filter_and_ascending_sort() {
        let query = Query::new("Food")
            .unwrap()
            .where_equal_to("name", "taco")
            .order_by_ascending("price");

        let results = query.evaluate(menu());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].get("price"), Some(&Value::Integer(4)));
        assert_eq!(results[1].get("price"), Some(&Value::Integer(5)));
    }

    #[test]
    fn other_classes_never_match() {
        let mut table = Entity::new("Furniture").unwrap();
        table.set("name", "taco").unwrap();

        let query = Query::new("Food").unwrap().where_equal_to("name", "taco");
        assert!(!query.matches(&table));
    }

    #[test]
    fn range_filters() {
        let query = Query::new("Food")
            .unwrap()
            .where_greater_than("price", 4)
            .where_less_than("price", 9.0)
            .order_by_descending("price");
        assert_eq!(names(&query.evaluate(menu())), vec!["nachos", "taco"]);
    }

    #[test]
    fn contains_filter() {
        let query = Query::new("Food")
            .unwrap()
            .where_contains("ingredients", "corn")
            .order_by_ascending("name");
        assert_eq!(names(&query.evaluate(menu())), vec!["nachos", "taco"]);
    }

    #[test]
    fn not_equal_and_exists() {
        let mut plain = Entity::new("Food").unwrap();
        plain.set("price", 1).unwrap();
        let mut candidates = menu();
        candidates.push(plain);

        let not_taco = Query::new("Food").unwrap().where_not_equal_to("name", "taco");
        // The entity without a name counts as "not taco"
        assert_eq!(not_taco.evaluate(candidates.clone()).len(), 3);

        let named = Query::new("Food").unwrap().where_exists("name");
        assert_eq!(named.evaluate(candidates).len(), 4);
    }

    #[test]
    fn missing_sort_field_sorts_last() {
        let mut plain = Entity::new("Food").unwrap();
        plain.set("price", 1).unwrap();
        let mut candidates = vec![plain];
        candidates.extend(menu());

        let query = Query::new("Food").unwrap().order_by_ascending("name");
        let results = query.evaluate(candidates);
        assert_eq!(names(&results), vec!["burrito", "nachos", "taco", "taco"]);
        assert!(results[4].get("name").is_none());
    }

    #[test]
    fn limit_truncates_after_sorting() {
        let query = Query::new("Food")
            .unwrap()
            .order_by_descending("price")
            .limit(2);
        assert_eq!(names(&query.evaluate(menu())), vec!["burrito", "nachos"]);
    }

    #[test]
    fn later_sort_replaces_earlier() {
        let query = Query::new("Food")
            .unwrap()
            .order_by_ascending("name")
            .order_by_descending("price");
        assert_eq!(query.sort().unwrap().field, "price");
    }
}
