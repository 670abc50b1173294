//! Property tests for the filter algebra.
//!
//! Compiled filters are evaluated with the in-memory backend's matcher and
//! checked against a direct evaluation of the filter tree.

use proptest::prelude::*;
use seeker::backend::query_matches;
use seeker::filter::{MaxOp, MinOp, F};
use seeker::schema::{DocumentDescriptor, FieldSchema, MemorySource, TYPE_FIELD};
use serde_json::{json, Value};
use std::sync::Arc;

const GENRES: &[&str] = &["scifi", "fantasy", "horror", "romance"];

fn descriptor() -> DocumentDescriptor {
    DocumentDescriptor::builder(Arc::new(MemorySource::new("Book", vec![])))
        .field(FieldSchema::raw_string("genre"))
        .field(FieldSchema::integer("year"))
        .build()
        .unwrap()
}

fn doc(genre: &str, year: i64) -> Value {
    let mut doc = json!({ "genre": genre, "year": year });
    doc[TYPE_FIELD] = json!("book");
    doc
}

fn matches(filter: &F, descriptor: &DocumentDescriptor, id: &str, doc: &Value) -> bool {
    let query = filter.compile(descriptor).unwrap();
    query_matches(&query, id, doc)
}

/// Direct evaluation of a filter over a (genre, year) document
fn eval(filter: &F, id: &str, genre: &str, year: i64) -> bool {
    let leaf_eq = |field: &str, value: &Value| match field {
        "genre" => value.as_str() == Some(genre),
        "year" => value.as_i64() == Some(year),
        _ => false,
    };
    match filter {
        F::Term { field, value } => match value {
            Value::Array(values) => values.iter().any(|v| leaf_eq(field.as_str(), v)),
            value => leaf_eq(field.as_str(), value),
        },
        F::Range {
            min,
            max,
            min_op,
            max_op,
            ..
        } => {
            let above = match (min.as_ref().and_then(Value::as_i64), min_op) {
                (None, _) => true,
                (Some(m), MinOp::Gt) => year > m,
                (Some(m), MinOp::Gte) => year >= m,
            };
            let below = match (max.as_ref().and_then(Value::as_i64), max_op) {
                (None, _) => true,
                (Some(m), MaxOp::Lt) => year < m,
                (Some(m), MaxOp::Lte) => year <= m,
            };
            above && below
        }
        F::Ids(ids) => ids.iter().any(|i| i == id),
        F::And(children) => children.iter().all(|c| eval(c, id, genre, year)),
        F::Or(children) => children.iter().any(|c| eval(c, id, genre, year)),
        F::Not(inner) => !eval(inner, id, genre, year),
    }
}

fn genre() -> impl Strategy<Value = &'static str> {
    prop::sample::select(GENRES.to_vec())
}

fn year() -> impl Strategy<Value = i64> {
    1900i64..2000
}

fn leaf() -> impl Strategy<Value = F> {
    prop_oneof![
        genre().prop_map(|g| F::term("genre", g)),
        prop::collection::vec(genre(), 1..3).prop_map(|gs| F::terms("genre", gs)),
        year().prop_map(|y| F::term("year", y)),
        (year(), year()).prop_map(|(a, b)| F::between("year", a.min(b), a.max(b))),
        year().prop_map(|y| F::gt("year", y)),
        year().prop_map(|y| F::lt("year", y)),
        prop::collection::vec(1u8..6, 1..3)
            .prop_map(|ids| F::ids(ids.into_iter().map(|i| i.to_string()))),
    ]
}

fn filter() -> impl Strategy<Value = F> {
    leaf().prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..4).prop_map(F::And),
            prop::collection::vec(inner.clone(), 1..4).prop_map(F::Or),
            inner.prop_map(|f| !f),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_compiled_filter_agrees_with_direct_evaluation(
        f in filter(),
        g in genre(),
        y in year(),
        id in 1u8..6,
    ) {
        let d = descriptor();
        let id = id.to_string();
        prop_assert_eq!(matches(&f, &d, &id, &doc(g, y)), eval(&f, &id, g, y));
    }

    #[test]
    fn test_and_is_intersection(a in filter(), b in filter(), g in genre(), y in year()) {
        let d = descriptor();
        let document = doc(g, y);
        let both = matches(&(a.clone() & b.clone()), &d, "1", &document);
        prop_assert_eq!(both, matches(&a, &d, "1", &document) && matches(&b, &d, "1", &document));
    }

    #[test]
    fn test_or_is_union(a in filter(), b in filter(), g in genre(), y in year()) {
        let d = descriptor();
        let document = doc(g, y);
        let either = matches(&(a.clone() | b.clone()), &d, "1", &document);
        prop_assert_eq!(either, matches(&a, &d, "1", &document) || matches(&b, &d, "1", &document));
    }

    #[test]
    fn test_double_negation_is_identity(f in filter(), g in genre(), y in year()) {
        let d = descriptor();
        let document = doc(g, y);
        prop_assert_eq!(!!f.clone(), f.clone());
        prop_assert_eq!(matches(&!f.clone(), &d, "1", &document), !matches(&f, &d, "1", &document));
    }

    #[test]
    fn test_range_bound_operators(bound in year(), y in year()) {
        let d = descriptor();
        let document = doc("scifi", y);
        prop_assert_eq!(matches(&F::gte("year", bound), &d, "1", &document), y >= bound);
        prop_assert_eq!(matches(&F::gt("year", bound), &d, "1", &document), y > bound);
        prop_assert_eq!(matches(&F::lte("year", bound), &d, "1", &document), y <= bound);
        prop_assert_eq!(matches(&F::lt("year", bound), &d, "1", &document), y < bound);
        let open_min = F::between("year", bound, 2000).with_min_op(MinOp::Gt);
        prop_assert_eq!(matches(&open_min, &d, "1", &document), y > bound);
    }
}
