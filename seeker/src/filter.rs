//! Filter expressions
//!
//! `F` is an immutable boolean tree over term, range and id leaves.
//! Combinators build new trees, flattening nested nodes of the same kind:
//!
//! ```
//! use seeker::filter::F;
//!
//! let f = F::term("genre", "scifi") & F::between("year", 2010, 2014) | !F::term("lang", "en");
//! ```
//!
//! [`F::compile`] turns a tree into a [`DslQuery`] against one descriptor,
//! validating every leaf field before anything is sent.

use crate::dsl::{DslQuery, IdsQuery, RangeParams};
use crate::error::{Error, Result};
use crate::schema::{DocumentDescriptor, FieldKind};
use serde_json::Value;
use std::ops;

/// Lower bound operator of a range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MinOp {
    /// `>`
    Gt,
    /// `>=`
    #[default]
    Gte,
}

/// Upper bound operator of a range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxOp {
    /// `<`
    Lt,
    /// `<=`
    #[default]
    Lte,
}

#[derive(Debug, Clone, PartialEq)]
pub enum F {
    /// Field equals value. An array value matches any of its elements.
    Term { field: String, value: Value },
    Range {
        field: String,
        min: Option<Value>,
        max: Option<Value>,
        min_op: MinOp,
        max_op: MaxOp,
    },
    /// Document id is one of the values
    Ids(Vec<String>),
    And(Vec<F>),
    Or(Vec<F>),
    Not(Box<F>),
}

impl F {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        F::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Field equals any of the values
    pub fn terms<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        F::Term {
            field: field.into(),
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Range with inclusive bounds; `None` leaves that end open
    pub fn range(field: impl Into<String>, min: Option<Value>, max: Option<Value>) -> Self {
        F::Range {
            field: field.into(),
            min,
            max,
            min_op: MinOp::Gte,
            max_op: MaxOp::Lte,
        }
    }

    pub fn between(field: impl Into<String>, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        F::range(field, Some(min.into()), Some(max.into()))
    }

    pub fn gt(field: impl Into<String>, min: impl Into<Value>) -> Self {
        F::range(field, Some(min.into()), None).with_min_op(MinOp::Gt)
    }

    pub fn gte(field: impl Into<String>, min: impl Into<Value>) -> Self {
        F::range(field, Some(min.into()), None)
    }

    pub fn lt(field: impl Into<String>, max: impl Into<Value>) -> Self {
        F::range(field, None, Some(max.into())).with_max_op(MaxOp::Lt)
    }

    pub fn lte(field: impl Into<String>, max: impl Into<Value>) -> Self {
        F::range(field, None, Some(max.into()))
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        F::Ids(ids.into_iter().map(Into::into).collect())
    }

    /// A bare field → value mapping: every pair must match
    pub fn all_of<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        F::And(pairs.into_iter().map(|(k, v)| F::term(k, v)).collect())
    }

    /// Set the lower bound operator. No effect on non-range nodes.
    pub fn with_min_op(mut self, op: MinOp) -> Self {
        if let F::Range { min_op, .. } = &mut self {
            *min_op = op;
        }
        self
    }

    /// Set the upper bound operator. No effect on non-range nodes.
    pub fn with_max_op(mut self, op: MaxOp) -> Self {
        if let F::Range { max_op, .. } = &mut self {
            *max_op = op;
        }
        self
    }

    pub fn and(self, other: F) -> F {
        let mut children = match self {
            F::And(children) => children,
            other => vec![other],
        };
        match other {
            F::And(more) => children.extend(more),
            other => children.push(other),
        }
        F::And(children)
    }

    pub fn or(self, other: F) -> F {
        let mut children = match self {
            F::Or(children) => children,
            other => vec![other],
        };
        match other {
            F::Or(more) => children.extend(more),
            other => children.push(other),
        }
        F::Or(children)
    }

    /// `Not(Not(x))` collapses to `x`
    pub fn negate(self) -> F {
        match self {
            F::Not(inner) => *inner,
            other => F::Not(Box::new(other)),
        }
    }

    /// Compile against a descriptor. Pure; fails on the first invalid node.
    pub fn compile(&self, descriptor: &DocumentDescriptor) -> Result<DslQuery> {
        match self {
            F::Term { field, value } => {
                let path = leaf_path(descriptor, field)?;
                Ok(match value {
                    Value::Array(values) => DslQuery::terms(path, values.clone()),
                    value => DslQuery::term(path, value.clone()),
                })
            }
            F::Range {
                field,
                min,
                max,
                min_op,
                max_op,
            } => {
                if min.is_none() && max.is_none() {
                    return Err(Error::EmptyRange(field.clone()));
                }
                let path = leaf_path(descriptor, field)?;
                let mut params = RangeParams::default();
                match min_op {
                    MinOp::Gt => params.gt = min.clone(),
                    MinOp::Gte => params.gte = min.clone(),
                }
                match max_op {
                    MaxOp::Lt => params.lt = max.clone(),
                    MaxOp::Lte => params.lte = max.clone(),
                }
                Ok(DslQuery::range(path, params))
            }
            F::Ids(ids) => Ok(DslQuery::Ids(IdsQuery {
                values: ids.clone(),
            })),
            F::And(children) => {
                if children.is_empty() {
                    return Err(Error::EmptyComposition("AND"));
                }
                Ok(DslQuery::filter_all(compile_all(children, descriptor)?))
            }
            F::Or(children) => {
                if children.is_empty() {
                    return Err(Error::EmptyComposition("OR"));
                }
                Ok(DslQuery::any(compile_all(children, descriptor)?))
            }
            F::Not(inner) => Ok(DslQuery::none_of(vec![inner.compile(descriptor)?])),
        }
    }
}

fn compile_all(children: &[F], descriptor: &DocumentDescriptor) -> Result<Vec<DslQuery>> {
    children.iter().map(|c| c.compile(descriptor)).collect()
}

/// Backend path for a leaf, or `InvalidFilterField`
fn leaf_path(descriptor: &DocumentDescriptor, field: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidFilterField {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    let resolved = descriptor
        .resolve_field(field)
        .ok_or_else(|| invalid("not declared"))?;
    if !resolved.schema.indexed {
        return Err(invalid("not indexed"));
    }
    match resolved.schema.kind {
        FieldKind::Object(_) => Err(invalid("object field; filter on one of its sub-fields")),
        FieldKind::String if !resolved.schema.facetable => {
            Err(invalid("analyzed text is not filterable; use the query text"))
        }
        _ => Ok(resolved.exact_path),
    }
}

impl ops::BitAnd for F {
    type Output = F;

    fn bitand(self, rhs: F) -> F {
        self.and(rhs)
    }
}

impl ops::BitOr for F {
    type Output = F;

    fn bitor(self, rhs: F) -> F {
        self.or(rhs)
    }
}

impl ops::Not for F {
    type Output = F;

    fn not(self) -> F {
        self.negate()
    }
}
