//! # Atomic predicates
//!
//! An [AtomicPredicate] is a single comparison between one field and one
//! (or, for LPM, two) constants. The algebra on atoms is structural and
//! field-local: [disjoint](AtomicPredicate::disjoint) and
//! [subset](AtomicPredicate::subset) decide only the cases that can be read
//! off the syntax and answer `false` everywhere else, so a `false` never
//! asserts satisfiability.
//!
//! Atoms carry a strict total order used to canonicalize formula
//! conjuncts. Within one field the kinds rank `Lt < Gt < Eq < Lpm`:
//! equality constraints sort after range constraints so that a
//! [ConstraintSet](constraint::ConstraintSet) walking a sorted conjunct has
//! accumulated both bounds before it tests an equality for implication.

pub mod constraint;

use std::cmp::Ordering;

use crate::{
    error::CompileError,
    field::{Assignment, QueryField},
    value::QueryConst,
};

/// A single comparison against a header field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AtomicPredicate {
    Eq(QueryField, QueryConst),
    Lt(QueryField, QueryConst),
    Gt(QueryField, QueryConst),
    /// Longest-prefix match: address plus numeric prefix length.
    Lpm(QueryField, QueryConst, QueryConst),
}

impl AtomicPredicate {
    /// Equality accepts every constant kind.
    pub fn eq(field: QueryField, value: QueryConst) -> Self {
        AtomicPredicate::Eq(field, value)
    }

    /// `Lt` applies only to numbers.
    pub fn lt(field: QueryField, value: QueryConst) -> Result<Self, CompileError> {
        match value {
            QueryConst::Number(_) => Ok(AtomicPredicate::Lt(field, value)),
            other => Err(CompileError::BadOperand {
                op: "<",
                want: "number",
                got: other.kind(),
            }),
        }
    }

    /// `Gt` applies only to numbers.
    pub fn gt(field: QueryField, value: QueryConst) -> Result<Self, CompileError> {
        match value {
            QueryConst::Number(_) => Ok(AtomicPredicate::Gt(field, value)),
            other => Err(CompileError::BadOperand {
                op: ">",
                want: "number",
                got: other.kind(),
            }),
        }
    }

    /// `Lpm` applies to IPv4/IPv6 addresses with a numeric prefix length.
    pub fn lpm(
        field: QueryField,
        addr: QueryConst,
        prefix_len: QueryConst,
    ) -> Result<Self, CompileError> {
        match (&addr, &prefix_len) {
            (QueryConst::Ipv4(_), QueryConst::Number(p)) if (0..=32).contains(p) => {
                Ok(AtomicPredicate::Lpm(field, addr, prefix_len))
            }
            (QueryConst::Ipv6(..), QueryConst::Number(p)) if (0..=128).contains(p) => {
                Ok(AtomicPredicate::Lpm(field, addr, prefix_len))
            }
            (a, _) => Err(CompileError::BadOperand {
                op: "lpm",
                want: "address",
                got: a.kind(),
            }),
        }
    }

    /// The field this atom constrains.
    pub fn field(&self) -> &QueryField {
        match self {
            AtomicPredicate::Eq(f, _)
            | AtomicPredicate::Lt(f, _)
            | AtomicPredicate::Gt(f, _)
            | AtomicPredicate::Lpm(f, _, _) => f,
        }
    }

    pub fn field_mut(&mut self) -> &mut QueryField {
        match self {
            AtomicPredicate::Eq(f, _)
            | AtomicPredicate::Lt(f, _)
            | AtomicPredicate::Gt(f, _)
            | AtomicPredicate::Lpm(f, _, _) => f,
        }
    }

    /// The primary constant of the comparison.
    pub fn constant(&self) -> &QueryConst {
        match self {
            AtomicPredicate::Eq(_, c)
            | AtomicPredicate::Lt(_, c)
            | AtomicPredicate::Gt(_, c)
            | AtomicPredicate::Lpm(_, c, _) => c,
        }
    }

    /// True iff the two atoms constrain different fields.
    pub fn independent(&self, other: &Self) -> bool {
        self.field() != other.field()
    }

    /// True iff `self && other` is structurally unsatisfiable.
    pub fn disjoint(&self, other: &Self) -> bool {
        use AtomicPredicate::*;
        if self.independent(other) {
            return false;
        }
        match (self, other) {
            (Eq(_, a), Eq(_, b)) => a != b,
            (Eq(_, y), Gt(_, x)) | (Gt(_, x), Eq(_, y)) => y <= x,
            (Eq(_, y), Lt(_, x)) | (Lt(_, x), Eq(_, y)) => y >= x,
            (Lt(_, x), Gt(_, y)) | (Gt(_, y), Lt(_, x)) => {
                match (x.to_int(), y.to_int()) {
                    (Ok(x), Ok(y)) => x <= y.saturating_add(1),
                    _ => false,
                }
            }
            // Prefix nesting is not analyzed; only syntactically different
            // bases are known-disjoint.
            (Lpm(_, a, _), Lpm(_, b, _)) => a != b,
            _ => false,
        }
    }

    /// True iff every assignment satisfying `self` satisfies `other`.
    pub fn subset(&self, other: &Self) -> bool {
        use AtomicPredicate::*;
        if self.independent(other) {
            return false;
        }
        match (self, other) {
            (Eq(_, x), Eq(_, y)) => x == y,
            (Gt(_, x), Gt(_, y)) => x >= y,
            (Lt(_, x), Lt(_, y)) => x <= y,
            (Eq(_, x), Gt(_, y)) => x > y,
            (Eq(_, x), Lt(_, y)) => x < y,
            _ => false,
        }
    }

    /// Evaluate against a hypothetical packet. Errors when the assignment
    /// has no binding for the field or the bound value has the wrong kind.
    pub fn eval(&self, a: &Assignment) -> Result<bool, CompileError> {
        let field = self.field();
        let value = a.get(field).ok_or_else(|| CompileError::MissingBinding {
            header: field.header.clone(),
            field: field.field.clone(),
        })?;
        let type_err = || CompileError::EvalType {
            header: field.header.clone(),
            field: field.field.clone(),
        };
        match self {
            AtomicPredicate::Eq(_, c) => {
                if value.kind() != c.kind() {
                    return Err(type_err());
                }
                Ok(value == c)
            }
            AtomicPredicate::Lt(_, c) => {
                let v = value.to_int().map_err(|_| type_err())?;
                Ok(v < c.to_int()?)
            }
            AtomicPredicate::Gt(_, c) => {
                let v = value.to_int().map_err(|_| type_err())?;
                Ok(v > c.to_int()?)
            }
            AtomicPredicate::Lpm(_, addr, plen) => {
                if value.kind() != addr.kind() {
                    return Err(type_err());
                }
                let width = addr.natural_width();
                let plen = plen.to_int()? as u32;
                if plen == 0 {
                    return Ok(true);
                }
                let shift = width - plen;
                Ok(value.encode(width)? >> shift == addr.encode(width)? >> shift)
            }
        }
    }

    // Kind rank within one field; see the module docs.
    fn rank(&self) -> u8 {
        match self {
            AtomicPredicate::Lt(..) => 0,
            AtomicPredicate::Gt(..) => 1,
            AtomicPredicate::Eq(..) => 2,
            AtomicPredicate::Lpm(..) => 3,
        }
    }
}

impl Ord for AtomicPredicate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.field()
            .cmp(other.field())
            .then_with(|| self.rank().cmp(&other.rank()))
            .then_with(|| self.constant().cmp(other.constant()))
            .then_with(|| match (self, other) {
                (AtomicPredicate::Lpm(_, _, a), AtomicPredicate::Lpm(_, _, b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for AtomicPredicate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
