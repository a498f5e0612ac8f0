//! # Constraint tracking
//!
//! A [ConstraintSet] records, per field, the closed interval of values the
//! atoms seen so far along one compilation path still permit. The compiler
//! consults it to skip atoms already implied by earlier conjuncts on the
//! same field, and reads the accumulated bounds back when fusing `Lt`/`Gt`
//! pairs into a single range match.
//!
//! `Lpm` atoms contribute nothing here; prefix reasoning stays conservative
//! throughout the algebra. There is deliberately no `implies_false`
//! operation: the set can only certify implication, never refutation.

use std::collections::HashMap;

use fxhash::FxBuildHasher;

use crate::{
    error::CompileError,
    field::QueryField,
    predicate::AtomicPredicate,
    value::QueryConst,
};

/// Closed interval `(lo, hi)` of constants, either endpoint optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstRange {
    lo: Option<QueryConst>,
    hi: Option<QueryConst>,
}

impl ConstRange {
    pub fn lo(&self) -> Option<&QueryConst> {
        self.lo.as_ref()
    }

    pub fn hi(&self) -> Option<&QueryConst> {
        self.hi.as_ref()
    }

    /// Pin both endpoints to `x`.
    pub fn set_eq(&mut self, x: &QueryConst) {
        self.lo = Some(x.clone());
        self.hi = Some(x.clone());
    }

    /// `v < x` pins the upper endpoint to `x - 1`.
    pub fn set_lt(&mut self, x: &QueryConst) -> Result<(), CompileError> {
        self.hi = Some(x.pred()?);
        Ok(())
    }

    /// `v > x` pins the lower endpoint to `x + 1`.
    pub fn set_gt(&mut self, x: &QueryConst) -> Result<(), CompileError> {
        self.lo = Some(x.succ()?);
        Ok(())
    }

    pub fn implies_true_eq(&self, x: &QueryConst) -> bool {
        self.lo.as_ref() == Some(x) && self.hi.as_ref() == Some(x)
    }

    pub fn implies_true_lt(&self, x: &QueryConst) -> bool {
        matches!(&self.hi, Some(hi) if hi < x)
    }

    pub fn implies_true_gt(&self, x: &QueryConst) -> bool {
        matches!(&self.lo, Some(lo) if lo > x)
    }

    /// True when both endpoints exist and have crossed.
    pub fn is_empty(&self) -> bool {
        matches!((&self.lo, &self.hi), (Some(lo), Some(hi)) if lo > hi)
    }
}

/// Field-keyed map of accumulated ranges.
#[derive(Debug, Default)]
pub struct ConstraintSet {
    ranges: HashMap<QueryField, ConstRange, FxBuildHasher>,
}

impl ConstraintSet {
    /// Replace the range of `p`'s field using the matching `set_*`.
    pub fn add_constraint(&mut self, p: &AtomicPredicate) -> Result<(), CompileError> {
        let range = self.ranges.entry(p.field().clone()).or_default();
        match p {
            AtomicPredicate::Eq(_, c) => {
                range.set_eq(c);
                Ok(())
            }
            AtomicPredicate::Lt(_, c) => range.set_lt(c),
            AtomicPredicate::Gt(_, c) => range.set_gt(c),
            // documented limitation: prefixes are not tracked
            AtomicPredicate::Lpm(..) => Ok(()),
        }
    }

    /// True iff the stored range already implies `p`.
    pub fn implies_true(&self, p: &AtomicPredicate) -> bool {
        let Some(range) = self.ranges.get(p.field()) else {
            return false;
        };
        match p {
            AtomicPredicate::Eq(_, c) => range.implies_true_eq(c),
            AtomicPredicate::Lt(_, c) => range.implies_true_lt(c),
            AtomicPredicate::Gt(_, c) => range.implies_true_gt(c),
            AtomicPredicate::Lpm(..) => false,
        }
    }

    pub fn range(&self, field: &QueryField) -> Option<&ConstRange> {
        self.ranges.get(field)
    }
}
