//! Core data model of the Camus query compiler: query constants, header
//! fields, atomic predicates and their algebra, boolean formulas, and rule
//! actions.
//!
//! ## Relations of important structs
//! ```text
//! QueryConst ─┐
//!             ├─> AtomicPredicate ──> Formula ──┐
//! QueryField ─┘         |                       ├─> Rule ──> RuleSet
//!                 ConstraintSet    QueryAction ─┘
//! ```
//!
//! The compiler crates consume this model: `camus_io` parses rule text into
//! [`RuleSet`](action::RuleSet)s, `camus_pipeline` compiles them into the
//! abstract pipeline, and `camus_target` lowers that onto match tables.
pub mod action;
pub mod error;
pub mod field;
pub mod formula;
pub mod predicate;
pub mod value;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        action::{QueryAction, Rule, RuleSet},
        error::CompileError,
        field::{Assignment, FieldTable, QueryField},
        formula::{Conjunct, Formula},
        predicate::{
            constraint::{ConstRange, ConstraintSet},
            AtomicPredicate,
        },
        value::QueryConst,
    };
}
