//! # Abstract pipeline
//!
//! The target-independent result of rule compilation: an ordered list of
//! per-field transition tables closed by one terminal table. The pipeline
//! is a staged DFA. A packet enters every table in state 0; each table
//! picks the transition whose match covers the packet's value of that
//! table's field and moves the packet to the transition's output state;
//! the terminal table maps the final state to the actions to execute.
//!
//! States are plain `u16` ids with transitions held in side tables, never
//! references, so the structures stay comparable, hashable and
//! serializable. State ids are allocated monotonically, which makes the
//! state graph a DAG by construction.
pub mod compiler;

use camus_core::prelude::*;

pub use compiler::{compile, Compiler, TERNARY_PRIORITY_INIT};

/// Match selecting a transition within one table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableMatch {
    /// The path does not constrain this field.
    Wildcard,
    Eq(QueryConst),
    Lt(QueryConst),
    Gt(QueryConst),
    /// Inclusive endpoints.
    Range(QueryConst, QueryConst),
    /// Base address and prefix length.
    Lpm(QueryConst, QueryConst),
}

impl TableMatch {
    /// Ternary matches need an explicit priority on the target.
    pub fn is_ternary(&self) -> bool {
        matches!(
            self,
            TableMatch::Lt(_) | TableMatch::Gt(_) | TableMatch::Range(..)
        )
    }
}

/// One edge of the state machine: `(state_in, match) -> state_out`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub state_in: u16,
    pub cond: TableMatch,
    pub state_out: u16,
    /// Present exactly when `cond` is ternary.
    pub priority: Option<u32>,
}

/// All transitions keyed on one field, in emission order.
#[derive(Clone, Debug)]
pub struct TransitionTable {
    pub field: QueryField,
    pub transitions: Vec<Transition>,
}

/// Accepting state of one or more conjuncts and the merged action list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalEntry {
    pub state: u16,
    pub actions: Vec<QueryAction>,
}

/// The compiled pipeline: transition tables in field order, terminal last.
#[derive(Clone, Debug, Default)]
pub struct AbstractPipeline {
    pub tables: Vec<TransitionTable>,
    pub terminal: Vec<TerminalEntry>,
}

impl AbstractPipeline {
    /// Total number of transitions across all tables.
    pub fn transition_count(&self) -> usize {
        self.tables.iter().map(|t| t.transitions.len()).sum()
    }
}
