//! Rule-to-pipeline compilation.
//!
//! Each DNF conjunct of each rule becomes one accepting path through the
//! pipeline: one transition per field the conjunct constrains, wildcard
//! transitions through the fields it does not. Paths sharing a prefix of
//! `(state, match)` pairs share the intermediate states, so identical rule
//! prefixes cost one set of entries. A [ConstraintSet] walked along the
//! sorted conjunct skips atoms already implied on the same field and fuses
//! `Lt`/`Gt` bound pairs into a single inclusive range.

use fxhash::FxBuildHasher;
use indexmap::{map::Entry, IndexMap};
use tracing::{debug, info};

use camus_core::{
    field::FieldTable,
    prelude::*,
};

use crate::{AbstractPipeline, TableMatch, TerminalEntry, Transition, TransitionTable};

/// Ternary entry priorities count down from here, so entries emitted
/// earlier (from earlier rules) win ties on the target.
pub const TERNARY_PRIORITY_INIT: u32 = 1_000_000;

struct PriorityCounter {
    next: u32,
}

impl PriorityCounter {
    fn new() -> Self {
        PriorityCounter {
            next: TERNARY_PRIORITY_INIT,
        }
    }

    fn take(&mut self) -> u32 {
        let p = self.next;
        self.next -= 1;
        p
    }
}

/// Compile a rule set against a field catalog.
pub fn compile(rules: &RuleSet, catalog: &FieldTable) -> Result<AbstractPipeline, CompileError> {
    Compiler::new(catalog).run(rules)
}

/// One compilation run. The priority counter and the state allocator are
/// per-run state; a fresh compiler starts both over.
pub struct Compiler<'a> {
    catalog: &'a FieldTable,
    next_state: u16,
    priority: PriorityCounter,
}

impl<'a> Compiler<'a> {
    pub fn new(catalog: &'a FieldTable) -> Self {
        Compiler {
            catalog,
            next_state: 0,
            priority: PriorityCounter::new(),
        }
    }

    pub fn run(mut self, rules: &RuleSet) -> Result<AbstractPipeline, CompileError> {
        // Normalize every rule up front: DNF, catalog resolution, pruning.
        let mut normalized: Vec<(Vec<Conjunct>, &[QueryAction])> =
            Vec::with_capacity(rules.rules.len());
        for (index, rule) in rules.rules.iter().enumerate() {
            check_action_list(&rule.actions)?;
            let mut conjuncts = Vec::new();
            for conjunct in rule.formula.to_dnf()? {
                let mut conjunct: Conjunct = conjunct
                    .iter()
                    .map(|atom| self.resolve_atom(atom))
                    .collect();
                // resolution changes field priorities, so re-canonicalize
                conjunct.sort();
                conjunct.dedup();
                if contradictory(&conjunct) {
                    debug!(rule = index, "pruned contradictory conjunct");
                    continue;
                }
                conjuncts.push(conjunct);
            }
            debug!(rule = index, conjuncts = conjuncts.len(), "normalized rule");
            normalized.push((conjuncts, rule.actions.as_slice()));
        }

        // Pipeline layout: every constrained field, ascending priority.
        let mut fields: Vec<QueryField> = Vec::new();
        for (conjuncts, _) in &normalized {
            for conjunct in conjuncts {
                for atom in conjunct {
                    if !fields.contains(atom.field()) {
                        fields.push(atom.field().clone());
                    }
                }
            }
        }
        fields.sort();

        let mut tables: Vec<TransitionTable> = fields
            .iter()
            .map(|f| TransitionTable {
                field: f.clone(),
                transitions: Vec::new(),
            })
            .collect();
        let mut edges: Vec<IndexMap<(u16, TableMatch), u16, FxBuildHasher>> =
            fields.iter().map(|_| IndexMap::default()).collect();
        let mut terminal: IndexMap<u16, Vec<QueryAction>, FxBuildHasher> = IndexMap::default();

        for (conjuncts, actions) in &normalized {
            for conjunct in conjuncts {
                let matches = derive_matches(conjunct, &fields)?;
                let mut state = 0u16;
                for (table, cond) in matches.into_iter().enumerate() {
                    let key = (state, cond);
                    if let Some(&next) = edges[table].get(&key) {
                        state = next;
                    } else {
                        let next = self.alloc_state()?;
                        let priority = key.1.is_ternary().then(|| self.priority.take());
                        tables[table].transitions.push(Transition {
                            state_in: key.0,
                            cond: key.1.clone(),
                            state_out: next,
                            priority,
                        });
                        edges[table].insert(key, next);
                        state = next;
                    }
                }
                match terminal.entry(state) {
                    Entry::Occupied(mut e) => {
                        let merged = e.get_mut();
                        for action in actions.iter() {
                            if !merged.contains(action) {
                                merged.push(action.clone());
                            }
                        }
                        check_action_list(merged)?;
                    }
                    Entry::Vacant(e) => {
                        e.insert(actions.to_vec());
                    }
                }
            }
        }

        let pipeline = AbstractPipeline {
            tables,
            terminal: terminal
                .into_iter()
                .map(|(state, actions)| TerminalEntry { state, actions })
                .collect(),
        };
        info!(
            rules = rules.rules.len(),
            tables = pipeline.tables.len(),
            states = self.next_state,
            transitions = pipeline.transition_count(),
            terminals = pipeline.terminal.len(),
            "compiled rule set"
        );
        Ok(pipeline)
    }

    fn resolve_atom(&self, atom: &AtomicPredicate) -> AtomicPredicate {
        let resolved = self.catalog.resolve(atom.field(), Some(atom.constant()));
        let mut out = atom.clone();
        *out.field_mut() = resolved;
        out
    }

    fn alloc_state(&mut self) -> Result<u16, CompileError> {
        self.next_state = self
            .next_state
            .checked_add(1)
            .ok_or_else(|| CompileError::Invariant("state space exhausted".to_owned()))?;
        Ok(self.next_state)
    }
}

fn check_action_list(actions: &[QueryAction]) -> Result<(), CompileError> {
    let forwards = actions.iter().filter(|a| a.is_forward()).count();
    if forwards > 0 && forwards < actions.len() {
        return Err(CompileError::ActionMerge);
    }
    Ok(())
}

fn contradictory(conjunct: &[AtomicPredicate]) -> bool {
    conjunct
        .iter()
        .enumerate()
        .any(|(i, p)| conjunct[i + 1..].iter().any(|q| p.disjoint(q)))
}

// One match per pipeline field for this conjunct, Wildcard where the
// conjunct leaves the field unconstrained.
fn derive_matches(
    conjunct: &[AtomicPredicate],
    fields: &[QueryField],
) -> Result<Vec<TableMatch>, CompileError> {
    let mut cs = ConstraintSet::default();
    let mut eqs: Vec<Option<QueryConst>> = vec![None; fields.len()];
    let mut lpms: Vec<Option<(QueryConst, QueryConst)>> = vec![None; fields.len()];
    let mut bounded = vec![false; fields.len()];

    for atom in conjunct {
        let index = fields
            .iter()
            .position(|f| f == atom.field())
            .ok_or_else(|| CompileError::Invariant("atom on a field with no table".to_owned()))?;
        if cs.implies_true(atom) {
            continue;
        }
        cs.add_constraint(atom)?;
        match atom {
            AtomicPredicate::Eq(_, c) => eqs[index] = Some(c.clone()),
            AtomicPredicate::Lt(..) | AtomicPredicate::Gt(..) => bounded[index] = true,
            AtomicPredicate::Lpm(_, addr, plen) => {
                lpms[index] = Some((addr.clone(), plen.clone()))
            }
        }
    }

    let mut out = Vec::with_capacity(fields.len());
    for (index, field) in fields.iter().enumerate() {
        let lpm_mixed = lpms[index].is_some() && (eqs[index].is_some() || bounded[index]);
        if lpm_mixed {
            return Err(CompileError::Unsupported(format!(
                "lpm combined with other constraints on {}",
                field
            )));
        }
        let cond = if let Some(c) = &eqs[index] {
            TableMatch::Eq(c.clone())
        } else if let Some((addr, plen)) = &lpms[index] {
            TableMatch::Lpm(addr.clone(), plen.clone())
        } else if bounded[index] {
            let range = cs
                .range(field)
                .ok_or_else(|| CompileError::Invariant("bounded field has no range".to_owned()))?;
            match (range.lo(), range.hi()) {
                (Some(lo), Some(hi)) => TableMatch::Range(lo.clone(), hi.clone()),
                // bounds are inclusive; hand back the strict constants
                (None, Some(hi)) => TableMatch::Lt(hi.succ()?),
                (Some(lo), None) => TableMatch::Gt(lo.pred()?),
                (None, None) => {
                    return Err(CompileError::Invariant(
                        "bound atoms left no endpoints".to_owned(),
                    ))
                }
            }
        } else {
            TableMatch::Wildcard
        };
        out.push(cond);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use camus_io::load_rules;

    use super::*;

    fn compile_text(text: &str) -> AbstractPipeline {
        let rules = load_rules(text).unwrap();
        compile(&rules, &FieldTable::default()).unwrap()
    }

    #[test]
    fn exact_rule_is_one_transition_and_one_terminal() {
        let p = compile_text("ipv4.dstAddr = 10.0.0.1 : fwd(3) ;");
        assert_eq!(p.tables.len(), 1);
        assert_eq!(p.tables[0].field, QueryField::new("ipv4", "dstAddr"));
        assert_eq!(
            p.tables[0].transitions,
            vec![Transition {
                state_in: 0,
                cond: TableMatch::Eq(QueryConst::Ipv4(0x0a000001)),
                state_out: 1,
                priority: None,
            }]
        );
        assert_eq!(
            p.terminal,
            vec![TerminalEntry {
                state: 1,
                actions: vec![QueryAction::ForwardPort(3)],
            }]
        );
    }

    #[test]
    fn bounds_fuse_into_one_range() {
        let p = compile_text("tcp.dport > 1023 && tcp.dport < 2000 : fwd(1) ;");
        assert_eq!(p.tables.len(), 1);
        assert_eq!(
            p.tables[0].transitions,
            vec![Transition {
                state_in: 0,
                cond: TableMatch::Range(QueryConst::Number(1024), QueryConst::Number(1999)),
                state_out: 1,
                priority: Some(TERNARY_PRIORITY_INIT),
            }]
        );
    }

    #[test]
    fn lpm_rule() {
        let p = compile_text("ipv4.dstAddr = 10.0.0.0 / 8 : fwd(2) ;");
        assert_eq!(
            p.tables[0].transitions[0].cond,
            TableMatch::Lpm(QueryConst::Ipv4(0x0a000000), QueryConst::Number(8))
        );
        assert_eq!(p.tables[0].transitions[0].priority, None);
    }

    #[test]
    fn shared_prefix_reuses_states() {
        let p = compile_text(
            "ipv4.dstAddr = 1.1.1.1 && tcp.dport = 80 : fwd(1) ;\n\
             ipv4.dstAddr = 1.1.1.1 && tcp.dport = 81 : fwd(2) ;",
        );
        // dstAddr (priority 21) before dport (31)
        assert_eq!(p.tables[0].field, QueryField::new("ipv4", "dstAddr"));
        assert_eq!(p.tables[0].transitions.len(), 1);
        assert_eq!(p.tables[1].transitions.len(), 2);
        assert_eq!(p.tables[1].transitions[0].state_in, 1);
        assert_eq!(p.tables[1].transitions[1].state_in, 1);
        assert_eq!(p.terminal.len(), 2);
    }

    #[test]
    fn unconstrained_fields_get_wildcards() {
        let p = compile_text(
            "ipv4.proto = 6 : fwd(1) ;\n\
             tcp.dport = 80 : fwd(2) ;",
        );
        // rule 1 passes through the dport table on a wildcard
        assert_eq!(p.tables[1].field, QueryField::new("tcp", "dport"));
        assert!(p.tables[1]
            .transitions
            .iter()
            .any(|t| t.cond == TableMatch::Wildcard));
        // rule 2 passes through the proto table on a wildcard
        assert!(p.tables[0]
            .transitions
            .iter()
            .any(|t| t.cond == TableMatch::Wildcard));
        assert_eq!(p.terminal.len(), 2);
    }

    #[test]
    fn identical_paths_merge_actions() {
        let p = compile_text(
            "ipv4.proto = 6 : fwd(1) ;\n\
             ipv4.proto = 6 : fwd(2) ;",
        );
        assert_eq!(p.tables[0].transitions.len(), 1);
        assert_eq!(
            p.terminal,
            vec![TerminalEntry {
                state: 1,
                actions: vec![QueryAction::ForwardPort(1), QueryAction::ForwardPort(2)],
            }]
        );
    }

    #[test]
    fn contradictory_conjuncts_are_pruned() {
        let p = compile_text("tcp.dport > 10 && tcp.dport < 5 : fwd(1) ;");
        assert!(p.tables.is_empty());
        assert!(p.terminal.is_empty());
    }

    #[test]
    fn implied_atoms_are_skipped() {
        let p = compile_text("tcp.dport > 3 && tcp.dport > 5 : fwd(1) ;");
        assert_eq!(
            p.tables[0].transitions[0].cond,
            TableMatch::Gt(QueryConst::Number(5))
        );
        let p = compile_text("tcp.dport < 20 && tcp.dport < 10 : fwd(1) ;");
        assert_eq!(
            p.tables[0].transitions[0].cond,
            TableMatch::Lt(QueryConst::Number(10))
        );
    }

    #[test]
    fn equality_inside_bounds_wins() {
        let p = compile_text("tcp.dport > 10 && tcp.dport = 80 : fwd(1) ;");
        assert_eq!(
            p.tables[0].transitions,
            vec![Transition {
                state_in: 0,
                cond: TableMatch::Eq(QueryConst::Number(80)),
                state_out: 1,
                priority: None,
            }]
        );
    }

    #[test]
    fn disjunction_produces_two_paths() {
        let p = compile_text("tcp.dport = 80 || tcp.dport = 443 : fwd(1) ;");
        assert_eq!(p.tables[0].transitions.len(), 2);
        assert_eq!(p.terminal.len(), 2);
    }

    #[test]
    fn ternary_priorities_are_unique_and_descending() {
        let p = compile_text(
            "tcp.dport > 100 : fwd(1) ;\n\
             tcp.dport < 50 : fwd(2) ;",
        );
        let prios: Vec<u32> = p.tables[0]
            .transitions
            .iter()
            .filter_map(|t| t.priority)
            .collect();
        assert_eq!(prios, vec![TERNARY_PRIORITY_INIT, TERNARY_PRIORITY_INIT - 1]);
    }

    #[test]
    fn mixing_forward_and_user_actions_fails() {
        let rules = load_rules("ipv4.proto = 6 : fwd(1), count(1) ;").unwrap();
        let err = compile(&rules, &FieldTable::default()).unwrap_err();
        assert_eq!(err, CompileError::ActionMerge);
    }

    #[test]
    fn merge_conflict_at_terminal_fails() {
        let rules = load_rules(
            "ipv4.proto = 6 : fwd(1) ;\n\
             ipv4.proto = 6 : count(1) ;",
        )
        .unwrap();
        let err = compile(&rules, &FieldTable::default()).unwrap_err();
        assert_eq!(err, CompileError::ActionMerge);
    }

    #[test]
    fn lpm_mixed_with_bounds_is_unsupported() {
        let rules =
            load_rules("ipv4.dstAddr = 10.0.0.0 / 8 && ipv4.dstAddr = 10.0.0.1 : fwd(1) ;")
                .unwrap();
        let err = compile(&rules, &FieldTable::default()).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn compilation_is_deterministic() {
        let text = "ipv4.dstAddr = 1.2.3.4 && tcp.dport > 100 : fwd(1) ;\n\
                    eth.src = aa:bb:cc:dd:ee:ff : fwd(1), fwd(2) ;";
        let a = compile_text(text);
        let b = compile_text(text);
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn states_form_a_dag() {
        let p = compile_text(
            "ipv4.dstAddr = 1.1.1.1 && tcp.dport = 80 : fwd(1) ;\n\
             ipv4.proto = 17 : fwd(2) ;",
        );
        // transitions only ever move to strictly larger state ids
        for table in &p.tables {
            for t in &table.transitions {
                assert!(t.state_out > t.state_in);
            }
        }
    }
}
