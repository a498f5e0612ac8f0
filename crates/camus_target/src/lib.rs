//! # Target lowering
//!
//! Lowers an [AbstractPipeline] onto concrete P4 match-action tables. Each
//! abstract transition table `query_<header>_<field>` splits into up to
//! four physical tables by match shape (`_exact`, `_range`, `_lpm`,
//! `_miss`), created only when non-empty; every abstract transition lands
//! in exactly one of them. States travel in the synthetic metadata field
//! `query.state` as 16-bit exact matches. The terminal table lowers to
//! `query_actions`, and forwarding sets of two or more ports get multicast
//! group ids from an ordered allocation over the distinct port sets.
pub mod emit;

use std::collections::{BTreeMap, BTreeSet};

use fxhash::FxBuildHasher;
use indexmap::IndexMap;
use tracing::debug;

use camus_core::prelude::*;
use camus_pipeline::{AbstractPipeline, TableMatch, TerminalEntry, TransitionTable};

/// Synthetic metadata field carrying the pipeline state.
pub const STATE_FIELD: &str = "query.state";
pub const STATE_WIDTH: u32 = 16;
/// Name of the lowered terminal table.
pub const ACTIONS_TABLE: &str = "query_actions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P4MatchKind {
    Exact,
    Range,
    Lpm,
}

/// One key column of a physical table.
#[derive(Debug, Clone)]
pub struct P4Field {
    pub name: String,
    pub kind: P4MatchKind,
    pub width: u32,
}

/// A concrete match value, encoded at the field's width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P4Value {
    Exact(u128),
    /// Inclusive endpoints.
    Range(u128, u128),
    Lpm(u128, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P4Param {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct P4Entry {
    pub action: String,
    pub values: Vec<P4Value>,
    pub params: Vec<P4Param>,
    /// Present exactly on entries of `_range` tables.
    pub priority: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct P4Table {
    pub name: String,
    pub fields: Vec<P4Field>,
    pub entries: Vec<P4Entry>,
}

/// A multicast group: the data plane replicates to every port in the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastGroup {
    pub mgid: u32,
    pub ports: Vec<u16>,
}

/// The lowered pipeline: physical tables in pipeline order, terminal last,
/// plus the multicast groups the runtime must install.
#[derive(Debug, Default)]
pub struct TargetPipeline {
    pub tables: IndexMap<String, P4Table, FxBuildHasher>,
    pub groups: Vec<McastGroup>,
}

impl TargetPipeline {
    pub fn entry_count(&self) -> usize {
        self.tables.values().map(|t| t.entries.len()).sum()
    }
}

/// Lower an abstract pipeline. `default_action` applies to terminal states
/// whose action list is empty; absent, they drop.
pub fn lower(
    pipeline: &AbstractPipeline,
    default_action: Option<&QueryAction>,
) -> Result<TargetPipeline, CompileError> {
    let groups = allocate_mcast_groups(&pipeline.terminal);
    let lookup: BTreeMap<Vec<u16>, u32> = groups
        .iter()
        .map(|g| (g.ports.clone(), g.mgid))
        .collect();
    let mut out = TargetPipeline {
        tables: IndexMap::default(),
        groups,
    };
    for table in &pipeline.tables {
        lower_transition_table(&mut out, table)?;
    }
    lower_terminal(&mut out, &pipeline.terminal, default_action, &lookup)?;
    debug!(
        tables = out.tables.len(),
        entries = out.entry_count(),
        groups = out.groups.len(),
        "lowered pipeline"
    );
    Ok(out)
}

/// Distinct forwarding sets of size two or more, in the order of the
/// elementwise comparison over sorted port lists, with mgids from 1.
pub fn allocate_mcast_groups(terminal: &[TerminalEntry]) -> Vec<McastGroup> {
    let mut sets: BTreeSet<Vec<u16>> = BTreeSet::new();
    for entry in terminal {
        if let Some(ports) = forward_ports(&entry.actions) {
            if ports.len() >= 2 {
                sets.insert(ports);
            }
        }
    }
    sets.into_iter()
        .enumerate()
        .map(|(i, ports)| McastGroup {
            mgid: i as u32 + 1,
            ports,
        })
        .collect()
}

// Sorted, de-duplicated ports iff the list is non-empty and all-forwarding.
fn forward_ports(actions: &[QueryAction]) -> Option<Vec<u16>> {
    if actions.is_empty() {
        return None;
    }
    let mut ports = Vec::with_capacity(actions.len());
    for action in actions {
        match action {
            QueryAction::ForwardPort(p) => ports.push(*p),
            QueryAction::UserAction(..) => return None,
        }
    }
    ports.sort_unstable();
    ports.dedup();
    Some(ports)
}

fn state_field() -> P4Field {
    P4Field {
        name: STATE_FIELD.to_owned(),
        kind: P4MatchKind::Exact,
        width: STATE_WIDTH,
    }
}

fn lower_transition_table(
    out: &mut TargetPipeline,
    table: &TransitionTable,
) -> Result<(), CompileError> {
    let base = format!("query_{}_{}", table.field.header, table.field.field);
    let field_name = format!("{}.{}", table.field.header, table.field.field);
    let width = table.field.width;
    let empty_range = || CompileError::Invariant(format!("empty range lowering {}", base));

    let mut exact = Vec::new();
    let mut range = Vec::new();
    let mut lpm = Vec::new();
    let mut miss = Vec::new();

    for t in &table.transitions {
        let state = P4Value::Exact(t.state_in as u128);
        let params = vec![P4Param {
            name: "next_state".to_owned(),
            value: t.state_out as i64,
        }];
        let entry = |values, priority| P4Entry {
            action: "set_next_state".to_owned(),
            values,
            params: params.clone(),
            priority,
        };
        match &t.cond {
            TableMatch::Eq(c) => {
                exact.push(entry(vec![state, P4Value::Exact(c.encode(width)?)], None));
            }
            TableMatch::Lt(c) => {
                let hi = c.encode(width)?.checked_sub(1).ok_or_else(empty_range)?;
                let priority = ternary_priority(t)?;
                range.push(entry(vec![state, P4Value::Range(0, hi)], Some(priority)));
            }
            TableMatch::Gt(c) => {
                let lo = c.encode(width)?.checked_add(1).ok_or_else(empty_range)?;
                let max = QueryConst::max_value(width);
                if lo > max {
                    return Err(empty_range());
                }
                let priority = ternary_priority(t)?;
                range.push(entry(vec![state, P4Value::Range(lo, max)], Some(priority)));
            }
            TableMatch::Range(lo, hi) => {
                let priority = ternary_priority(t)?;
                range.push(entry(
                    vec![state, P4Value::Range(lo.encode(width)?, hi.encode(width)?)],
                    Some(priority),
                ));
            }
            TableMatch::Lpm(addr, plen) => {
                lpm.push(entry(
                    vec![state, P4Value::Lpm(addr.encode(width)?, plen.to_int()? as u32)],
                    None,
                ));
            }
            TableMatch::Wildcard => {
                miss.push(entry(vec![state], None));
            }
        }
    }

    let mut push = |suffix: &str, kind: Option<P4MatchKind>, entries: Vec<P4Entry>| {
        if entries.is_empty() {
            return;
        }
        let name = format!("{}_{}", base, suffix);
        let mut fields = vec![state_field()];
        if let Some(kind) = kind {
            fields.push(P4Field {
                name: field_name.clone(),
                kind,
                width,
            });
        }
        out.tables.insert(
            name.clone(),
            P4Table {
                name,
                fields,
                entries,
            },
        );
    };
    push("exact", Some(P4MatchKind::Exact), exact);
    push("range", Some(P4MatchKind::Range), range);
    push("lpm", Some(P4MatchKind::Lpm), lpm);
    push("miss", None, miss);
    Ok(())
}

fn ternary_priority(t: &camus_pipeline::Transition) -> Result<u32, CompileError> {
    t.priority.ok_or_else(|| {
        CompileError::Invariant("ternary transition carries no priority".to_owned())
    })
}

fn lower_terminal(
    out: &mut TargetPipeline,
    terminal: &[TerminalEntry],
    default_action: Option<&QueryAction>,
    lookup: &BTreeMap<Vec<u16>, u32>,
) -> Result<(), CompileError> {
    let mut entries = Vec::with_capacity(terminal.len());
    for e in terminal {
        entries.push(terminal_entry(e.state, &e.actions, default_action, lookup)?);
    }
    out.tables.insert(
        ACTIONS_TABLE.to_owned(),
        P4Table {
            name: ACTIONS_TABLE.to_owned(),
            fields: vec![state_field()],
            entries,
        },
    );
    Ok(())
}

fn terminal_entry(
    state: u16,
    actions: &[QueryAction],
    default_action: Option<&QueryAction>,
    lookup: &BTreeMap<Vec<u16>, u32>,
) -> Result<P4Entry, CompileError> {
    let values = vec![P4Value::Exact(state as u128)];
    if actions.is_empty() {
        return match default_action {
            Some(action) => terminal_entry(state, std::slice::from_ref(action), None, lookup),
            None => Ok(P4Entry {
                action: "query_drop".to_owned(),
                values,
                params: Vec::new(),
                priority: None,
            }),
        };
    }
    if let Some(ports) = forward_ports(actions) {
        return match ports.as_slice() {
            [port] => Ok(P4Entry {
                action: "set_egress_port".to_owned(),
                values,
                params: vec![P4Param {
                    name: "port".to_owned(),
                    value: *port as i64,
                }],
                priority: None,
            }),
            _ => {
                let mgid = lookup.get(&ports).copied().ok_or_else(|| {
                    CompileError::Invariant("forwarding set without multicast group".to_owned())
                })?;
                Ok(P4Entry {
                    action: "set_mgid".to_owned(),
                    values,
                    params: vec![P4Param {
                        name: "mgid".to_owned(),
                        value: mgid as i64,
                    }],
                    priority: None,
                })
            }
        };
    }
    match actions {
        [QueryAction::UserAction(name, args)] => Ok(P4Entry {
            action: name.clone(),
            values,
            params: args
                .iter()
                .enumerate()
                .map(|(i, a)| P4Param {
                    name: format!("p{}", i),
                    value: *a,
                })
                .collect(),
            priority: None,
        }),
        _ => Err(CompileError::ActionMerge),
    }
}

#[cfg(test)]
mod tests {
    use camus_io::load_rules;
    use camus_pipeline::compile;

    use camus_core::field::FieldTable;

    use super::*;

    fn lower_text(text: &str) -> TargetPipeline {
        let rules = load_rules(text).unwrap();
        let pipeline = compile(&rules, &FieldTable::default()).unwrap();
        lower(&pipeline, rules.default_action.as_ref()).unwrap()
    }

    #[test]
    fn exact_rule_lowers_to_exact_and_actions_tables() {
        let t = lower_text("ipv4.dstAddr = 10.0.0.1 : fwd(3) ;");
        assert_eq!(t.tables.len(), 2);
        let exact = &t.tables["query_ipv4_dstAddr_exact"];
        assert_eq!(exact.fields.len(), 2);
        assert_eq!(exact.fields[0].name, STATE_FIELD);
        assert_eq!(exact.fields[1].name, "ipv4.dstAddr");
        assert_eq!(
            exact.entries[0].values,
            vec![P4Value::Exact(0), P4Value::Exact(0x0a000001)]
        );
        assert_eq!(exact.entries[0].params, vec![P4Param { name: "next_state".into(), value: 1 }]);
        let actions = &t.tables[ACTIONS_TABLE];
        assert_eq!(actions.entries[0].action, "set_egress_port");
        assert_eq!(actions.entries[0].params[0].value, 3);
    }

    #[test]
    fn each_match_shape_lands_in_its_own_table() {
        let t = lower_text(
            "ipv4.dstAddr = 10.0.0.1 : fwd(1) ;\n\
             ipv4.dstAddr = 10.0.0.0 / 8 : fwd(2) ;\n\
             tcp.dport > 1023 : fwd(3) ;",
        );
        assert!(t.tables.contains_key("query_ipv4_dstAddr_exact"));
        assert!(t.tables.contains_key("query_ipv4_dstAddr_lpm"));
        assert!(t.tables.contains_key("query_ipv4_dstAddr_miss"));
        assert!(t.tables.contains_key("query_tcp_dport_range"));
        assert!(t.tables.contains_key("query_tcp_dport_miss"));
        // one concrete entry per abstract transition
        let rules = load_rules(
            "ipv4.dstAddr = 10.0.0.1 : fwd(1) ;\n\
             ipv4.dstAddr = 10.0.0.0 / 8 : fwd(2) ;\n\
             tcp.dport > 1023 : fwd(3) ;",
        )
        .unwrap();
        let abstract_pipeline = compile(&rules, &FieldTable::default()).unwrap();
        let transition_entries: usize = t
            .tables
            .values()
            .filter(|t| t.name != ACTIONS_TABLE)
            .map(|t| t.entries.len())
            .sum();
        assert_eq!(transition_entries, abstract_pipeline.transition_count());
    }

    #[test]
    fn lt_and_gt_lower_to_inclusive_ranges() {
        let t = lower_text("tcp.dport < 1024 : fwd(1) ; tcp.sport > 1000 : fwd(2) ;");
        let sport = &t.tables["query_tcp_sport_range"];
        assert_eq!(sport.entries[0].values[1], P4Value::Range(1001, 0xffff));
        let dport = &t.tables["query_tcp_dport_range"];
        assert_eq!(dport.entries[0].values[1], P4Value::Range(0, 1023));
        // every range entry has a unique priority
        let mut prios: Vec<u32> = t
            .tables
            .values()
            .flat_map(|t| t.entries.iter().filter_map(|e| e.priority))
            .collect();
        let before = prios.len();
        prios.sort_unstable();
        prios.dedup();
        assert_eq!(prios.len(), before);
        assert_eq!(before, 2);
    }

    #[test]
    fn mcast_groups_are_a_bijection() {
        let t = lower_text(
            "eth.src = aa:00:00:00:00:01 : fwd(1), fwd(2) ;\n\
             eth.src = aa:00:00:00:00:02 : fwd(3) ;\n\
             eth.src = aa:00:00:00:00:03 : fwd(2), fwd(1) ;\n\
             eth.src = aa:00:00:00:00:04 : fwd(1), fwd(3) ;",
        );
        // {1,2} appears twice but gets one group; sets ordered elementwise
        assert_eq!(
            t.groups,
            vec![
                McastGroup { mgid: 1, ports: vec![1, 2] },
                McastGroup { mgid: 2, ports: vec![1, 3] },
            ]
        );
        let actions = &t.tables[ACTIONS_TABLE];
        let mgids: Vec<i64> = actions
            .entries
            .iter()
            .filter(|e| e.action == "set_mgid")
            .map(|e| e.params[0].value)
            .collect();
        assert_eq!(mgids, vec![1, 1, 2]);
    }

    #[test]
    fn single_forward_needs_no_group() {
        let t = lower_text("ipv4.proto = 6 : custom_action(7, 8) ;");
        assert!(t.groups.is_empty());
        let actions = &t.tables[ACTIONS_TABLE];
        assert_eq!(actions.entries[0].action, "custom_action");
        assert_eq!(
            actions.entries[0].params,
            vec![
                P4Param { name: "p0".into(), value: 7 },
                P4Param { name: "p1".into(), value: 8 },
            ]
        );
    }

    #[test]
    fn duplicate_ports_collapse_to_unicast() {
        let terminal = vec![TerminalEntry {
            state: 1,
            actions: vec![QueryAction::ForwardPort(4), QueryAction::ForwardPort(4)],
        }];
        assert!(allocate_mcast_groups(&terminal).is_empty());
        let entry = terminal_entry(1, &terminal[0].actions, None, &BTreeMap::new()).unwrap();
        assert_eq!(entry.action, "set_egress_port");
    }

    #[test]
    fn empty_actions_use_default_or_drop() {
        let entry = terminal_entry(2, &[], None, &BTreeMap::new()).unwrap();
        assert_eq!(entry.action, "query_drop");
        assert!(entry.params.is_empty());

        let default = QueryAction::UserAction("mirror".into(), vec![9]);
        let entry = terminal_entry(2, &[], Some(&default), &BTreeMap::new()).unwrap();
        assert_eq!(entry.action, "mirror");
        assert_eq!(entry.params[0].value, 9);
    }

    #[test]
    fn two_user_actions_cannot_merge() {
        let actions = vec![
            QueryAction::UserAction("a".into(), vec![]),
            QueryAction::UserAction("b".into(), vec![]),
        ];
        let err = terminal_entry(1, &actions, None, &BTreeMap::new()).unwrap_err();
        assert_eq!(err, CompileError::ActionMerge);
    }

    #[test]
    fn string_constants_encode_padded() {
        let mut catalog = FieldTable::default();
        catalog.insert("http", "host", 32, 50);
        let rules = load_rules("http.host = \"ab\" : fwd(1) ;").unwrap();
        let pipeline = compile(&rules, &catalog).unwrap();
        let t = lower(&pipeline, None).unwrap();
        let exact = &t.tables["query_http_host_exact"];
        assert_eq!(exact.entries[0].values[1], P4Value::Exact(0x61622020));
    }

    #[test]
    fn ipv6_exact_encodes_to_128_bits() {
        let t = lower_text("ipv6.dstAddr = 2001:db8::1 : fwd(1) ;");
        let exact = &t.tables["query_ipv6_dstAddr_exact"];
        assert_eq!(
            exact.entries[0].values[1],
            P4Value::Exact((0x20010db8u128 << 96) | 1)
        );
    }

    #[test]
    fn unsatisfiable_gt_is_an_invariant_error() {
        let rules = load_rules("tcp.dport > 65535 : fwd(1) ;").unwrap();
        let pipeline = compile(&rules, &FieldTable::default()).unwrap();
        let err = lower(&pipeline, None).unwrap_err();
        assert!(matches!(err, CompileError::Invariant(_)));
    }
}
