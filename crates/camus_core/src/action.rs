//! # Rule actions
//!
//! What a rule does when its query matches: forward out a port, or invoke
//! a user-defined data-plane action with literal arguments. Actions carry
//! an explicit total order (the source comparison was only partial over
//! user actions) so terminal entries can be de-duplicated and port sets
//! ordered deterministically.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use crate::formula::Formula;

/// One action named in a rule's action list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryAction {
    ForwardPort(u16),
    UserAction(String, Vec<i64>),
}

impl QueryAction {
    pub fn is_forward(&self) -> bool {
        matches!(self, QueryAction::ForwardPort(_))
    }
}

impl Ord for QueryAction {
    fn cmp(&self, other: &Self) -> Ordering {
        use QueryAction::*;
        match (self, other) {
            (ForwardPort(a), ForwardPort(b)) => a.cmp(b),
            (ForwardPort(_), UserAction(..)) => Ordering::Less,
            (UserAction(..), ForwardPort(_)) => Ordering::Greater,
            (UserAction(n, a), UserAction(m, b)) => n.cmp(m).then_with(|| a.cmp(b)),
        }
    }
}

impl PartialOrd for QueryAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for QueryAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            QueryAction::ForwardPort(p) => write!(f, "fwd({})", p),
            QueryAction::UserAction(name, args) => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
        }
    }
}

/// One surface rule: a query formula and the actions to run on match.
#[derive(Clone, Debug)]
pub struct Rule {
    pub formula: Formula,
    pub actions: Vec<QueryAction>,
}

/// The whole input: rules in source order plus an optional default action
/// for terminal states whose action list is empty. No default means drop.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub default_action: Option<QueryAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_order_is_total() {
        let actions = vec![
            QueryAction::ForwardPort(1),
            QueryAction::ForwardPort(2),
            QueryAction::UserAction("a".into(), vec![]),
            QueryAction::UserAction("a".into(), vec![1]),
            QueryAction::UserAction("b".into(), vec![]),
        ];
        for a in &actions {
            assert_eq!(a.cmp(a), Ordering::Equal);
            for b in &actions {
                assert_eq!(a.cmp(b), b.cmp(a).reverse());
                if a.cmp(b) == Ordering::Equal {
                    assert_eq!(a, b);
                }
            }
        }
        let mut sorted = actions.clone();
        sorted.sort();
        assert_eq!(sorted, actions);
    }

    #[test]
    fn display_forms() {
        assert_eq!(QueryAction::ForwardPort(3).to_string(), "fwd(3)");
        assert_eq!(
            QueryAction::UserAction("count".into(), vec![7, 8]).to_string(),
            "count(7, 8)"
        );
    }
}
