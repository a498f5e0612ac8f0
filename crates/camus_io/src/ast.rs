//! Surface AST and its shaping into the core rule model.
//!
//! The AST mirrors the grammar one-to-one; everything the grammar accepts
//! is representable here. [lower] applies the semantic restrictions: LHS
//! call shapes, the reserved `inc`, `fwd` argument checking, and operator /
//! constant-kind compatibility (via the fallible atom constructors).

use camus_core::{
    action::{QueryAction, Rule, RuleSet},
    error::CompileError,
    field::QueryField,
    formula::Formula,
    predicate::AtomicPredicate,
    value::QueryConst,
};

/// A constant literal as written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstAst {
    Num(i64),
    Ipv4(u32),
    Ipv6(u32, u32, u32, u32),
    Mac(u64),
    Str(String),
}

/// An argument of a call, either a bare identifier or a number literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgAst {
    Ident(String),
    Num(i64),
}

/// Left-hand side of a comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LhsAst {
    /// `header.field`, or a bare identifier with no header part.
    Field(Option<String>, String),
    Call(String, Vec<ArgAst>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelOp {
    Lt,
    Gt,
    Eq,
}

/// `[!] lhs op const [/ const]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelAst {
    pub negated: bool,
    pub lhs: LhsAst,
    pub op: RelOp,
    pub value: ConstAst,
    pub mask: Option<ConstAst>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryAst {
    Rel(RelAst),
    And(Box<QueryAst>, Box<QueryAst>),
    Or(Box<QueryAst>, Box<QueryAst>),
}

/// An action call with its literal arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallAst {
    pub name: String,
    pub args: Vec<ArgAst>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleAst {
    pub query: QueryAst,
    pub actions: Vec<CallAst>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleListAst {
    pub rules: Vec<RuleAst>,
}

/// Shape the AST into the core rule model.
pub fn lower(parsed: RuleListAst) -> Result<RuleSet, CompileError> {
    let mut rules = Vec::with_capacity(parsed.rules.len());
    for rule in parsed.rules {
        let formula = lower_query(rule.query)?;
        let actions = rule
            .actions
            .into_iter()
            .map(lower_action)
            .collect::<Result<Vec<_>, _>>()?;
        rules.push(Rule { formula, actions });
    }
    Ok(RuleSet {
        rules,
        default_action: None,
    })
}

fn lower_query(q: QueryAst) -> Result<Formula, CompileError> {
    match q {
        QueryAst::And(a, b) => Ok(Formula::and(lower_query(*a)?, lower_query(*b)?)),
        QueryAst::Or(a, b) => Ok(Formula::or(lower_query(*a)?, lower_query(*b)?)),
        QueryAst::Rel(rel) => {
            let field = lower_lhs(rel.lhs)?;
            let value = lower_const(rel.value);
            let atom = match (rel.op, rel.mask) {
                (RelOp::Eq, Some(mask)) => {
                    AtomicPredicate::lpm(field, value, lower_const(mask))?
                }
                (RelOp::Eq, None) => AtomicPredicate::eq(field, value),
                (RelOp::Lt, None) => AtomicPredicate::lt(field, value)?,
                (RelOp::Gt, None) => AtomicPredicate::gt(field, value)?,
                (_, Some(_)) => {
                    return Err(CompileError::Unsupported(
                        "prefix mask on a range comparison".to_owned(),
                    ))
                }
            };
            let formula = Formula::Atom(atom);
            Ok(if rel.negated {
                Formula::not(formula)
            } else {
                formula
            })
        }
    }
}

fn lower_lhs(lhs: LhsAst) -> Result<QueryField, CompileError> {
    match lhs {
        LhsAst::Field(Some(header), field) => Ok(QueryField::new(header, field)),
        LhsAst::Field(None, field) => Ok(QueryField::new("default", field)),
        LhsAst::Call(name, _) if name == "inc" => Err(CompileError::Unsupported(
            "inc() as a query operand".to_owned(),
        )),
        // func(field, ...) reads stateful metadata named after the field
        LhsAst::Call(_, args) => match args.first() {
            Some(ArgAst::Ident(field)) => Ok(QueryField::new("stful_meta", field.clone())),
            Some(ArgAst::Num(_)) => Err(CompileError::BadOperand {
                op: "call",
                want: "field name",
                got: "number",
            }),
            None => Err(CompileError::BadOperand {
                op: "call",
                want: "field name",
                got: "nothing",
            }),
        },
    }
}

fn lower_const(c: ConstAst) -> QueryConst {
    match c {
        ConstAst::Num(n) => QueryConst::Number(n),
        ConstAst::Ipv4(v) => QueryConst::Ipv4(v),
        ConstAst::Ipv6(a, b, c, d) => QueryConst::Ipv6(a, b, c, d),
        ConstAst::Mac(v) => QueryConst::Mac(v),
        ConstAst::Str(s) => QueryConst::Text(s),
    }
}

fn lower_action(call: CallAst) -> Result<QueryAction, CompileError> {
    let numeric_args = |args: &[ArgAst]| -> Result<Vec<i64>, CompileError> {
        args.iter()
            .map(|a| match a {
                ArgAst::Num(n) => Ok(*n),
                ArgAst::Ident(_) => Err(CompileError::BadOperand {
                    op: "action",
                    want: "number",
                    got: "identifier",
                }),
            })
            .collect()
    };
    if call.name == "fwd" {
        match call.args.as_slice() {
            [ArgAst::Num(n)] if (0..=u16::MAX as i64).contains(n) => {
                Ok(QueryAction::ForwardPort(*n as u16))
            }
            _ => Err(CompileError::BadOperand {
                op: "fwd",
                want: "port number",
                got: "other",
            }),
        }
    } else {
        Ok(QueryAction::UserAction(call.name, numeric_args(&call.args)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ident_gets_default_header() {
        let f = lower_lhs(LhsAst::Field(None, "proto".into())).unwrap();
        assert_eq!(f, QueryField::new("default", "proto"));
    }

    #[test]
    fn call_lhs_reads_stateful_metadata() {
        let f = lower_lhs(LhsAst::Call(
            "window".into(),
            vec![ArgAst::Ident("count".into())],
        ))
        .unwrap();
        assert_eq!(f, QueryField::new("stful_meta", "count"));
    }

    #[test]
    fn inc_is_reserved() {
        let e = lower_lhs(LhsAst::Call("inc".into(), vec![ArgAst::Ident("x".into())]));
        assert!(matches!(e, Err(CompileError::Unsupported(_))));
    }

    #[test]
    fn call_lhs_requires_a_field_argument() {
        let e = lower_lhs(LhsAst::Call("window".into(), vec![ArgAst::Num(3)]));
        assert!(matches!(e, Err(CompileError::BadOperand { .. })));
        let e = lower_lhs(LhsAst::Call("window".into(), vec![]));
        assert!(matches!(e, Err(CompileError::BadOperand { .. })));
    }

    #[test]
    fn fwd_requires_one_numeric_port() {
        let ok = lower_action(CallAst {
            name: "fwd".into(),
            args: vec![ArgAst::Num(3)],
        })
        .unwrap();
        assert_eq!(ok, QueryAction::ForwardPort(3));

        for args in [
            vec![],
            vec![ArgAst::Ident("p".into())],
            vec![ArgAst::Num(-1)],
            vec![ArgAst::Num(70000)],
            vec![ArgAst::Num(1), ArgAst::Num(2)],
        ] {
            let e = lower_action(CallAst {
                name: "fwd".into(),
                args,
            });
            assert!(e.is_err());
        }
    }

    #[test]
    fn user_action_keeps_numeric_args() {
        let a = lower_action(CallAst {
            name: "count".into(),
            args: vec![ArgAst::Num(7), ArgAst::Num(8)],
        })
        .unwrap();
        assert_eq!(a, QueryAction::UserAction("count".into(), vec![7, 8]));
    }

    #[test]
    fn lt_on_string_is_a_shape_error() {
        let q = QueryAst::Rel(RelAst {
            negated: false,
            lhs: LhsAst::Field(Some("http".into()), "host".into()),
            op: RelOp::Lt,
            value: ConstAst::Str("example".into()),
            mask: None,
        });
        assert!(matches!(
            lower_query(q),
            Err(CompileError::BadOperand { .. })
        ));
    }

    #[test]
    fn lpm_requires_address_base() {
        let q = QueryAst::Rel(RelAst {
            negated: false,
            lhs: LhsAst::Field(Some("tcp".into()), "dport".into()),
            op: RelOp::Eq,
            value: ConstAst::Num(80),
            mask: Some(ConstAst::Num(8)),
        });
        assert!(matches!(
            lower_query(q),
            Err(CompileError::BadOperand { .. })
        ));
    }
}
