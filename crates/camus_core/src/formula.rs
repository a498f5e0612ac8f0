//! # Boolean formulas
//!
//! The surface query is a tree of `And`/`Or`/`Not` over atomic predicates.
//! The compiler consumes it through one operation only:
//! [to_dnf](Formula::to_dnf), which rewrites the tree into a set of
//! conjuncts of positive atoms.
//!
//! Negation is eliminated during the rewrite. Over numbers the complements
//! are expressible (`!(v < x)` is `v > x - 1`, `!(v = n)` splits into the
//! two strict ranges); a negated prefix match or a negated non-numeric
//! equality has no table shape and is rejected as unsupported.

use crate::{
    error::CompileError,
    field::Assignment,
    predicate::AtomicPredicate,
    value::QueryConst,
};

/// One AND-group of a DNF formula; atoms sorted by the atom order and
/// de-duplicated.
pub type Conjunct = Vec<AtomicPredicate>;

/// A boolean combination of atomic predicates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Formula {
    Atom(AtomicPredicate),
    Not(Box<Formula>),
    And(Box<Formula>, Box<Formula>),
    Or(Box<Formula>, Box<Formula>),
}

impl Formula {
    pub fn atom(p: AtomicPredicate) -> Self {
        Formula::Atom(p)
    }

    pub fn not(f: Formula) -> Self {
        Formula::Not(Box::new(f))
    }

    pub fn and(a: Formula, b: Formula) -> Self {
        Formula::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Formula, b: Formula) -> Self {
        Formula::Or(Box::new(a), Box::new(b))
    }

    /// Evaluate against a hypothetical packet.
    pub fn eval(&self, a: &Assignment) -> Result<bool, CompileError> {
        match self {
            Formula::Atom(p) => p.eval(a),
            Formula::Not(f) => Ok(!f.eval(a)?),
            Formula::And(l, r) => Ok(l.eval(a)? && r.eval(a)?),
            Formula::Or(l, r) => Ok(l.eval(a)? || r.eval(a)?),
        }
    }

    /// Normalize to disjunctive normal form: a list of conjuncts of
    /// positive atoms, each sorted and de-duplicated, with duplicate
    /// conjuncts removed in first-seen order.
    pub fn to_dnf(&self) -> Result<Vec<Conjunct>, CompileError> {
        let nnf = self.push_negation(false)?;
        let mut conjuncts = nnf.distribute();
        for c in conjuncts.iter_mut() {
            c.sort();
            c.dedup();
        }
        // keep first occurrence; conjunct order decides entry priorities
        let mut seen: Vec<&Conjunct> = Vec::with_capacity(conjuncts.len());
        let mut keep = vec![true; conjuncts.len()];
        for (i, c) in conjuncts.iter().enumerate() {
            if seen.contains(&c) {
                keep[i] = false;
            } else {
                seen.push(c);
            }
        }
        let mut keep = keep.into_iter();
        conjuncts.retain(|_| keep.next().unwrap_or(false));
        Ok(conjuncts)
    }

    // Rewrite into negation-free form, complementing atoms as needed.
    fn push_negation(&self, negate: bool) -> Result<Formula, CompileError> {
        match self {
            Formula::Atom(p) => {
                if negate {
                    Self::complement_atom(p)
                } else {
                    Ok(Formula::Atom(p.clone()))
                }
            }
            Formula::Not(f) => f.push_negation(!negate),
            Formula::And(l, r) => {
                let l = l.push_negation(negate)?;
                let r = r.push_negation(negate)?;
                Ok(if negate {
                    Formula::or(l, r)
                } else {
                    Formula::and(l, r)
                })
            }
            Formula::Or(l, r) => {
                let l = l.push_negation(negate)?;
                let r = r.push_negation(negate)?;
                Ok(if negate {
                    Formula::and(l, r)
                } else {
                    Formula::or(l, r)
                })
            }
        }
    }

    fn complement_atom(p: &AtomicPredicate) -> Result<Formula, CompileError> {
        match p {
            // !(v < x)  ==  v >= x  ==  v > x - 1
            AtomicPredicate::Lt(f, c) => Ok(Formula::Atom(AtomicPredicate::gt(
                f.clone(),
                c.pred()?,
            )?)),
            // !(v > x)  ==  v <= x  ==  v < x + 1
            AtomicPredicate::Gt(f, c) => Ok(Formula::Atom(AtomicPredicate::lt(
                f.clone(),
                c.succ()?,
            )?)),
            AtomicPredicate::Eq(f, c @ QueryConst::Number(_)) => Ok(Formula::or(
                Formula::Atom(AtomicPredicate::lt(f.clone(), c.clone())?),
                Formula::Atom(AtomicPredicate::gt(f.clone(), c.clone())?),
            )),
            other => Err(CompileError::Unsupported(format!(
                "negation of {} comparison on {}",
                other.constant().kind(),
                other.field()
            ))),
        }
    }

    // Distribute And over Or on a negation-free tree.
    fn distribute(&self) -> Vec<Conjunct> {
        match self {
            Formula::Atom(p) => vec![vec![p.clone()]],
            Formula::Or(l, r) => {
                let mut out = l.distribute();
                out.extend(r.distribute());
                out
            }
            Formula::And(l, r) => {
                let ls = l.distribute();
                let rs = r.distribute();
                let mut out = Vec::with_capacity(ls.len() * rs.len());
                for lc in &ls {
                    for rc in &rs {
                        let mut c = lc.clone();
                        c.extend(rc.iter().cloned());
                        out.push(c);
                    }
                }
                out
            }
            Formula::Not(_) => unreachable!("negation survived push_negation"),
        }
    }
}
