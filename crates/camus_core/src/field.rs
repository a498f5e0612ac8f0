//! # Header fields
//!
//! A [QueryField] names one header field a rule may match on. Identity is
//! structural on `(header, field)`; the `priority` decides where the
//! field's table sits in the compiled pipeline (lowest first, so the
//! innermost decision comes last), and `width` is carried through to the
//! target for value encoding.
//!
//! The surface grammar produces fields with zero priority and width; the
//! [FieldTable] catalog fills both in before compilation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use fxhash::FxBuildHasher;
use indexmap::IndexMap;

use crate::value::QueryConst;

/// A typed reference to one header field.
#[derive(Clone, Debug, Eq)]
pub struct QueryField {
    pub header: String,
    pub field: String,
    pub priority: i32,
    pub width: u32,
}

impl QueryField {
    /// A field as the parser produces it: no width, no priority.
    pub fn new(header: impl Into<String>, field: impl Into<String>) -> Self {
        QueryField {
            header: header.into(),
            field: field.into(),
            priority: 0,
            width: 0,
        }
    }
}

impl PartialEq for QueryField {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.field == other.field
    }
}

impl Hash for QueryField {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.header.hash(state);
        self.field.hash(state);
    }
}

impl Ord for QueryField {
    // Priority drives pipeline layout; the name tie-break keeps the order
    // strict when two fields share a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.header.cmp(&other.header))
            .then_with(|| self.field.cmp(&other.field))
    }
}

impl PartialOrd for QueryField {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for QueryField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.header, self.field)
    }
}

/// Describes a known header field.
#[derive(Clone, Debug)]
struct FieldDecl {
    header: &'static str,
    field: &'static str,
    width: u32,
    priority: i32,
}

// Outer headers get lower priorities so their tables come first.
const DEFAULT_FIELDS: [FieldDecl; 14] = [
    FieldDecl { header: "eth", field: "src", width: 48, priority: 10 },
    FieldDecl { header: "eth", field: "dst", width: 48, priority: 11 },
    FieldDecl { header: "eth", field: "type", width: 16, priority: 12 },
    FieldDecl { header: "ipv4", field: "srcAddr", width: 32, priority: 20 },
    FieldDecl { header: "ipv4", field: "dstAddr", width: 32, priority: 21 },
    FieldDecl { header: "ipv4", field: "proto", width: 8, priority: 22 },
    FieldDecl { header: "ipv4", field: "tos", width: 8, priority: 23 },
    FieldDecl { header: "ipv4", field: "ttl", width: 8, priority: 24 },
    FieldDecl { header: "ipv6", field: "srcAddr", width: 128, priority: 25 },
    FieldDecl { header: "ipv6", field: "dstAddr", width: 128, priority: 26 },
    FieldDecl { header: "tcp", field: "sport", width: 16, priority: 30 },
    FieldDecl { header: "tcp", field: "dport", width: 16, priority: 31 },
    FieldDecl { header: "udp", field: "sport", width: 16, priority: 32 },
    FieldDecl { header: "udp", field: "dport", width: 16, priority: 33 },
];

/// Catalog of field declarations, keyed by `(header, field)` and kept in
/// declaration order.
#[derive(Debug, Clone)]
pub struct FieldTable {
    decls: IndexMap<(String, String), (u32, i32), FxBuildHasher>,
}

impl Default for FieldTable {
    fn default() -> Self {
        let mut decls = IndexMap::default();
        for d in DEFAULT_FIELDS.iter() {
            decls.insert(
                (d.header.to_owned(), d.field.to_owned()),
                (d.width, d.priority),
            );
        }
        FieldTable { decls }
    }
}

impl FieldTable {
    /// An empty catalog; every lookup falls back to constant-derived widths.
    pub fn empty() -> Self {
        FieldTable {
            decls: IndexMap::default(),
        }
    }

    pub fn insert(&mut self, header: impl Into<String>, field: impl Into<String>, width: u32, priority: i32) {
        self.decls
            .insert((header.into(), field.into()), (width, priority));
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Fill in width and priority for a parsed field. Unknown fields take
    /// the natural width of the constant they are compared against.
    pub fn resolve(&self, f: &QueryField, hint: Option<&QueryConst>) -> QueryField {
        let key = (f.header.clone(), f.field.clone());
        match self.decls.get(&key) {
            Some(&(width, priority)) => QueryField {
                header: key.0,
                field: key.1,
                width,
                priority,
            },
            None => QueryField {
                header: key.0,
                field: key.1,
                width: hint.map(QueryConst::natural_width).unwrap_or(32),
                priority: f.priority,
            },
        }
    }
}

/// A hypothetical packet: a mapping from fields to concrete values. Only
/// used to evaluate predicates in tests and property checks.
#[derive(Debug, Default)]
pub struct Assignment {
    bindings: HashMap<(String, String), QueryConst, FxBuildHasher>,
}

impl Assignment {
    pub fn bind(&mut self, field: &QueryField, value: QueryConst) {
        self.bindings
            .insert((field.header.clone(), field.field.clone()), value);
    }

    pub fn get(&self, field: &QueryField) -> Option<&QueryConst> {
        self.bindings
            .get(&(field.header.clone(), field.field.clone()))
    }
}
