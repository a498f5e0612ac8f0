use thiserror::Error;

/// Hard errors raised anywhere between AST shaping and target lowering.
///
/// None of these are recoverable: the compiler is an offline tool and the
/// correct response to any of them is a diagnostic and a non-zero exit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// An operator was applied to a constant kind it does not support.
    #[error("{op} requires a {want} constant, got {got}")]
    BadOperand {
        op: &'static str,
        want: &'static str,
        got: &'static str,
    },

    /// A construct the compiler recognises but deliberately rejects.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    /// A terminal state aggregates forwarding and non-forwarding actions.
    #[error("Cannot merge fwd action with other types")]
    ActionMerge,

    /// A structural invariant of the pipeline was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// `eval` was called with an assignment lacking a binding.
    #[error("no binding for field {header}.{field}")]
    MissingBinding { header: String, field: String },

    /// `eval` found a binding of the wrong constant kind.
    #[error("type mismatch evaluating {header}.{field}")]
    EvalType { header: String, field: String },

    /// A constant cannot be encoded at the width of its field.
    #[error("value {value} does not fit in {width} bits")]
    WidthOverflow { value: String, width: u32 },
}
