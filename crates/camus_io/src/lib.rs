//! Parsing for the Camus rule language (.camus query files) and for field
//! spec files that override the built-in header catalog.
//!
//! Parsing is split in two: the loaders in [default] produce a plain AST
//! mirroring the surface grammar, and [ast::lower] shapes the AST into a
//! [RuleSet], rejecting constructs the compiler does not accept (reserved
//! `inc`, non-numeric action arguments, masks on range comparisons).
pub mod ast;
mod default;

use nom::{
    error::{Error, ParseError},
    Finish, IResult,
};
use thiserror::Error as ThisError;

use camus_core::{action::RuleSet, error::CompileError, field::FieldTable};

pub use ast::RuleListAst;
pub use default::{DefaultFieldSpecLoader, DefaultQueryLoader};

/// QueryLoader parses rule text into the surface AST according to some
/// format.
pub trait QueryLoader {
    // Required method
    fn _load<'x, E: ParseError<&'x str>>(&self, content: &'x str)
        -> IResult<(), RuleListAst, E>;

    // Provided method
    fn load<'x>(&self, content: &'x str) -> Result<RuleListAst, Error<&'x str>> {
        match self._load(content).finish() {
            Ok((_, rules)) => Ok(rules),
            Err(e) => Err(e),
        }
    }
}

/// FieldSpecLoader parses a field spec file and produces the catalog the
/// compiler resolves parsed fields against.
pub trait FieldSpecLoader {
    // Required method
    fn _load<'x, E: ParseError<&'x str>>(&self, content: &'x str) -> IResult<(), FieldTable, E>;

    // Provided method
    fn load<'x>(&self, content: &'x str) -> Result<FieldTable, Error<&'x str>> {
        match self._load(content).finish() {
            Ok((_, table)) => Ok(table),
            Err(e) => Err(e),
        }
    }
}

/// Error of the convenience entry points; owns the offending input snippet
/// so it can outlive the parsed text.
#[derive(Debug, ThisError)]
pub enum LoadError {
    #[error("parse error near {0:?}")]
    Parse(String),
    #[error(transparent)]
    Shape(#[from] CompileError),
}

fn snippet(input: &str) -> String {
    input.chars().take(40).collect()
}

/// Parse and shape-check a rule file in one step.
pub fn load_rules(content: &str) -> Result<RuleSet, LoadError> {
    let parsed = DefaultQueryLoader::default()
        .load(content)
        .map_err(|e| LoadError::Parse(snippet(e.input)))?;
    Ok(ast::lower(parsed)?)
}

/// Parse a field spec file into a catalog seeded with the defaults.
pub fn load_field_spec(content: &str) -> Result<FieldTable, LoadError> {
    DefaultFieldSpecLoader::default()
        .load(content)
        .map_err(|e| LoadError::Parse(snippet(e.input)))
}

/// Basics for io
pub mod basic {
    /// Basic helper functions for parsing
    pub mod parser {
        use nom::bytes::complete::{take_while, take_while1, take_while_m_n};
        use nom::character::complete::{char, digit1};
        use nom::combinator::{opt, recognize};
        use nom::error::{ErrorKind, ParseError};
        use nom::sequence::{delimited, pair, tuple};
        use nom::Err::Error;
        use nom::IResult;

        fn is_ident(chr: char) -> bool {
            chr.is_ascii_alphanumeric() || chr == '_'
        }

        /// r"[a-zA-Z0-9_]+"
        pub fn parse_ident<'a, E: ParseError<&'a str>>(
            input: &'a str,
        ) -> IResult<&'a str, &'a str, E> {
            take_while1(is_ident)(input)
        }

        /// r"-?[0-9]+" into an i64
        pub fn parse_number<'a, E: ParseError<&'a str>>(
            input: &'a str,
        ) -> IResult<&'a str, i64, E> {
            let (rest, text) = recognize(pair(opt(char('-')), digit1))(input)?;
            match text.parse::<i64>() {
                Ok(n) => Ok((rest, n)),
                Err(_) => Err(Error(E::from_error_kind(input, ErrorKind::Digit))),
            }
        }

        /// r"[0-9]+" into a u32
        pub fn parse_u32<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, u32, E> {
            let (rest, num) = digit1(input)?;
            match num.parse::<u32>() {
                Ok(num) => Ok((rest, num)),
                Err(_) => Err(Error(E::from_error_kind(input, ErrorKind::Digit))),
            }
        }

        /// r"[<=255].[<=255].[<=255].[<=255]"
        pub fn parse_ipv4_dotted<'a, E: ParseError<&'a str>>(
            input: &'a str,
        ) -> IResult<&'a str, u32, E> {
            fn parse_u8<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, u8, E> {
                let (rest, num) = digit1(input)?;
                if let Ok(num) = num.parse::<u8>() {
                    Ok((rest, num))
                } else {
                    Err(Error(E::from_error_kind(input, ErrorKind::Digit)))
                }
            }

            let (rest, (o1, _, o2, _, o3, _, o4)) = tuple((
                parse_u8,
                char('.'),
                parse_u8,
                char('.'),
                parse_u8,
                char('.'),
                parse_u8,
            ))(input)?;
            Ok((
                rest,
                (o1 as u32) << 24 | (o2 as u32) << 16 | (o3 as u32) << 8 | o4 as u32,
            ))
        }

        /// Two hex digits into a byte.
        pub fn parse_hex_byte<'a, E: ParseError<&'a str>>(
            input: &'a str,
        ) -> IResult<&'a str, u8, E> {
            let (rest, text) = take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit())(input)?;
            match u8::from_str_radix(text, 16) {
                Ok(b) => Ok((rest, b)),
                Err(_) => Err(Error(E::from_error_kind(input, ErrorKind::HexDigit))),
            }
        }

        /// A double-quoted string without escapes.
        pub fn parse_string_lit<'a, E: ParseError<&'a str>>(
            input: &'a str,
        ) -> IResult<&'a str, &'a str, E> {
            delimited(char('"'), take_while(|c| c != '"'), char('"'))(input)
        }
    }
}
