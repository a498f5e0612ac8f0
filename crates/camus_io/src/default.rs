use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, opt},
    error::{ErrorKind, ParseError},
    multi::many0,
    sequence::preceded,
    IResult,
};

use camus_core::field::FieldTable;

use crate::{
    ast::{ArgAst, CallAst, ConstAst, LhsAst, QueryAst, RelAst, RelOp, RuleAst, RuleListAst},
    basic::parser::{
        parse_hex_byte, parse_ident, parse_ipv4_dotted, parse_number, parse_string_lit, parse_u32,
    },
    FieldSpecLoader, QueryLoader,
};

/// Parses the default rule-file format:
///
/// ```text
/// ipv4.dstAddr = 10.0.0.1 && tcp.dport > 1023 : fwd(3) ;
/// ```
#[derive(Default)]
pub struct DefaultQueryLoader {}

impl QueryLoader for DefaultQueryLoader {
    fn _load<'x, E: ParseError<&'x str>>(
        &self,
        content: &'x str,
    ) -> IResult<(), RuleListAst, E> {
        let (rest, rules) = many0(terminated_rule)(content)?;
        let (_, _) = all_consuming(multispace0)(rest)?;
        Ok(((), RuleListAst { rules }))
    }
}

/// Parses the field spec format, one declaration per line, on top of the
/// built-in catalog:
///
/// ```text
/// field tcp.dport 16 31
/// ```
#[derive(Default)]
pub struct DefaultFieldSpecLoader {}

impl FieldSpecLoader for DefaultFieldSpecLoader {
    fn _load<'x, E: ParseError<&'x str>>(&self, content: &'x str) -> IResult<(), FieldTable, E> {
        let (rest, decls) = many0(ws(parse_field_decl))(content)?;
        let (_, _) = all_consuming(multispace0)(rest)?;
        let mut table = FieldTable::default();
        for (header, field, width, priority) in decls {
            table.insert(header, field, width, priority);
        }
        Ok(((), table))
    }
}

fn ws<'a, O, E, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    E: ParseError<&'a str>,
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    preceded(multispace0, inner)
}

fn terminated_rule<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, RuleAst, E> {
    let (rest, rule) = ws(parse_rule)(input)?;
    let (rest, _) = ws(char(';'))(rest)?;
    Ok((rest, rule))
}

fn parse_rule<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, RuleAst, E> {
    let (rest, query) = parse_or_expr(input)?;
    let (rest, _) = ws(char(':'))(rest)?;
    let (rest, first) = ws(parse_call)(rest)?;
    let (rest, more) = many0(preceded(ws(char(',')), ws(parse_call)))(rest)?;
    let mut actions = vec![first];
    actions.extend(more);
    Ok((rest, RuleAst { query, actions }))
}

fn parse_or_expr<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, QueryAst, E> {
    let (rest, first) = parse_and_expr(input)?;
    let (rest, more) = many0(preceded(ws(tag("||")), parse_and_expr))(rest)?;
    Ok((
        rest,
        more.into_iter()
            .fold(first, |acc, q| QueryAst::Or(Box::new(acc), Box::new(q))),
    ))
}

fn parse_and_expr<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, QueryAst, E> {
    let (rest, first) = ws(parse_rel_expr)(input)?;
    let (rest, more) = many0(preceded(ws(tag("&&")), ws(parse_rel_expr)))(rest)?;
    Ok((
        rest,
        more.into_iter()
            .fold(first, |acc, q| QueryAst::And(Box::new(acc), Box::new(q))),
    ))
}

fn parse_rel_expr<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, QueryAst, E> {
    let (rest, bang) = opt(char('!'))(input)?;
    let (rest, lhs) = ws(parse_lhs)(rest)?;
    let (rest, op) = ws(alt((
        map(char('<'), |_| RelOp::Lt),
        map(char('>'), |_| RelOp::Gt),
        map(char('='), |_| RelOp::Eq),
    )))(rest)?;
    let (rest, value) = ws(parse_const)(rest)?;
    // the '/ prefix_len' form exists only for '='
    let (rest, mask) = if op == RelOp::Eq {
        opt(preceded(ws(char('/')), ws(parse_const)))(rest)?
    } else {
        (rest, None)
    };
    Ok((
        rest,
        QueryAst::Rel(RelAst {
            negated: bang.is_some(),
            lhs,
            op,
            value,
            mask,
        }),
    ))
}

fn parse_lhs<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, LhsAst, E> {
    alt((
        map(parse_call, |c| LhsAst::Call(c.name, c.args)),
        parse_field,
    ))(input)
}

fn parse_field<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, LhsAst, E> {
    let (rest, first) = parse_ident(input)?;
    let (rest, second) = opt(preceded(char('.'), parse_ident))(rest)?;
    Ok(match second {
        Some(field) => (
            rest,
            LhsAst::Field(Some(first.to_owned()), field.to_owned()),
        ),
        None => (rest, LhsAst::Field(None, first.to_owned())),
    })
}

fn parse_call<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, CallAst, E> {
    let (rest, name) = parse_ident(input)?;
    let (rest, _) = ws(char('('))(rest)?;
    let (rest, args) = nom::multi::separated_list0(ws(char(',')), ws(parse_arg))(rest)?;
    let (rest, _) = ws(char(')'))(rest)?;
    Ok((
        rest,
        CallAst {
            name: name.to_owned(),
            args,
        },
    ))
}

fn parse_arg<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, ArgAst, E> {
    alt((
        map(parse_number, ArgAst::Num),
        map(parse_ident, |s| ArgAst::Ident(s.to_owned())),
    ))(input)
}

fn parse_const<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, ConstAst, E> {
    alt((
        map(parse_string_lit, |s| ConstAst::Str(s.to_owned())),
        parse_ipv6,
        parse_mac,
        map(parse_ipv4_dotted, ConstAst::Ipv4),
        map(parse_number, ConstAst::Num),
    ))(input)
}

fn parse_mac<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, ConstAst, E> {
    let (rest, b0) = parse_hex_byte(input)?;
    let mut bytes = [b0, 0, 0, 0, 0, 0];
    let mut rest = rest;
    for byte in bytes.iter_mut().skip(1) {
        let (r, _) = char(':')(rest)?;
        let (r, b) = parse_hex_byte(r)?;
        *byte = b;
        rest = r;
    }
    let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    Ok((rest, ConstAst::Mac(value)))
}

// Consume a hex-and-colon token, then validate it as an IPv6 address; the
// token backtracks cleanly so MAC and IPv4 forms get their turn.
fn parse_ipv6<'a, E: ParseError<&'a str>>(input: &'a str) -> IResult<&'a str, ConstAst, E> {
    let (rest, token) = take_while1(|c: char| c.is_ascii_hexdigit() || c == ':')(input)?;
    match ipv6_limbs(token) {
        Some((a, b, c, d)) => Ok((rest, ConstAst::Ipv6(a, b, c, d))),
        None => Err(nom::Err::Error(E::from_error_kind(
            input,
            ErrorKind::Verify,
        ))),
    }
}

fn ipv6_limbs(token: &str) -> Option<(u32, u32, u32, u32)> {
    if !token.contains(':') || token.matches("::").count() > 1 {
        return None;
    }
    fn groups(s: &str) -> Option<Vec<u16>> {
        if s.is_empty() {
            return Some(vec![]);
        }
        s.split(':')
            .map(|g| {
                if g.is_empty() || g.len() > 4 {
                    None
                } else {
                    u16::from_str_radix(g, 16).ok()
                }
            })
            .collect()
    }
    let full: Vec<u16> = match token.find("::") {
        Some(i) => {
            let head = groups(&token[..i])?;
            let tail = groups(&token[i + 2..])?;
            if head.len() + tail.len() > 7 {
                return None;
            }
            let mut v = head;
            v.resize(8 - tail.len(), 0);
            v.extend(tail);
            v
        }
        None => {
            let g = groups(token)?;
            if g.len() != 8 {
                return None;
            }
            g
        }
    };
    let limb = |i: usize| ((full[2 * i] as u32) << 16) | full[2 * i + 1] as u32;
    Some((limb(0), limb(1), limb(2), limb(3)))
}

fn parse_field_decl<'a, E: ParseError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, (String, String, u32, i32), E> {
    let (rest, _) = tag("field")(input)?;
    let (rest, _) = multispace1(rest)?;
    let (rest, header) = parse_ident(rest)?;
    let (rest, _) = char('.')(rest)?;
    let (rest, field) = parse_ident(rest)?;
    let (rest, _) = multispace1(rest)?;
    let (rest, width) = parse_u32(rest)?;
    let (rest, _) = multispace1(rest)?;
    let (rest, priority) = parse_number(rest)?;
    Ok((
        rest,
        (header.to_owned(), field.to_owned(), width, priority as i32),
    ))
}
