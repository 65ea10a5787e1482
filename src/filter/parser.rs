//! nom parser for SCIM filters and patch paths.
//!
//! Every parse failure — unterminated bracket, unknown operator, missing or
//! mistyped operand — is reported as an `invalidPath` error carrying the nom
//! context trace for the offending position.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, cut, opt, recognize},
    error::{context, VerboseError, VerboseErrorKind},
    sequence::{delimited, pair, preceded},
    Finish, IResult,
};

use crate::error::{ScimError, ScimResult};
use crate::filter::{AttrPath, CompareOp, Filter, Literal, PatchPath};

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Parses a complete SCIM filter expression.
pub fn parse_filter(input: &str) -> ScimResult<Filter> {
    match all_consuming(delimited(multispace0, or_expr, multispace0))(input).finish() {
        Ok((_, filter)) => Ok(filter),
        Err(e) => Err(invalid(input, e)),
    }
}

/// Parses a patch path: `attr`, `attr.sub`, `attr[selector]`,
/// `attr[selector].sub`, each optionally URN-qualified.
pub fn parse_path(input: &str) -> ScimResult<PatchPath> {
    match all_consuming(delimited(multispace0, patch_path, multispace0))(input).finish() {
        Ok((_, path)) => Ok(path),
        Err(e) => Err(invalid(input, e)),
    }
}

fn invalid(input: &str, e: VerboseError<&str>) -> ScimError {
    let detail = e
        .errors
        .iter()
        .rev()
        .find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(c) => Some(*c),
            _ => None,
        })
        .unwrap_or("malformed expression");
    ScimError::invalid_path(format!("{} in {:?}", detail, input))
}

fn failure<'a>(at: &'a str, msg: &'static str) -> nom::Err<VerboseError<&'a str>> {
    nom::Err::Failure(VerboseError {
        errors: vec![(at, VerboseErrorKind::Context(msg))],
    })
}

// ---------------------------------------------------------------------
// Lexical pieces
// ---------------------------------------------------------------------

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-' | '$')
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$')
}

/// A bare attribute name without dots or colons.
fn attr_name(input: &str) -> PResult<&str> {
    take_while1(is_name_char)(input)
}

/// An attribute path token, URN-qualified or dotted.
fn attr_path(input: &str) -> PResult<AttrPath> {
    let (rest, token) = take_while1(is_path_char)(input)?;
    let (urn, bare) = match token.rfind(':') {
        Some(pos) => (Some(&token[..pos]), &token[pos + 1..]),
        None => (None, token),
    };
    if bare.is_empty() {
        return Err(failure(input, "missing attribute name"));
    }
    let (attr, sub) = match bare.split_once('.') {
        Some((a, s)) => (a, Some(s)),
        None => (bare, None),
    };
    if attr.is_empty() || sub.map(|s| s.is_empty() || s.contains('.')).unwrap_or(false) {
        return Err(failure(input, "malformed attribute path"));
    }
    Ok((
        rest,
        AttrPath {
            urn: urn.map(str::to_string),
            attr: attr.to_lowercase(),
            sub: sub.map(str::to_lowercase),
        },
    ))
}

/// A double-quoted string with the JSON escape set.
fn string_literal(input: &str) -> PResult<String> {
    let (rest, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&rest[i + 1..], out)),
            '\\' => match chars.next() {
                Some((_, '"')) => out.push('"'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '/')) => out.push('/'),
                Some((_, 'b')) => out.push('\u{0008}'),
                Some((_, 'f')) => out.push('\u{000C}'),
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 't')) => out.push('\t'),
                Some((j, 'u')) => {
                    let hex = rest.get(j + 1..j + 5).ok_or_else(|| {
                        failure(input, "truncated unicode escape in string literal")
                    })?;
                    let code = u32::from_str_radix(hex, 16)
                        .map_err(|_| failure(input, "invalid unicode escape in string literal"))?;
                    out.push(
                        char::from_u32(code)
                            .ok_or_else(|| failure(input, "invalid unicode escape"))?,
                    );
                    for _ in 0..4 {
                        chars.next();
                    }
                }
                _ => return Err(failure(input, "invalid escape in string literal")),
            },
            _ => out.push(c),
        }
    }
    Err(failure(input, "unterminated string literal"))
}

fn number_literal(input: &str) -> PResult<Literal> {
    let (rest, text) = recognize(pair(
        opt(char('-')),
        pair(
            take_while1(|c: char| c.is_ascii_digit()),
            opt(pair(char('.'), take_while1(|c: char| c.is_ascii_digit()))),
        ),
    ))(input)?;
    let lit = if text.contains('.') {
        text.parse::<f64>()
            .map(Literal::Decimal)
            .map_err(|_| failure(input, "invalid number"))?
    } else {
        text.parse::<i64>()
            .map(Literal::Int)
            .map_err(|_| failure(input, "invalid number"))?
    };
    Ok((rest, lit))
}

fn literal(input: &str) -> PResult<Literal> {
    alt((
        |i| string_literal(i).map(|(r, s)| (r, Literal::Str(s))),
        number_literal,
        |i| tag("true")(i).map(|(r, _): (&str, &str)| (r, Literal::Bool(true))),
        |i| tag("false")(i).map(|(r, _): (&str, &str)| (r, Literal::Bool(false))),
        |i| tag("null")(i).map(|(r, _): (&str, &str)| (r, Literal::Null)),
    ))(input)
}

// ---------------------------------------------------------------------
// Filter grammar, lowest precedence first
// ---------------------------------------------------------------------

fn or_expr(input: &str) -> PResult<Filter> {
    let (mut input, mut acc) = and_expr(input)?;
    while let Some(rest) = keyword(input, "or") {
        let (rest, next) = and_expr(rest)?;
        acc = Filter::Or(Box::new(acc), Box::new(next));
        input = rest;
    }
    Ok((input, acc))
}

fn and_expr(input: &str) -> PResult<Filter> {
    let (mut input, mut acc) = not_expr(input)?;
    while let Some(rest) = keyword(input, "and") {
        let (rest, next) = not_expr(rest)?;
        acc = Filter::And(Box::new(acc), Box::new(next));
        input = rest;
    }
    Ok((input, acc))
}

/// Consumes an `and`/`or` keyword delimited by mandatory whitespace, so
/// attribute names beginning with the same letters are not mistaken for
/// combinators. Returns the input after the keyword, or `None`.
fn keyword<'a>(input: &'a str, word: &str) -> Option<&'a str> {
    let trimmed = input.trim_start();
    if trimmed.len() == input.len() {
        return None;
    }
    let end = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (w, rest) = trimmed.split_at(end);
    if !w.eq_ignore_ascii_case(word) {
        return None;
    }
    let after = rest.trim_start();
    if after.len() == rest.len() {
        return None;
    }
    Some(after)
}

fn not_expr(input: &str) -> PResult<Filter> {
    let (rest, word) = opt(take_while1(|c: char| c.is_ascii_alphabetic()))(input)?;
    if let Some(w) = word {
        if w.eq_ignore_ascii_case("not") {
            let (rest, inner) = context(
                "not requires a parenthesized expression",
                cut(preceded(multispace0, paren_expr)),
            )(rest)?;
            return Ok((rest, Filter::Not(Box::new(inner))));
        }
    }
    primary(input)
}

fn paren_expr(input: &str) -> PResult<Filter> {
    let (input, _) = char('(')(input)?;
    let (input, inner) = context(
        "expression",
        cut(delimited(multispace0, or_expr, multispace0)),
    )(input)?;
    let (input, _) = context("unterminated group", cut(char(')')))(input)?;
    Ok((input, inner))
}

fn primary(input: &str) -> PResult<Filter> {
    if input.starts_with('(') {
        return paren_expr(input);
    }
    value_path_filter(input)
}

/// Either `attr[filter]` or a comparison / presence atom.
fn value_path_filter(input: &str) -> PResult<Filter> {
    let (rest, path) = attr_path(input)?;
    if let Ok((rest, _)) = char::<_, VerboseError<&str>>('[')(rest) {
        if path.sub.is_some() {
            return Err(failure(input, "selector must follow the attribute name"));
        }
        let (rest, inner) = context(
            "selector expression",
            cut(delimited(multispace0, or_expr, multispace0)),
        )(rest)?;
        let (rest, _) = context("unterminated bracket", cut(char(']')))(rest)?;
        if rest.starts_with('.') {
            return Err(failure(
                rest,
                "sub-attribute after selector is not valid in a filter",
            ));
        }
        return Ok((
            rest,
            Filter::ValuePath {
                path,
                filter: Box::new(inner),
            },
        ));
    }
    atom_tail(rest, path)
}

/// The operator and operand following an attribute path.
fn atom_tail(input: &str, path: AttrPath) -> PResult<Filter> {
    let (input, _) = context("missing operator", cut(multispace1))(input)?;
    let (input, word) = context(
        "missing operator",
        cut(take_while1(|c: char| c.is_ascii_alphabetic())),
    )(input)?;
    let lower = word.to_lowercase();
    if lower == "pr" {
        return Ok((input, Filter::Present { path }));
    }
    let op = match CompareOp::from_word(&lower) {
        Some(op) => op,
        None => return Err(failure(word, "unknown operator")),
    };
    let (input, _) = context("missing operand", cut(multispace1))(input)?;
    let (input, value) = context("missing or mistyped operand", cut(literal))(input)?;
    Ok((input, Filter::Compare { path, op, value }))
}

// ---------------------------------------------------------------------
// Patch paths
// ---------------------------------------------------------------------

fn patch_path(input: &str) -> PResult<PatchPath> {
    let (rest, path) = attr_path(input)?;
    let (rest, selector) = opt(preceded(
        char('['),
        cut(|i| {
            let (i, inner) = delimited(multispace0, or_expr, multispace0)(i)?;
            let (i, _) = context("unterminated bracket", cut(char(']')))(i)?;
            Ok((i, inner))
        }),
    ))(rest)?;

    if selector.is_some() {
        if path.sub.is_some() {
            return Err(failure(input, "selector must follow the attribute name"));
        }
        let (rest, sub) = opt(preceded(char('.'), cut(attr_name)))(rest)?;
        Ok((
            rest,
            PatchPath {
                urn: path.urn,
                attr: path.attr,
                selector,
                sub: sub.map(str::to_lowercase),
            },
        ))
    } else {
        Ok((
            rest,
            PatchPath {
                urn: path.urn,
                attr: path.attr,
                selector: None,
                sub: path.sub,
            },
        ))
    }
}
