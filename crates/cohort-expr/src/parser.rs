//! Composition expression parser implementation using nom.
//!
//! Grammar (standard precedence, left-associative within a level):
//!
//! ```text
//! expr    := orExpr
//! orExpr  := andExpr ( "OR" andExpr )*
//! andExpr := notExpr ( "AND" notExpr )*
//! notExpr := "NOT" notExpr | atom
//! atom    := IDENT | "(" expr ")"
//! ```
//!
//! Keywords are case-insensitive and must not run into an identifier
//! (`ANDROID` is a search name, not `AND` followed by `ROID`).

use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, multispace0, satisfy},
    combinator::{all_consuming, map, not, verify},
    error::ErrorKind,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

use crate::ast::CompositionExpression;
use crate::error::{ExprError, ExprResult};

const RESERVED: [&str; 3] = ["AND", "OR", "NOT"];

/// Deepest operator nesting [`parse`] accepts. Parentheses, `NOT` and each
/// join of an `AND`/`OR` chain count one level.
pub const MAX_NESTING: usize = 256;

/// Parse a composition expression string.
///
/// # Examples
///
/// ```rust
/// use cohort_expr::{parse, CompositionExpression};
///
/// let expr = parse("onArt AND NOT pregnant").unwrap();
/// assert_eq!(
///     expr,
///     CompositionExpression::and(
///         CompositionExpression::search("onArt"),
///         CompositionExpression::not(CompositionExpression::search("pregnant")),
///     )
/// );
///
/// // Grouping
/// let expr = parse("(a OR b) AND c").unwrap();
/// assert_eq!(expr.to_string(), "(a OR b) AND c");
/// ```
pub fn parse(input: &str) -> ExprResult<CompositionExpression> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ExprError::EmptyExpression);
    }

    match all_consuming(expression)(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Failure(e)) if e.code == ErrorKind::TooLarge => Err(ExprError::ParseError {
            position: input.len() - e.input.len(),
            message: format!("expression nests deeper than {} levels", MAX_NESTING),
        }),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let position = input.len() - e.input.len();
            Err(ExprError::ParseError {
                position,
                message: describe_remaining(e.input),
            })
        }
        Err(nom::Err::Incomplete(_)) => Err(ExprError::Incomplete("expression".to_string())),
    }
}

impl FromStr for CompositionExpression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

fn describe_remaining(rest: &str) -> String {
    let rest = rest.trim_start();
    if rest.is_empty() {
        return "unexpected end of input".to_string();
    }
    let snippet: String = rest.chars().take(20).collect();
    format!("unexpected input at: '{}'", snippet)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

// ============================================================================
// Operators
// ============================================================================

fn expression(input: &str) -> IResult<&str, CompositionExpression> {
    delimited(multispace0, |i| or_expr(i, 0), multispace0)(input)
}

fn too_deep(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(input, ErrorKind::TooLarge))
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    delimited(
        multispace0,
        terminated(tag_no_case(word), not(satisfy(is_ident_char))),
        multispace0,
    )
}

// Every production takes the depth of the node it builds. Each join in an
// AND/OR chain deepens the left spine by one.

fn or_expr(input: &str, depth: usize) -> IResult<&str, CompositionExpression> {
    let (mut input, mut expr) = and_expr(input, depth)?;
    let mut depth = depth;
    loop {
        match preceded(keyword("OR"), move |i| and_expr(i, depth + 1))(input) {
            Ok((rest, right)) => {
                expr = CompositionExpression::or(expr, right);
                input = rest;
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(too_deep(input));
                }
            }
            Err(nom::Err::Error(_)) => return Ok((input, expr)),
            Err(e) => return Err(e),
        }
    }
}

fn and_expr(input: &str, depth: usize) -> IResult<&str, CompositionExpression> {
    let (mut input, mut expr) = not_expr(input, depth)?;
    let mut depth = depth;
    loop {
        match preceded(keyword("AND"), move |i| not_expr(i, depth + 1))(input) {
            Ok((rest, right)) => {
                expr = CompositionExpression::and(expr, right);
                input = rest;
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(too_deep(input));
                }
            }
            Err(nom::Err::Error(_)) => return Ok((input, expr)),
            Err(e) => return Err(e),
        }
    }
}

fn not_expr(input: &str, depth: usize) -> IResult<&str, CompositionExpression> {
    if depth > MAX_NESTING {
        return Err(too_deep(input));
    }
    match keyword("NOT")(input) {
        Ok((rest, _)) => map(move |i| not_expr(i, depth + 1), CompositionExpression::not)(rest),
        Err(nom::Err::Error(_)) => atom(input, depth),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Atoms
// ============================================================================

fn atom(input: &str, depth: usize) -> IResult<&str, CompositionExpression> {
    alt((
        delimited(
            pair(char('('), multispace0),
            move |i| or_expr(i, depth + 1),
            pair(multispace0, char(')')),
        ),
        search_reference,
    ))(input)
}

fn search_reference(input: &str) -> IResult<&str, CompositionExpression> {
    map(
        verify(take_while1(is_ident_char), |name: &str| !is_reserved(name)),
        CompositionExpression::search,
    )(input)
}
