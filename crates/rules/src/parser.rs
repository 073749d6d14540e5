//! Hand-written recursive descent parser for the rule grammar.
//!
//! `nom` handles low-level token recognition; precedence is encoded in the
//! layering of the productions (`or` over `and` over `not` over atoms, so
//! `&&` binds tighter than `||`).

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    multi::separated_list1,
    sequence::delimited,
};

use crate::ast::{Matcher, RuleExpr};
use crate::error::RuleError;

/// Parse a complete rule string into a [`RuleExpr`].
///
/// Returns [`RuleError::Parse`] on malformed input or trailing tokens.
pub fn parse(input: &str) -> Result<RuleExpr, RuleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RuleError::Parse("empty rule".to_owned()));
    }
    let (rest, expr) =
        parse_or(input).map_err(|e| RuleError::Parse(format!("rule parse error: {e}")))?;
    let rest = rest.trim();
    if !rest.is_empty() {
        return Err(RuleError::Parse(format!(
            "unexpected trailing input: {rest:?}"
        )));
    }
    Ok(expr)
}

/// Consume optional whitespace around a parser.
fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// `or = and { "||" and }`
fn parse_or(input: &str) -> IResult<&str, RuleExpr> {
    let (input, first) = parse_and(input)?;
    let mut children = vec![first];
    let mut rest = input;
    loop {
        let Ok((after, _)) = ws(tag::<_, _, nom::error::Error<&str>>("||"))(rest) else {
            break;
        };
        let (after, next) = parse_and(after)?;
        children.push(next);
        rest = after;
    }
    if children.len() == 1 {
        Ok((rest, children.pop().unwrap_or(RuleExpr::And(Vec::new()))))
    } else {
        Ok((rest, RuleExpr::Or(children)))
    }
}

/// `and = not { "&&" not }`
fn parse_and(input: &str) -> IResult<&str, RuleExpr> {
    let (input, first) = parse_not(input)?;
    let mut children = vec![first];
    let mut rest = input;
    loop {
        let Ok((after, _)) = ws(tag::<_, _, nom::error::Error<&str>>("&&"))(rest) else {
            break;
        };
        let (after, next) = parse_not(after)?;
        children.push(next);
        rest = after;
    }
    if children.len() == 1 {
        Ok((rest, children.pop().unwrap_or(RuleExpr::And(Vec::new()))))
    } else {
        Ok((rest, RuleExpr::And(children)))
    }
}

/// `not = [ "!" ] atom`
fn parse_not(input: &str) -> IResult<&str, RuleExpr> {
    let (input, _) = multispace0(input)?;
    if let Ok((rest, _)) = char::<_, nom::error::Error<&str>>('!')(input) {
        let (rest, inner) = parse_atom(rest)?;
        return Ok((rest, RuleExpr::Not(Box::new(inner))));
    }
    parse_atom(input)
}

/// `atom = IDENT "(" ARG { "," ARG } ")" | "(" rule ")"`
fn parse_atom(input: &str) -> IResult<&str, RuleExpr> {
    let (input, _) = multispace0(input)?;
    alt((parse_group, parse_matcher))(input)
}

fn parse_group(input: &str) -> IResult<&str, RuleExpr> {
    delimited(ws(char('(')), parse_or, ws(char(')')))(input)
}

fn parse_matcher(input: &str) -> IResult<&str, RuleExpr> {
    let (input, name) = identifier(input)?;
    let (input, args) = delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), backtick_arg),
        ws(char(')')),
    )(input)?;
    Ok((
        input,
        RuleExpr::Matcher(Matcher {
            name: name.to_owned(),
            args,
        }),
    ))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    let (rest, first) = take_while1(|c: char| c.is_ascii_alphabetic())(input)?;
    let (rest, tail) = take_while(|c: char| c.is_ascii_alphanumeric())(rest)?;
    // Re-slice the original input to return one contiguous identifier.
    let len = first.len() + tail.len();
    Ok((rest, &input[..len]))
}

/// A backtick-quoted argument; backticks cannot be escaped, matching the
/// grammar (`any-char-except-backtick`).
fn backtick_arg(input: &str) -> IResult<&str, String> {
    let (input, arg) = delimited(char('`'), take_while(|c| c != '`'), char('`'))(input)?;
    Ok((input, arg.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(name: &str, args: &[&str]) -> RuleExpr {
        RuleExpr::Matcher(Matcher {
            name: name.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
        })
    }

    #[test]
    fn single_atom() {
        assert_eq!(
            parse("Host(`a.test`)").unwrap(),
            matcher("Host", &["a.test"])
        );
    }

    #[test]
    fn multiple_args() {
        assert_eq!(
            parse("Header(`X-Env`, `prod`)").unwrap(),
            matcher("Header", &["X-Env", "prod"])
        );
    }

    #[test]
    fn and_chain_folds() {
        let expr = parse("Host(`a`) && PathPrefix(`/x`) && Method(`GET`)").unwrap();
        let RuleExpr::And(children) = expr else {
            panic!("expected and")
        };
        assert_eq!(children.len(), 3);
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("Host(`a`) || Host(`b`) && PathPrefix(`/x`)").unwrap();
        let RuleExpr::Or(children) = expr else {
            panic!("expected or at the top")
        };
        assert_eq!(children[0], matcher("Host", &["a"]));
        assert!(matches!(children[1], RuleExpr::And(_)));
    }

    #[test]
    fn parens_override_precedence() {
        let expr = parse("(Host(`a`) || Host(`b`)) && PathPrefix(`/x`)").unwrap();
        let RuleExpr::And(children) = expr else {
            panic!("expected and at the top")
        };
        assert!(matches!(children[0], RuleExpr::Or(_)));
    }

    #[test]
    fn negation() {
        let expr = parse("!Path(`/internal`)").unwrap();
        assert!(matches!(expr, RuleExpr::Not(_)));
    }

    #[test]
    fn negated_group() {
        let expr = parse("!(Host(`a`) || Host(`b`)) && Method(`GET`)").unwrap();
        let RuleExpr::And(children) = expr else {
            panic!("expected and")
        };
        assert!(matches!(&children[0], RuleExpr::Not(inner) if matches!(**inner, RuleExpr::Or(_))));
    }

    #[test]
    fn whitespace_tolerated() {
        assert!(parse("  Host( `a.test` )  &&  Path( `/` )  ").is_ok());
    }

    #[test]
    fn arg_with_special_chars() {
        assert_eq!(
            parse("PathRegexp(`^/api/(v1|v2)/`)").unwrap(),
            matcher("PathRegexp", &["^/api/(v1|v2)/"])
        );
    }

    #[test]
    fn empty_rule_rejected() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse("Host(`a`) extra").is_err());
    }

    #[test]
    fn missing_backticks_rejected() {
        assert!(parse("Host(a.test)").is_err());
    }

    #[test]
    fn unbalanced_parens_rejected() {
        assert!(parse("(Host(`a`)").is_err());
        assert!(parse("Host(`a`))").is_err());
    }

    #[test]
    fn bare_operator_rejected() {
        assert!(parse("&& Host(`a`)").is_err());
        assert!(parse("Host(`a`) &&").is_err());
    }
}
