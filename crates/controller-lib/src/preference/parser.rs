//! Tokenizer and grammar for a single preference annotation value
//!
//! ```text
//! value   := token (WS token)*
//! token   := adjust | matcher
//! adjust  := "adjust=" [+-]? DIGITS ("." DIGITS)? "%"
//! matcher := KEY op VALUE ("," VALUE)*
//! op      := "!=" | ">" | "<" | "="          (">=" and "<=" are rejected)
//! ```

use super::{Adjustment, LabelMatcher, MatchOperator, ParseError, Preference, ALLOWED_KEYS};

const ADJUST_KEY: &str = "adjust";
const OPERATOR_CHARS: [char; 4] = ['!', '>', '<', '='];

/// One lexed token: the key, the classified operator, and the raw right-hand side
#[derive(Debug, PartialEq, Eq)]
struct Token<'a> {
    key: &'a str,
    operator: MatchOperator,
    rhs: &'a str,
}

/// Split a token at its operator.
///
/// The operator starts at the first operator character, and the two-character
/// forms are classified before the one-character forms, so `!=` can never be
/// read as `=` and `>=` can never be read as `>`.
fn lex(token: &str) -> Result<Token<'_>, ParseError> {
    let idx = token
        .find(OPERATOR_CHARS)
        .ok_or_else(|| ParseError::MalformedToken(token.to_string()))?;
    let (key, rest) = token.split_at(idx);
    if key.is_empty() {
        return Err(ParseError::MalformedToken(token.to_string()));
    }

    let (operator, width) = if rest.starts_with("!=") {
        (MatchOperator::NotIn, 2)
    } else if rest.starts_with(">=") || rest.starts_with("<=") {
        return Err(ParseError::UnsupportedOperator {
            token: token.to_string(),
            operator: rest[..2].to_string(),
        });
    } else if rest.starts_with('>') {
        (MatchOperator::Gt, 1)
    } else if rest.starts_with('<') {
        (MatchOperator::Lt, 1)
    } else if rest.starts_with('=') {
        (MatchOperator::In, 1)
    } else {
        // A lone '!'
        return Err(ParseError::MalformedToken(token.to_string()));
    };

    Ok(Token {
        key,
        operator,
        rhs: &rest[width..],
    })
}

fn parse_matcher(token: &str, lexed: Token<'_>) -> Result<LabelMatcher, ParseError> {
    if !ALLOWED_KEYS.contains(&lexed.key) {
        return Err(ParseError::UnknownKey(lexed.key.to_string()));
    }

    let values: Vec<String> = lexed.rhs.split(',').map(str::to_string).collect();
    if values.iter().any(|v| v.is_empty()) {
        return Err(ParseError::EmptyValue(token.to_string()));
    }

    if matches!(lexed.operator, MatchOperator::Gt | MatchOperator::Lt) {
        if values.len() != 1 {
            return Err(ParseError::WrongValueCount {
                key: lexed.key.to_string(),
                operator: lexed.operator,
                count: values.len(),
            });
        }
        if values[0].parse::<i64>().is_err() {
            return Err(ParseError::NonNumericValue {
                key: lexed.key.to_string(),
                value: values[0].clone(),
            });
        }
    }

    Ok(LabelMatcher {
        key: lexed.key.to_string(),
        operator: lexed.operator,
        values,
    })
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse the right-hand side of `adjust=`, e.g. `+40%`, `0%`, `-12.5%`
pub(super) fn parse_adjustment(raw: &str) -> Result<Adjustment, ParseError> {
    let malformed = || ParseError::MalformedAdjustment(raw.to_string());

    let body = raw.strip_suffix('%').ok_or_else(malformed)?;
    let (negative, magnitude) = match body.as_bytes().first() {
        Some(b'+') => (false, &body[1..]),
        Some(b'-') => (true, &body[1..]),
        _ => (false, body),
    };

    let well_formed = match magnitude.split_once('.') {
        Some((int, frac)) => is_digits(int) && is_digits(frac),
        None => is_digits(magnitude),
    };
    if !well_formed {
        return Err(malformed());
    }

    let value: f64 = magnitude.parse().map_err(|_| malformed())?;
    Ok(Adjustment::new(if negative { -value } else { value }))
}

/// Parse one annotation value into a preference
pub fn parse_preference(nodepool: &str, number: u32, value: &str) -> Result<Preference, ParseError> {
    let mut matchers = Vec::new();
    let mut adjustment = None;

    for token in value.split_whitespace() {
        let lexed = lex(token)?;

        if lexed.key == ADJUST_KEY {
            if lexed.operator != MatchOperator::In {
                return Err(ParseError::MalformedAdjustment(token.to_string()));
            }
            if adjustment.is_some() {
                return Err(ParseError::DuplicateAdjustment);
            }
            adjustment = Some(parse_adjustment(lexed.rhs)?);
            continue;
        }

        matchers.push(parse_matcher(token, lexed)?);
    }

    if value.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let adjustment = adjustment.ok_or(ParseError::MissingAdjustment)?;
    if matchers.is_empty() {
        return Err(ParseError::NoMatchers);
    }

    Ok(Preference {
        number,
        nodepool: nodepool.to_string(),
        matchers,
        adjustment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAMILY: &str = "karpenter.k8s.aws/instance-family";
    const CPU: &str = "karpenter.k8s.aws/instance-cpu";

    fn parse(value: &str) -> Result<Preference, ParseError> {
        parse_preference("default", 1, value)
    }

    #[test]
    fn test_lex_precedence() {
        assert_eq!(lex("k!=a").unwrap().operator, MatchOperator::NotIn);
        assert_eq!(lex("k>4").unwrap().operator, MatchOperator::Gt);
        assert_eq!(lex("k<4").unwrap().operator, MatchOperator::Lt);
        assert_eq!(lex("k=a").unwrap().operator, MatchOperator::In);
        assert!(matches!(
            lex("k>=4"),
            Err(ParseError::UnsupportedOperator { .. })
        ));
        assert!(matches!(
            lex("k<=4"),
            Err(ParseError::UnsupportedOperator { .. })
        ));
        assert!(matches!(lex("k!a"), Err(ParseError::MalformedToken(_))));
        assert!(matches!(lex("=a"), Err(ParseError::MalformedToken(_))));
        assert!(matches!(lex("novalue"), Err(ParseError::MalformedToken(_))));
    }

    #[test]
    fn test_negated_membership_with_two_values() {
        let pref = parse(&format!("{}!=a,b adjust=-5%", FAMILY)).unwrap();
        assert_eq!(pref.matchers.len(), 1);
        assert_eq!(pref.matchers[0].operator, MatchOperator::NotIn);
        assert_eq!(pref.matchers[0].values, vec!["a", "b"]);
    }

    #[test]
    fn test_greater_than() {
        let pref = parse(&format!("{}>4 adjust=+10%", CPU)).unwrap();
        assert_eq!(pref.matchers[0].operator, MatchOperator::Gt);
        assert_eq!(pref.matchers[0].values, vec!["4"]);
    }

    #[test]
    fn test_greater_equal_rejected() {
        let err = parse(&format!("{}>=4 adjust=+10%", CPU)).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedOperator { .. }));
    }

    #[test]
    fn test_non_numeric_comparison_rejected() {
        let err = parse(&format!("{}>big adjust=+10%", CPU)).unwrap_err();
        assert!(matches!(err, ParseError::NonNumericValue { .. }));
        let err = parse(&format!("{}<4,8 adjust=+10%", CPU)).unwrap_err();
        assert!(matches!(err, ParseError::WrongValueCount { count: 2, .. }));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse("karpenter.k8s.aws/instance-famliy=m5 adjust=-10%").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownKey("karpenter.k8s.aws/instance-famliy".to_string())
        );
    }

    #[test]
    fn test_adjustment_required_exactly_once() {
        assert_eq!(
            parse(&format!("{}=m5", FAMILY)).unwrap_err(),
            ParseError::MissingAdjustment
        );
        assert_eq!(
            parse(&format!("{}=m5 adjust=1% adjust=2%", FAMILY)).unwrap_err(),
            ParseError::DuplicateAdjustment
        );
    }

    #[test]
    fn test_matcher_required() {
        assert_eq!(parse("adjust=-10%").unwrap_err(), ParseError::NoMatchers);
        assert_eq!(parse("   ").unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn test_adjustment_formats() {
        for bad in ["10", "+%", "1.%", ".5%", "abc%", "+-1%", "1,5%"] {
            assert!(parse_adjustment(bad).is_err(), "{} should be rejected", bad);
        }
        assert_eq!(parse_adjustment("+40%").unwrap().render(), "+40%");
        assert_eq!(parse_adjustment("40%").unwrap().render(), "+40%");
        assert_eq!(parse_adjustment("0%").unwrap().render(), "0%");
        assert_eq!(parse_adjustment("-0%").unwrap().render(), "0%");
        assert_eq!(parse_adjustment("-12.5%").unwrap().render(), "-12.5%");
    }

    #[test]
    fn test_multiple_matchers_keep_order() {
        let pref = parse(&format!(
            "{}=m7i,m7a kubernetes.io/arch=amd64 {}<32 adjust=-20%",
            FAMILY, CPU
        ))
        .unwrap();
        let keys: Vec<&str> = pref.matchers.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec![FAMILY, "kubernetes.io/arch", CPU]);
        assert_eq!(pref.adjustment.render(), "-20%");
    }

    #[test]
    fn test_empty_value_rejected() {
        let err = parse(&format!("{}=m5, adjust=-1%", FAMILY)).unwrap_err();
        assert!(matches!(err, ParseError::EmptyValue(_)));
    }
}
