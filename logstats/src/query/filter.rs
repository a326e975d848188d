//! Per-function `if (...)` predicate
//!
//! The stats pipe only needs one thing from a filter: given a block,
//! produce a bitmap of matching rows. The accepted syntax is a small
//! conjunction/disjunction language over exact field matches:
//!
//!   `status:=200`, `level:error`, `not host:web-1`, `a:1 or b:2`, `*`
//!
//! Adjacent terms combine with an implicit `and`. A filter referencing a
//! column the block does not carry matches rows whose (empty) value
//! equals the needle, i.e. usually nothing.

use std::fmt;

use crate::data::{Bitmap, Block};
use crate::query::lexer::{quote_token_if_needed, Lexer};
use crate::StatsError;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// `*` — every row matches.
    MatchAll,
    /// `field:value` — the row's value for `field` equals `value`.
    Phrase { field: String, value: String },
    /// `field:=value` — exact match, kept distinct for the display form.
    Exact { field: String, value: String },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Evaluate against a block, producing one bit per row.
    pub fn eval(&self, br: &Block) -> Bitmap {
        let rows = br.row_count();
        let mut bm = Bitmap::new();
        bm.init(rows);
        match self {
            FilterExpr::MatchAll => bm.set_all(),
            FilterExpr::Phrase { field, value } | FilterExpr::Exact { field, value } => {
                let c = br.get_column(field);
                if c.is_const() {
                    if c.const_value() == value {
                        bm.set_all();
                    }
                    return bm;
                }
                let mut buf = String::new();
                for row in 0..rows {
                    if c.value_into(row, &mut buf) == value {
                        bm.set(row, true);
                    }
                }
            }
            FilterExpr::And(parts) => {
                bm.set_all();
                for p in parts {
                    bm.and(&p.eval(br));
                    if !bm.any_set() {
                        break;
                    }
                }
            }
            FilterExpr::Or(parts) => {
                for p in parts {
                    bm.or(&p.eval(br));
                    if bm.all_set() {
                        break;
                    }
                }
            }
            FilterExpr::Not(inner) => {
                bm = inner.eval(br);
                bm.not();
            }
        }
        bm
    }

    /// Collect every field name the filter reads.
    pub fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            FilterExpr::MatchAll => {}
            FilterExpr::Phrase { field, .. } | FilterExpr::Exact { field, .. } => {
                out.push(field.clone());
            }
            FilterExpr::And(parts) | FilterExpr::Or(parts) => {
                for p in parts {
                    p.collect_fields(out);
                }
            }
            FilterExpr::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Parse a parenthesized filter: the lexer must be positioned at `(`.
    pub fn parse_parens(lex: &mut Lexer) -> crate::Result<FilterExpr> {
        if !lex.is_keyword("(") {
            return Err(StatsError::QueryParse(format!(
                "missing '(' at the filter start; got {:?}",
                lex.token
            )));
        }
        lex.next_token();
        let f = Self::parse_or(lex)?;
        if !lex.is_keyword(")") {
            return Err(StatsError::QueryParse(format!(
                "missing ')' at the filter end; got {:?}",
                lex.token
            )));
        }
        lex.next_token();
        Ok(f)
    }

    fn parse_or(lex: &mut Lexer) -> crate::Result<FilterExpr> {
        let mut parts = vec![Self::parse_and(lex)?];
        while lex.is_keyword("or") {
            lex.next_token();
            parts.push(Self::parse_and(lex)?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().unwrap_or(FilterExpr::MatchAll))
        } else {
            Ok(FilterExpr::Or(parts))
        }
    }

    fn parse_and(lex: &mut Lexer) -> crate::Result<FilterExpr> {
        let mut parts = vec![Self::parse_term(lex)?];
        loop {
            if lex.is_end() || lex.is_any_keyword(&[")", "or"]) {
                break;
            }
            if lex.is_keyword("and") {
                lex.next_token();
                continue;
            }
            parts.push(Self::parse_term(lex)?);
        }
        if parts.len() == 1 {
            Ok(parts.pop().unwrap_or(FilterExpr::MatchAll))
        } else {
            Ok(FilterExpr::And(parts))
        }
    }

    fn parse_term(lex: &mut Lexer) -> crate::Result<FilterExpr> {
        if lex.is_keyword("not") {
            lex.next_token();
            let inner = Self::parse_term(lex)?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        if lex.is_keyword("(") {
            return Self::parse_parens(lex);
        }
        if lex.is_keyword("*") {
            lex.next_token();
            return Ok(FilterExpr::MatchAll);
        }
        if lex.is_end() {
            return Err(StatsError::QueryParse("missing filter expression".to_string()));
        }
        if lex.is_any_keyword(&[")", ",", ":", "|", "="]) {
            return Err(StatsError::QueryParse(format!(
                "unexpected token {:?} in filter",
                lex.token
            )));
        }

        let field = crate::query::canonical_field_name(&lex.token);
        lex.next_token();
        if !lex.is_keyword(":") {
            return Err(StatsError::QueryParse(format!(
                "missing ':' after filter field {field:?}; got {:?}",
                lex.token
            )));
        }
        lex.next_token();
        let exact = lex.is_keyword("=");
        if exact {
            lex.next_token();
        }
        if lex.is_end() || (!lex.token_quoted && lex.is_any_keyword(&[")", ",", "("])) {
            return Err(StatsError::QueryParse(format!(
                "missing filter value for field {field:?}"
            )));
        }
        let value = lex.token.clone();
        lex.next_token();
        if exact {
            Ok(FilterExpr::Exact { field, value })
        } else {
            Ok(FilterExpr::Phrase { field, value })
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::MatchAll => write!(f, "*"),
            FilterExpr::Phrase { field, value } => write!(
                f,
                "{}:{}",
                quote_token_if_needed(field),
                quote_token_if_needed(value)
            ),
            FilterExpr::Exact { field, value } => write!(
                f,
                "{}:={}",
                quote_token_if_needed(field),
                quote_token_if_needed(value)
            ),
            FilterExpr::And(parts) => {
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
            FilterExpr::Or(parts) => {
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
            FilterExpr::Not(inner) => match **inner {
                FilterExpr::And(_) | FilterExpr::Or(_) => write!(f, "not ({inner})"),
                _ => write!(f, "not {inner}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;

    fn parse(s: &str) -> FilterExpr {
        let mut lex = Lexer::new(s);
        let f = FilterExpr::parse_parens(&mut lex).unwrap();
        assert!(lex.is_end());
        f
    }

    fn test_block() -> Block {
        Block::new(
            4,
            vec![
                Column::new_str(
                    "status",
                    vec!["200".into(), "500".into(), "200".into(), "404".into()],
                ),
                Column::new_str(
                    "host",
                    vec!["a".into(), "a".into(), "b".into(), "b".into()],
                ),
            ],
        )
    }

    fn ones(bm: &Bitmap) -> Vec<usize> {
        (0..bm.len()).filter(|&i| bm.get(i)).collect()
    }

    #[test]
    fn test_filter_exact() {
        let f = parse("(status:=200)");
        assert_eq!(
            f,
            FilterExpr::Exact {
                field: "status".into(),
                value: "200".into()
            }
        );
        assert_eq!(ones(&f.eval(&test_block())), vec![0, 2]);
    }

    #[test]
    fn test_filter_phrase_and() {
        let f = parse("(status:200 host:b)");
        assert_eq!(ones(&f.eval(&test_block())), vec![2]);
    }

    #[test]
    fn test_filter_or_not() {
        let f = parse("(status:=500 or status:=404)");
        assert_eq!(ones(&f.eval(&test_block())), vec![1, 3]);

        let f = parse("(not status:=200)");
        assert_eq!(ones(&f.eval(&test_block())), vec![1, 3]);
    }

    #[test]
    fn test_filter_match_all() {
        let f = parse("(*)");
        assert_eq!(f.eval(&test_block()).count_ones(), 4);
    }

    #[test]
    fn test_filter_missing_column() {
        let f = parse("(nosuch:=x)");
        assert_eq!(f.eval(&test_block()).count_ones(), 0);
    }

    #[test]
    fn test_filter_const_column() {
        let br = Block::new(3, vec![Column::new_const("env", "prod")]);
        let f = parse("(env:=prod)");
        assert_eq!(f.eval(&br).count_ones(), 3);
        let f = parse("(env:=dev)");
        assert_eq!(f.eval(&br).count_ones(), 0);
    }

    #[test]
    fn test_filter_display_roundtrip() {
        for s in ["status:=200", "status:200 host:b", "a:=1 or b:=2", "not a:=1", "*"] {
            let src = format!("({s})");
            let mut lex = Lexer::new(&src);
            let f = FilterExpr::parse_parens(&mut lex).unwrap();
            assert_eq!(f.to_string(), s);
        }
    }

    #[test]
    fn test_filter_parse_errors() {
        for s in ["(status=200)", "(status:)", "(status", "()"] {
            let mut lex = Lexer::new(s);
            assert!(FilterExpr::parse_parens(&mut lex).is_err(), "{s}");
        }
    }
}
