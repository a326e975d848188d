//! The `| stats ...` pipe: AST, parser and processor
//!
//! Accepted form:
//!
//!   stats [by (F1[:bucket[ offset off]], F2, ...)]
//!         func1(...) [if (filter)] [as name1], func2(...) [as name2], ...
//!
//! `parse` builds a [`StatsPipe`]; `StatsPipe::new_pipe_processor` turns
//! it into the running pipe stage.

pub mod accum;
pub mod bucket;
mod flush;
pub mod group_map;
pub mod processor;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use crate::data::values::{format_f64, try_parse_f64};
use crate::pipe::{CancelToken, PipeProcessor};
use crate::query::{canonical_field_name, quote_token_if_needed, FilterExpr, Lexer};
use crate::{Result, StatsError};

pub use processor::StatsProcessor;

/// One grouping field from the `by (...)` clause, with its optional
/// bucket configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ByField {
    pub name: String,
    pub bucket_size_str: String,
    pub bucket_size: f64,
    pub bucket_offset_str: String,
    pub bucket_offset: f64,
}

impl ByField {
    pub fn has_bucket_config(&self) -> bool {
        !self.bucket_size_str.is_empty() || !self.bucket_offset_str.is_empty()
    }
}

impl fmt::Display for ByField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote_token_if_needed(&self.name))?;
        if !self.bucket_size_str.is_empty() {
            write!(f, ":{}", self.bucket_size_str)?;
            if !self.bucket_offset_str.is_empty() {
                write!(f, " offset {}", self.bucket_offset_str)?;
            }
        }
        Ok(())
    }
}

/// A stats function with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsFunc {
    Count { fields: Vec<String> },
    CountEmpty { fields: Vec<String> },
    CountUniq { fields: Vec<String> },
    CountUniqHash { fields: Vec<String> },
    Sum { fields: Vec<String> },
    SumLen { fields: Vec<String> },
    Avg { fields: Vec<String> },
    Min { fields: Vec<String> },
    Max { fields: Vec<String> },
    Median { fields: Vec<String> },
    Quantile { phi: f64, fields: Vec<String> },
    UniqValues { fields: Vec<String> },
    Values { fields: Vec<String> },
    Rate,
    RateSum { fields: Vec<String> },
    RowAny,
    RowMin { field: String },
    RowMax { field: String },
}

impl fmt::Display for StatsFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsFunc::Count { fields } => write!(f, "count({})", fields_str(fields)),
            StatsFunc::CountEmpty { fields } => write!(f, "count_empty({})", fields_str(fields)),
            StatsFunc::CountUniq { fields } => write!(f, "count_uniq({})", fields_str(fields)),
            StatsFunc::CountUniqHash { fields } => {
                write!(f, "count_uniq_hash({})", fields_str(fields))
            }
            StatsFunc::Sum { fields } => write!(f, "sum({})", fields_str(fields)),
            StatsFunc::SumLen { fields } => write!(f, "sum_len({})", fields_str(fields)),
            StatsFunc::Avg { fields } => write!(f, "avg({})", fields_str(fields)),
            StatsFunc::Min { fields } => write!(f, "min({})", fields_str(fields)),
            StatsFunc::Max { fields } => write!(f, "max({})", fields_str(fields)),
            StatsFunc::Median { fields } => write!(f, "median({})", fields_str(fields)),
            StatsFunc::Quantile { phi, fields } => {
                write!(f, "quantile({}", format_f64(*phi))?;
                let rest = fields_str(fields);
                if !rest.is_empty() {
                    write!(f, ", {rest}")?;
                }
                write!(f, ")")
            }
            StatsFunc::UniqValues { fields } => write!(f, "uniq_values({})", fields_str(fields)),
            StatsFunc::Values { fields } => write!(f, "values({})", fields_str(fields)),
            StatsFunc::Rate => write!(f, "rate()"),
            StatsFunc::RateSum { fields } => write!(f, "rate_sum({})", fields_str(fields)),
            StatsFunc::RowAny => write!(f, "row_any()"),
            StatsFunc::RowMin { field } => {
                write!(f, "row_min({})", quote_token_if_needed(field))
            }
            StatsFunc::RowMax { field } => {
                write!(f, "row_max({})", quote_token_if_needed(field))
            }
        }
    }
}

fn fields_str(fields: &[String]) -> String {
    let parts: Vec<String> = fields
        .iter()
        .map(|f| {
            if f == "*" {
                f.clone()
            } else {
                quote_token_if_needed(f)
            }
        })
        .collect();
    parts.join(", ")
}

/// One stats function slot: the function, its optional `if` predicate and
/// the output column name.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSpec {
    pub func: StatsFunc,
    pub iff: Option<FilterExpr>,
    pub result_name: String,
}

impl fmt::Display for FuncSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.func)?;
        if let Some(iff) = &self.iff {
            write!(f, " if ({iff})")?;
        }
        write!(f, " as {}", quote_token_if_needed(&self.result_name))
    }
}

/// Parsed `| stats ...` pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsPipe {
    pub by_fields: Vec<ByField>,
    pub funcs: Vec<FuncSpec>,
    /// Window length in seconds for `rate`/`rate_sum`; injected by the
    /// caller, 0 means unset.
    pub step_seconds: f64,
}

impl StatsPipe {
    /// Parse the textual form. The whole input must be consumed.
    pub fn parse(s: &str) -> Result<StatsPipe> {
        let mut lex = Lexer::new(s);
        let pipe = Self::parse_from_lexer(&mut lex)?;
        if !lex.is_end() {
            return Err(StatsError::QueryParse(format!(
                "unexpected token {:?} after stats pipe",
                lex.token
            )));
        }
        Ok(pipe)
    }

    fn parse_from_lexer(lex: &mut Lexer) -> Result<StatsPipe> {
        if !lex.is_keyword("stats") {
            return Err(StatsError::QueryParse(format!(
                "expecting 'stats'; got {:?}",
                lex.token
            )));
        }
        lex.next_token();

        let mut by_fields = Vec::new();
        if lex.is_keyword("by") {
            lex.next_token();
            by_fields = if lex.is_keyword("(") {
                parse_by_fields_parens(lex)?
            } else {
                parse_by_fields_bare(lex)?
            };
        }

        let mut funcs: Vec<FuncSpec> = Vec::new();
        loop {
            let spec = parse_func_spec(lex)?;
            if funcs.iter().any(|s| s.result_name == spec.result_name) {
                return Err(StatsError::QueryParse(format!(
                    "duplicate result name {:?}",
                    spec.result_name
                )));
            }
            if by_fields.iter().any(|bf| bf.name == spec.result_name) {
                return Err(StatsError::QueryParse(format!(
                    "result name {:?} collides with a 'by' field",
                    spec.result_name
                )));
            }
            funcs.push(spec);
            if lex.is_end() {
                break;
            }
            if !lex.is_keyword(",") {
                return Err(StatsError::QueryParse(format!(
                    "unexpected token {:?}; want ',' or end of the stats pipe",
                    lex.token
                )));
            }
            lex.next_token();
        }

        Ok(StatsPipe {
            by_fields,
            funcs,
            step_seconds: 0.0,
        })
    }

    /// Inject the window length used by `rate` and `rate_sum`.
    pub fn set_step_seconds(&mut self, step_seconds: f64) {
        self.step_seconds = step_seconds;
    }

    /// The union of fields the pipe reads: by-fields, function inputs and
    /// `if` predicate inputs. `*` stands for every field.
    pub fn needed_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for bf in &self.by_fields {
            out.push(bf.name.clone());
        }
        for spec in &self.funcs {
            match &spec.func {
                // `count(*)` needs no columns at all; it only counts rows.
                StatsFunc::Count { fields } => {
                    if !fields.iter().any(|f| f == "*") {
                        out.extend(fields.iter().cloned());
                    }
                }
                StatsFunc::CountEmpty { fields }
                | StatsFunc::CountUniq { fields }
                | StatsFunc::CountUniqHash { fields }
                | StatsFunc::Sum { fields }
                | StatsFunc::SumLen { fields }
                | StatsFunc::Avg { fields }
                | StatsFunc::Min { fields }
                | StatsFunc::Max { fields }
                | StatsFunc::Median { fields }
                | StatsFunc::Quantile { fields, .. }
                | StatsFunc::UniqValues { fields }
                | StatsFunc::Values { fields }
                | StatsFunc::RateSum { fields } => out.extend(fields.iter().cloned()),
                StatsFunc::Rate => {}
                StatsFunc::RowAny => out.push("*".to_string()),
                StatsFunc::RowMin { field } | StatsFunc::RowMax { field } => {
                    out.push(field.clone());
                    out.push("*".to_string());
                }
            }
            if let Some(iff) = &spec.iff {
                iff.collect_fields(&mut out);
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Build the running pipe stage. `allowed_memory` is the process
    /// memory ceiling this query may assume; the stats state budget is
    /// 30% of it.
    pub fn new_pipe_processor(
        self: Arc<Self>,
        workers_count: usize,
        allowed_memory: usize,
        cancel: Arc<CancelToken>,
        next: Arc<dyn PipeProcessor>,
    ) -> StatsProcessor {
        StatsProcessor::new(self, workers_count, allowed_memory, cancel, next)
    }
}

impl fmt::Display for StatsPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stats ")?;
        if !self.by_fields.is_empty() {
            write!(f, "by (")?;
            for (i, bf) in self.by_fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{bf}")?;
            }
            write!(f, ") ")?;
        }
        for (i, spec) in self.funcs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{spec}")?;
        }
        Ok(())
    }
}

fn parse_by_fields_parens(lex: &mut Lexer) -> Result<Vec<ByField>> {
    lex.next_token();
    let mut bfs = Vec::new();
    loop {
        if lex.is_keyword(")") {
            lex.next_token();
            return Ok(bfs);
        }
        bfs.push(parse_by_field(lex)?);
        if lex.is_keyword(",") {
            lex.next_token();
            continue;
        }
        if lex.is_keyword(")") {
            lex.next_token();
            return Ok(bfs);
        }
        return Err(StatsError::QueryParse(format!(
            "unexpected token {:?} in 'by' clause; want ',' or ')'",
            lex.token
        )));
    }
}

fn parse_by_fields_bare(lex: &mut Lexer) -> Result<Vec<ByField>> {
    let mut bfs = Vec::new();
    loop {
        bfs.push(parse_by_field(lex)?);
        if lex.is_keyword(",") {
            lex.next_token();
            continue;
        }
        return Ok(bfs);
    }
}

fn parse_by_field(lex: &mut Lexer) -> Result<ByField> {
    let name = parse_field_name(lex)?;
    let mut bf = ByField {
        name,
        bucket_size_str: String::new(),
        bucket_size: 0.0,
        bucket_offset_str: String::new(),
        bucket_offset: 0.0,
    };
    if !lex.is_keyword(":") {
        return Ok(bf);
    }
    lex.next_token();
    let size_str = lex.token.clone();
    if size_str.is_empty() {
        return Err(StatsError::QueryParse(format!(
            "missing bucket size for field {:?}",
            bf.name
        )));
    }
    lex.next_token();
    if size_str != "year" && size_str != "month" {
        let Some(size) = bucket::try_parse_bucket_size(&size_str) else {
            return Err(StatsError::QueryParse(format!(
                "cannot parse bucket size for field {:?}: {size_str:?}",
                bf.name
            )));
        };
        bf.bucket_size = size;
    }
    bf.bucket_size_str = size_str;

    if lex.is_keyword("offset") {
        lex.next_token();
        let offset_str = lex.token.clone();
        lex.next_token();
        let Some(offset) = bucket::try_parse_bucket_offset(&offset_str) else {
            return Err(StatsError::QueryParse(format!(
                "cannot parse bucket offset for field {:?}: {offset_str:?}",
                bf.name
            )));
        };
        bf.bucket_offset_str = offset_str;
        bf.bucket_offset = offset;
    }
    Ok(bf)
}

fn parse_field_name(lex: &mut Lexer) -> Result<String> {
    if lex.is_end() || (!lex.token_quoted && lex.is_any_keyword(&[",", "(", ")", "|", ":", "="])) {
        return Err(StatsError::QueryParse(format!(
            "unexpected token {:?}; want a field name",
            lex.token
        )));
    }
    let name = canonical_field_name(&lex.token);
    lex.next_token();
    Ok(name)
}

/// Parse `(f1, f2, ...)`; empty parens or a `*` argument select all
/// fields.
fn parse_field_names_in_parens(lex: &mut Lexer, func_name: &str) -> Result<Vec<String>> {
    let raw = parse_tokens_in_parens(lex, func_name)?;
    let mut fields: Vec<String> = raw
        .iter()
        .map(|t| {
            if t == "*" {
                t.clone()
            } else {
                canonical_field_name(t)
            }
        })
        .collect();
    if fields.is_empty() || fields.iter().any(|f| f == "*") {
        fields = vec!["*".to_string()];
    }
    Ok(fields)
}

fn parse_tokens_in_parens(lex: &mut Lexer, func_name: &str) -> Result<Vec<String>> {
    if !lex.is_keyword("(") {
        return Err(StatsError::QueryParse(format!(
            "missing '(' after {func_name:?}"
        )));
    }
    lex.next_token();
    let mut tokens = Vec::new();
    loop {
        if lex.is_keyword(")") {
            lex.next_token();
            return Ok(tokens);
        }
        if lex.is_end() {
            return Err(StatsError::QueryParse(format!(
                "missing ')' in {func_name:?} args"
            )));
        }
        if lex.is_keyword(",") {
            return Err(StatsError::QueryParse(format!(
                "unexpected ',' in {func_name:?} args"
            )));
        }
        tokens.push(lex.token.clone());
        lex.next_token();
        if lex.is_keyword(",") {
            lex.next_token();
        } else if !lex.is_keyword(")") {
            return Err(StatsError::QueryParse(format!(
                "unexpected token {:?} in {func_name:?} args; want ',' or ')'",
                lex.token
            )));
        }
    }
}

fn parse_func_spec(lex: &mut Lexer) -> Result<FuncSpec> {
    let func = parse_stats_func(lex)?;

    let iff = if lex.is_keyword("if") {
        lex.next_token();
        Some(FilterExpr::parse_parens(lex)?)
    } else {
        None
    };

    let result_name = if lex.is_keyword("as") {
        lex.next_token();
        parse_field_name(lex)?
    } else {
        match &iff {
            Some(iff) => format!("{func} if ({iff})"),
            None => func.to_string(),
        }
    };

    Ok(FuncSpec {
        func,
        iff,
        result_name,
    })
}

fn parse_stats_func(lex: &mut Lexer) -> Result<StatsFunc> {
    let name = lex.token.to_ascii_lowercase();
    if lex.token_quoted {
        return Err(StatsError::QueryParse(format!(
            "unexpected quoted token {:?}; want a stats function name",
            lex.token
        )));
    }
    lex.next_token();
    let func = match name.as_str() {
        "count" => StatsFunc::Count {
            fields: parse_field_names_in_parens(lex, "count")?,
        },
        "count_empty" => StatsFunc::CountEmpty {
            fields: parse_field_names_in_parens(lex, "count_empty")?,
        },
        "count_uniq" => StatsFunc::CountUniq {
            fields: parse_field_names_in_parens(lex, "count_uniq")?,
        },
        "count_uniq_hash" => StatsFunc::CountUniqHash {
            fields: parse_field_names_in_parens(lex, "count_uniq_hash")?,
        },
        "sum" => StatsFunc::Sum {
            fields: parse_field_names_in_parens(lex, "sum")?,
        },
        "sum_len" => StatsFunc::SumLen {
            fields: parse_field_names_in_parens(lex, "sum_len")?,
        },
        "avg" => StatsFunc::Avg {
            fields: parse_field_names_in_parens(lex, "avg")?,
        },
        "min" => StatsFunc::Min {
            fields: parse_field_names_in_parens(lex, "min")?,
        },
        "max" => StatsFunc::Max {
            fields: parse_field_names_in_parens(lex, "max")?,
        },
        "median" => StatsFunc::Median {
            fields: parse_field_names_in_parens(lex, "median")?,
        },
        "quantile" => {
            let tokens = parse_tokens_in_parens(lex, "quantile")?;
            let Some((phi_str, rest)) = tokens.split_first() else {
                return Err(StatsError::QueryParse(
                    "missing phi arg in 'quantile'".to_string(),
                ));
            };
            let Some(phi) = try_parse_f64(phi_str).filter(|p| (0.0..=1.0).contains(p)) else {
                return Err(StatsError::QueryParse(format!(
                    "phi arg in 'quantile' must be a number in [0..1]; got {phi_str:?}"
                )));
            };
            let mut fields: Vec<String> = rest
                .iter()
                .map(|t| {
                    if t == "*" {
                        t.clone()
                    } else {
                        canonical_field_name(t)
                    }
                })
                .collect();
            if fields.is_empty() || fields.iter().any(|f| f == "*") {
                fields = vec!["*".to_string()];
            }
            StatsFunc::Quantile { phi, fields }
        }
        "uniq_values" => StatsFunc::UniqValues {
            fields: parse_field_names_in_parens(lex, "uniq_values")?,
        },
        "values" => StatsFunc::Values {
            fields: parse_field_names_in_parens(lex, "values")?,
        },
        "rate" => {
            let tokens = parse_tokens_in_parens(lex, "rate")?;
            if !tokens.is_empty() {
                return Err(StatsError::QueryParse(
                    "'rate' takes no args".to_string(),
                ));
            }
            StatsFunc::Rate
        }
        "rate_sum" => StatsFunc::RateSum {
            fields: parse_field_names_in_parens(lex, "rate_sum")?,
        },
        "row_any" => {
            let tokens = parse_tokens_in_parens(lex, "row_any")?;
            if !tokens.is_empty() {
                return Err(StatsError::QueryParse(
                    "'row_any' takes no args".to_string(),
                ));
            }
            StatsFunc::RowAny
        }
        "row_min" => StatsFunc::RowMin {
            field: parse_single_field_arg(lex, "row_min")?,
        },
        "row_max" => StatsFunc::RowMax {
            field: parse_single_field_arg(lex, "row_max")?,
        },
        _ => {
            return Err(StatsError::QueryParse(format!(
                "unknown stats func {name:?}"
            )))
        }
    };
    Ok(func)
}

fn parse_single_field_arg(lex: &mut Lexer, func_name: &str) -> Result<String> {
    let tokens = parse_tokens_in_parens(lex, func_name)?;
    let [field] = tokens.as_slice() else {
        return Err(StatsError::QueryParse(format!(
            "{func_name:?} wants exactly one field arg; got {} args",
            tokens.len()
        )));
    };
    Ok(canonical_field_name(field))
}
