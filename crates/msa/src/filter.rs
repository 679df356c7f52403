//! Rules overriding the preferred prefetch start time of selected uses.
//!
//! A rule is written as colon separated `key:value` pairs. Every pair but
//! the last is a filter; the last pair is the override. Rules are separated
//! by `;`:
//!
//! ```text
//! op_size_gte:1024:op_number_exact:0:prefetch_eagerness:0.5;instruction_name_exact:d:put_after_instruction:a
//! ```
use std::str::FromStr;

use ir::{Module, ShapeIndex, Use};
use thiserror::Error;

use crate::live_range::LiveRanges;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    #[error("rule `{0}` must consist of key:value pairs")]
    UnpairedToken(String),

    #[error("rule `{0}` has no override")]
    MissingOverride(String),

    #[error("unknown filter key `{0}`")]
    UnknownFilter(String),

    #[error("unknown override key `{0}`")]
    UnknownOverride(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    OpSizeLte(u64),
    OpSizeGte(u64),
    OpNumberExact(u32),
    OpIndexExact(ShapeIndex),
    InstructionNameExact(String),
}

impl Filter {
    fn matches(&self, module: &Module, u: &Use, size: u64) -> bool {
        match self {
            Self::OpSizeLte(n) => size <= *n,
            Self::OpSizeGte(n) => size >= *n,
            Self::OpNumberExact(n) => u.operand == *n,
            Self::OpIndexExact(idx) => &u.index == idx,
            Self::InstructionNameExact(name) => module.inst(u.inst).name == name.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Override {
    /// `0.0` prefetches as late as possible, `1.0` as early as possible.
    PrefetchEagerness(f64),
    PutAfterInstruction(String),
    PutBeforeInstruction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterUpdatePreferredPrefetch {
    pub filters: Vec<Filter>,
    pub update: Override,
}

impl FilterUpdatePreferredPrefetch {
    pub fn matches(&self, module: &Module, u: &Use, size: u64) -> bool {
        self.filters.iter().all(|f| f.matches(module, u, size))
    }

    /// The overridden start time for a prefetch that may start anywhere in
    /// `earliest..=latest`. Instruction overrides naming an instruction that
    /// does not exist are ignored.
    pub fn preferred_time(
        &self,
        module: &Module,
        live: &LiveRanges,
        u: &Use,
        earliest: i64,
        latest: i64,
    ) -> Option<i64> {
        let inst_time = |name: &str| {
            let comp = module.comp_of(u.inst);
            module.comps[comp]
                .inst_by_name(name)
                .or_else(|| module.comps.values().find_map(|c| c.inst_by_name(name)))
                .filter(|&inst| live.is_scheduled(inst))
                .map(|inst| live.time(inst))
        };
        match &self.update {
            Override::PrefetchEagerness(r) => {
                let span = (latest - earliest) as f64;
                Some(latest - (r * span).round() as i64)
            }
            Override::PutAfterInstruction(name) => inst_time(name),
            Override::PutBeforeInstruction(name) => inst_time(name).map(|t| t - 1),
        }
    }
}

impl FromStr for FilterUpdatePreferredPrefetch {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split(':').map(str::trim).collect();
        if tokens.len() % 2 != 0 {
            return Err(FilterParseError::UnpairedToken(s.to_string()));
        }
        let mut pairs: Vec<(&str, &str)> = tokens.chunks(2).map(|c| (c[0], c[1])).collect();
        let Some((key, value)) = pairs.pop() else {
            return Err(FilterParseError::MissingOverride(s.to_string()));
        };

        let update = match key {
            "prefetch_eagerness" => Override::PrefetchEagerness(
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|r| (0.0..=1.0).contains(r))
                    .ok_or_else(|| invalid(key, value))?,
            ),
            "put_after_instruction" => Override::PutAfterInstruction(value.to_string()),
            "put_before_instruction" => Override::PutBeforeInstruction(value.to_string()),
            _ if is_filter_key(key) => return Err(FilterParseError::MissingOverride(s.to_string())),
            _ => return Err(FilterParseError::UnknownOverride(key.to_string())),
        };

        let filters = pairs
            .into_iter()
            .map(|(key, value)| parse_filter(key, value))
            .collect::<Result<_, _>>()?;
        Ok(Self { filters, update })
    }
}

/// Parses a `;` separated list of rules. Empty entries are skipped.
pub fn parse_filter_rules(s: &str) -> Result<Vec<FilterUpdatePreferredPrefetch>, FilterParseError> {
    s.split(';')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(str::parse)
        .collect()
}

fn is_filter_key(key: &str) -> bool {
    matches!(
        key,
        "op_size_lte" | "op_size_gte" | "op_number_exact" | "op_index_exact" | "instruction_name_exact"
    )
}

fn parse_filter(key: &str, value: &str) -> Result<Filter, FilterParseError> {
    let number = || value.parse::<u64>().map_err(|_| invalid(key, value));
    Ok(match key {
        "op_size_lte" => Filter::OpSizeLte(number()?),
        "op_size_gte" => Filter::OpSizeGte(number()?),
        "op_number_exact" => Filter::OpNumberExact(value.parse().map_err(|_| invalid(key, value))?),
        "op_index_exact" => Filter::OpIndexExact(parse_shape_index(value).ok_or_else(|| invalid(key, value))?),
        "instruction_name_exact" => Filter::InstructionNameExact(value.to_string()),
        _ => return Err(FilterParseError::UnknownFilter(key.to_string())),
    })
}

/// `{}`, `{1}` or `{0,2}`.
fn parse_shape_index(s: &str) -> Option<ShapeIndex> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?.trim();
    if inner.is_empty() {
        return Some(ShapeIndex::empty());
    }
    let indices = inner
        .split(',')
        .map(|i| i.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    Some(ShapeIndex::from_slice(&indices))
}

fn invalid(key: &str, value: &str) -> FilterParseError {
    FilterParseError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_list() {
        let rules = parse_filter_rules(
            "op_size_gte:1024:op_index_exact:{0,1}:prefetch_eagerness:0.5; instruction_name_exact:d:put_before_instruction:c",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].filters,
            vec![
                Filter::OpSizeGte(1024),
                Filter::OpIndexExact(ShapeIndex::from_slice(&[0, 1]))
            ]
        );
        assert_eq!(rules[0].update, Override::PrefetchEagerness(0.5));
        assert_eq!(
            rules[1].update,
            Override::PutBeforeInstruction("c".to_string())
        );
    }

    #[test]
    fn rejects_malformed_rules() {
        assert_eq!(
            "op_size_gte:1024:prefetch_eagerness".parse::<FilterUpdatePreferredPrefetch>(),
            Err(FilterParseError::UnpairedToken(
                "op_size_gte:1024:prefetch_eagerness".into()
            ))
        );
        assert_eq!(
            "op_size_gte:1024".parse::<FilterUpdatePreferredPrefetch>(),
            Err(FilterParseError::MissingOverride("op_size_gte:1024".into()))
        );
        assert_eq!(
            "op_size:1:prefetch_eagerness:0.1".parse::<FilterUpdatePreferredPrefetch>(),
            Err(FilterParseError::UnknownFilter("op_size".into()))
        );
        assert_eq!(
            "op_size_lte:1:eagerness:0.1".parse::<FilterUpdatePreferredPrefetch>(),
            Err(FilterParseError::UnknownOverride("eagerness".into()))
        );
        let err = "op_number_exact:x:prefetch_eagerness:0.1"
            .parse::<FilterUpdatePreferredPrefetch>()
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value `x` for `op_number_exact`");
        assert!("op_size_lte:1:prefetch_eagerness:1.5"
            .parse::<FilterUpdatePreferredPrefetch>()
            .is_err());
    }
}
