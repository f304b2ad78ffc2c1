//! Typed predicate tree over stored scores.
//!
//! The same tree is rendered to SQL by the Postgres backend and evaluated
//! in-process by the memory backend, so both agree on semantics (including
//! SQL's "comparison with NULL is false").
use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use super::models::Score;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreField {
    Id,
    EndedAt,
    Mode,
    BeatmapId,
    UserId,
    Pp,
    TotalScore,
    ClassicTotalScore,
}

impl ScoreField {
    pub fn column(self) -> &'static str {
        match self {
            ScoreField::Id => "id",
            ScoreField::EndedAt => "ended_at",
            ScoreField::Mode => "mode",
            ScoreField::BeatmapId => "beatmap_id",
            ScoreField::UserId => "user_id",
            ScoreField::Pp => "pp",
            ScoreField::TotalScore => "total_score",
            ScoreField::ClassicTotalScore => "classic_total_score",
        }
    }

    fn value_of(self, s: &Score) -> Option<FilterValue> {
        Some(match self {
            ScoreField::Id => FilterValue::Int(s.id),
            ScoreField::EndedAt => FilterValue::Time(s.ended_at),
            ScoreField::Mode => FilterValue::Text(s.mode.as_str().to_string()),
            ScoreField::BeatmapId => FilterValue::Int(s.beatmap_id),
            ScoreField::UserId => FilterValue::Int(s.user_id),
            ScoreField::Pp => FilterValue::Float(f64::from(s.pp?)),
            ScoreField::TotalScore => FilterValue::Int(s.total_score),
            ScoreField::ClassicTotalScore => FilterValue::Int(s.classic_total_score),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Text(String),
}

impl FilterValue {
    fn partial_cmp(&self, other: &FilterValue) -> Option<Ordering> {
        use FilterValue::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn push_bind(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            FilterValue::Int(v) => qb.push_bind(*v),
            FilterValue::Float(v) => qb.push_bind(*v),
            FilterValue::Time(v) => qb.push_bind(*v),
            FilterValue::Text(v) => qb.push_bind(v.clone()),
        };
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(v: DateTime<Utc>) -> Self {
        FilterValue::Time(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => " = ",
            CmpOp::Ne => " <> ",
            CmpOp::Lt => " < ",
            CmpOp::Le => " <= ",
            CmpOp::Gt => " > ",
            CmpOp::Ge => " >= ",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Conjunction; empty is true.
    All(Vec<Filter>),
    /// Disjunction; empty is false.
    Any(Vec<Filter>),
    Not(Box<Filter>),
    Cmp {
        field: ScoreField,
        op: CmpOp,
        value: FilterValue,
    },
    /// Field is one of `values`; empty is false.
    In {
        field: ScoreField,
        values: Vec<FilterValue>,
    },
    /// Score carries every listed acronym.
    ModsContainAll(Vec<String>),
    /// Every acronym on the score is listed.
    ModsWithin(Vec<String>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All(Vec::new())
    }

    pub fn cmp(field: ScoreField, op: CmpOp, value: impl Into<FilterValue>) -> Self {
        Filter::Cmp {
            field,
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: ScoreField, value: impl Into<FilterValue>) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    pub fn one_of<V: Into<FilterValue>>(field: ScoreField, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            field,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Conjunction that flattens nested `All` nodes.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All(mut a), Filter::All(b)) => {
                a.extend(b);
                Filter::All(a)
            }
            (Filter::All(mut a), other) => {
                a.push(other);
                Filter::All(a)
            }
            (this, Filter::All(mut b)) => {
                b.insert(0, this);
                Filter::All(b)
            }
            (this, other) => Filter::All(vec![this, other]),
        }
    }

    pub fn matches(&self, score: &Score) -> bool {
        match self {
            Filter::All(parts) => parts.iter().all(|f| f.matches(score)),
            Filter::Any(parts) => parts.iter().any(|f| f.matches(score)),
            Filter::Not(inner) => !inner.matches(score),
            Filter::Cmp { field, op, value } => field
                .value_of(score)
                .and_then(|v| v.partial_cmp(value))
                .is_some_and(|ord| op.holds(ord)),
            Filter::In { field, values } => field.value_of(score).is_some_and(|v| {
                values
                    .iter()
                    .any(|candidate| v.partial_cmp(candidate) == Some(Ordering::Equal))
            }),
            Filter::ModsContainAll(required) => required
                .iter()
                .all(|m| score.mod_acronyms.iter().any(|a| a == m)),
            Filter::ModsWithin(allowed) => score
                .mod_acronyms
                .iter()
                .all(|a| allowed.iter().any(|m| m == a)),
        }
    }

    /// Append this predicate as a SQL boolean expression over the `scores` columns.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Filter::All(parts) if parts.is_empty() => {
                qb.push("TRUE");
            }
            Filter::Any(parts) if parts.is_empty() => {
                qb.push("FALSE");
            }
            Filter::All(parts) | Filter::Any(parts) => {
                let joiner = if matches!(self, Filter::All(_)) { " AND " } else { " OR " };
                qb.push("(");
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        qb.push(joiner);
                    }
                    part.push_sql(qb);
                }
                qb.push(")");
            }
            Filter::Not(inner) => {
                qb.push("NOT (");
                inner.push_sql(qb);
                qb.push(")");
            }
            Filter::Cmp { field, op, value } => {
                qb.push(field.column()).push(op.sql());
                value.push_bind(qb);
            }
            Filter::In { values, .. } if values.is_empty() => {
                qb.push("FALSE");
            }
            Filter::In { field, values } => push_any(qb, field.column(), values),
            Filter::ModsContainAll(required) => {
                qb.push("mod_acronyms @> ")
                    .push_bind(required.clone())
                    .push("::text[]");
            }
            Filter::ModsWithin(allowed) => {
                qb.push("mod_acronyms <@ ")
                    .push_bind(allowed.clone())
                    .push("::text[]");
            }
        }
    }
}

/// `col = ANY($n)` with one array bind per value type, so the bind count stays
/// constant however long the list is (Postgres caps a statement at 65535).
fn push_any(qb: &mut QueryBuilder<'_, Postgres>, column: &str, values: &[FilterValue]) {
    let mut ints = Vec::new();
    let mut floats = Vec::new();
    let mut times = Vec::new();
    let mut texts = Vec::new();
    for v in values {
        match v {
            FilterValue::Int(x) => ints.push(*x),
            FilterValue::Float(x) => floats.push(*x),
            FilterValue::Time(x) => times.push(*x),
            FilterValue::Text(x) => texts.push(x.clone()),
        }
    }
    let groups = [!ints.is_empty(), !floats.is_empty(), !times.is_empty(), !texts.is_empty()];
    let mixed = groups.iter().filter(|g| **g).count() > 1;
    if mixed {
        qb.push("(");
    }
    let mut first = true;
    if !ints.is_empty() {
        open_any(qb, column, &mut first);
        qb.push_bind(ints).push("::bigint[])");
    }
    if !floats.is_empty() {
        open_any(qb, column, &mut first);
        qb.push_bind(floats).push("::float8[])");
    }
    if !times.is_empty() {
        open_any(qb, column, &mut first);
        qb.push_bind(times).push("::timestamptz[])");
    }
    if !texts.is_empty() {
        open_any(qb, column, &mut first);
        qb.push_bind(texts).push("::text[])");
    }
    if mixed {
        qb.push(")");
    }
}

fn open_any(qb: &mut QueryBuilder<'_, Postgres>, column: &str, first: &mut bool) {
    if !std::mem::take(first) {
        qb.push(" OR ");
    }
    qb.push(column).push(" = ANY(");
}

/// Mod-set predicate.
///
/// | mandatory | optional | rule |
/// |---|---|---|
/// | set | unset | mods equal the mandatory set exactly |
/// | set | set | mods contain mandatory and lie within mandatory ∪ optional |
/// | unset | set | mods lie within optional |
/// | unset | unset | no filtering (`None`) |
pub fn mod_filter(mandatory: &[String], optional: &[String]) -> Option<Filter> {
    match (mandatory.is_empty(), optional.is_empty()) {
        (true, true) => None,
        (true, false) => Some(Filter::ModsWithin(optional.to_vec())),
        (false, true) => Some(Filter::All(vec![
            Filter::ModsContainAll(mandatory.to_vec()),
            Filter::ModsWithin(mandatory.to_vec()),
        ])),
        (false, false) => {
            let allowed: BTreeSet<String> = mandatory.iter().chain(optional).cloned().collect();
            Some(Filter::All(vec![
                Filter::ModsContainAll(mandatory.to_vec()),
                Filter::ModsWithin(allowed.into_iter().collect()),
            ]))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreSort {
    #[default]
    Pp,
    TotalScore,
    ClassicTotalScore,
    Date,
}

impl ScoreSort {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "pp" | "performance" => ScoreSort::Pp,
            "totalscore" | "total" | "score" => ScoreSort::TotalScore,
            "classictotalscore" | "classic" => ScoreSort::ClassicTotalScore,
            "date" | "endedat" => ScoreSort::Date,
            _ => return None,
        })
    }

    pub fn column(self) -> &'static str {
        match self {
            ScoreSort::Pp => "pp",
            ScoreSort::TotalScore => "total_score",
            ScoreSort::ClassicTotalScore => "classic_total_score",
            ScoreSort::Date => "ended_at",
        }
    }

    /// Ordering used by the SQL `ORDER BY`: nulls last in either direction, then id.
    pub fn compare(self, a: &Score, b: &Score, descending: bool) -> Ordering {
        let dir = |o: Ordering| if descending { o.reverse() } else { o };
        let primary = match self {
            ScoreSort::Pp => match (a.pp, b.pp) {
                (Some(x), Some(y)) => dir(x.total_cmp(&y)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            ScoreSort::TotalScore => dir(a.total_score.cmp(&b.total_score)),
            ScoreSort::ClassicTotalScore => dir(a.classic_total_score.cmp(&b.classic_total_score)),
            ScoreSort::Date => dir(a.ended_at.cmp(&b.ended_at)),
        };
        primary.then_with(|| dir(a.id.cmp(&b.id)))
    }
}

/// One page of scores to select.
#[derive(Debug, Clone)]
pub struct ScoreSelect {
    pub filter: Filter,
    pub sort: ScoreSort,
    pub descending: bool,
    /// `None` selects every matching row.
    pub limit: Option<i64>,
    pub offset: i64,
}
