//! SQL fragments for job search: filters, date truncation and sorting.

use regex::Regex;
use sqlx::{QueryBuilder, Sqlite};
use std::sync::LazyLock;

use crate::database::models::job::{ColumnKind, JobColumn};
use crate::database::models::search::{FilterOperator, SearchFilter, SearchScalar, SortDirection, SortSpec};
use crate::database::time::{parse_status_time, to_db_text};
use crate::{Error, Result};

/// Partial date/time literal, from a bare year up to microseconds.
static DATE_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}(-\d{2}(-\d{2}(([ T])\d{2}(:\d{2}(:\d{2}(\.\d{6}Z?)?)?)?)?)?)?$")
        .expect("valid date literal regex")
});

/// Precision of a date literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeResolution {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl TimeResolution {
    fn strftime_format(&self) -> &'static str {
        match self {
            Self::Year => "%Y",
            Self::Month => "%Y-%m",
            Self::Day => "%Y-%m-%d",
            Self::Hour => "%Y-%m-%d %H",
            Self::Minute => "%Y-%m-%d %H:%M",
            Self::Second => "%Y-%m-%d %H:%M:%S",
        }
    }

    /// Length of a literal at this resolution, e.g. 7 for "2024-01".
    fn literal_len(&self) -> usize {
        match self {
            Self::Year => 4,
            Self::Month => 7,
            Self::Day => 10,
            Self::Hour => 13,
            Self::Minute => 16,
            Self::Second => 19,
        }
    }
}

/// Resolution of a partial date literal and the literal in column format.
pub(crate) fn find_time_resolution(value: &str) -> Result<(TimeResolution, String)> {
    if let Some(caps) = DATE_LITERAL.captures(value) {
        let resolution = if caps.get(6).is_some() {
            TimeResolution::Second
        } else if caps.get(5).is_some() {
            TimeResolution::Minute
        } else if caps.get(3).is_some() {
            TimeResolution::Hour
        } else if caps.get(2).is_some() {
            TimeResolution::Day
        } else if caps.get(1).is_some() {
            TimeResolution::Month
        } else {
            TimeResolution::Year
        };
        let normalized: String = value.replacen('T', " ", 1).chars().take(resolution.literal_len()).collect();
        return Ok((resolution, normalized));
    }

    // Full timestamps with an offset are compared in UTC.
    let dt = parse_status_time(value)
        .map_err(|_| Error::invalid_query(format!("Cannot parse date value '{value}'")))?;
    Ok((TimeResolution::Second, to_db_text(dt)))
}

fn push_scalar(qb: &mut QueryBuilder<'_, Sqlite>, value: &SearchScalar) {
    match value {
        SearchScalar::Bool(b) => {
            qb.push_bind(*b);
        }
        SearchScalar::Int(i) => {
            qb.push_bind(*i);
        }
        SearchScalar::Float(f) => {
            qb.push_bind(*f);
        }
        SearchScalar::Text(s) => {
            qb.push_bind(s.clone());
        }
    }
}

/// Column expression plus literals, after date truncation.
struct Operand {
    expr: String,
    values: Vec<SearchScalar>,
}

fn date_operand(column: JobColumn, values: &[SearchScalar]) -> Result<Operand> {
    let mut resolution = None;
    let mut literals = Vec::with_capacity(values.len());
    for value in values {
        let SearchScalar::Text(text) = value else {
            return Err(Error::invalid_query(format!(
                "{column} must be compared with a date string"
            )));
        };
        let (res, literal) = find_time_resolution(text)?;
        match resolution {
            None => resolution = Some(res),
            Some(existing) if existing != res => {
                return Err(Error::invalid_query(
                    "Cannot mix different time resolutions in one filter",
                ));
            }
            Some(_) => {}
        }
        literals.push(SearchScalar::Text(literal));
    }

    let expr = match resolution {
        Some(res) => format!("strftime('{}', {})", res.strftime_format(), column.sql_name()),
        None => column.sql_name().to_string(),
    };
    Ok(Operand {
        expr,
        values: literals,
    })
}

fn filter_values(filter: &SearchFilter) -> Result<Vec<SearchScalar>> {
    if filter.operator.is_vector() {
        filter.values.clone().ok_or_else(|| {
            Error::invalid_query(format!(
                "Operator '{}' on {} needs 'values'",
                filter.operator, filter.parameter
            ))
        })
    } else {
        filter.value.clone().map(|v| vec![v]).ok_or_else(|| {
            Error::invalid_query(format!(
                "Operator '{}' on {} needs 'value'",
                filter.operator, filter.parameter
            ))
        })
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &SearchFilter) -> Result<()> {
    let column = filter.column()?;
    let values = filter_values(filter)?;
    let truncate = column.kind() == ColumnKind::DateTime
        && !matches!(filter.operator, FilterOperator::Like | FilterOperator::Ilike);
    let operand = if truncate {
        date_operand(column, &values)?
    } else {
        Operand {
            expr: column.sql_name().to_string(),
            values,
        }
    };

    match filter.operator {
        FilterOperator::In | FilterOperator::NotIn => {
            if operand.values.is_empty() {
                qb.push(if filter.operator == FilterOperator::In {
                    "1 = 0"
                } else {
                    "1 = 1"
                });
                return Ok(());
            }
            qb.push(&operand.expr);
            qb.push(if filter.operator == FilterOperator::In {
                " IN ("
            } else {
                " NOT IN ("
            });
            for (i, value) in operand.values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_scalar(qb, value);
            }
            qb.push(")");
        }
        FilterOperator::Ilike => {
            qb.push("LOWER(").push(&operand.expr).push(") LIKE LOWER(");
            push_scalar(qb, &operand.values[0]);
            qb.push(")");
        }
        op => {
            let sql_op = match op {
                FilterOperator::Eq => " = ",
                FilterOperator::Neq => " != ",
                FilterOperator::Gt => " > ",
                FilterOperator::Lt => " < ",
                _ => " LIKE ",
            };
            qb.push(&operand.expr).push(sql_op);
            push_scalar(qb, &operand.values[0]);
        }
    }
    Ok(())
}

/// Append ` WHERE ...` for the conjunction of `filters` (nothing if empty).
pub(crate) fn push_where(qb: &mut QueryBuilder<'_, Sqlite>, filters: &[SearchFilter]) -> Result<()> {
    for (i, filter) in filters.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        push_filter(qb, filter)?;
    }
    Ok(())
}

/// Append ` ORDER BY ...` (nothing if empty).
pub(crate) fn push_order_by(qb: &mut QueryBuilder<'_, Sqlite>, sorts: &[SortSpec]) -> Result<()> {
    for (i, sort) in sorts.iter().enumerate() {
        let column = JobColumn::parse(&sort.parameter)?;
        qb.push(if i == 0 { " ORDER BY " } else { ", " });
        qb.push(column.sql_name());
        qb.push(match sort.direction {
            SortDirection::Asc => " ASC",
            SortDirection::Desc => " DESC",
        });
    }
    Ok(())
}

/// Append a comma-separated column list.
pub(crate) fn push_columns(qb: &mut QueryBuilder<'_, Sqlite>, columns: &[JobColumn]) {
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(column.sql_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2024", TimeResolution::Year, "2024")]
    #[case("2024-01", TimeResolution::Month, "2024-01")]
    #[case("2024-01-15", TimeResolution::Day, "2024-01-15")]
    #[case("2024-01-15T10", TimeResolution::Hour, "2024-01-15 10")]
    #[case("2024-01-15 10:30", TimeResolution::Minute, "2024-01-15 10:30")]
    #[case("2024-01-15T10:30:45", TimeResolution::Second, "2024-01-15 10:30:45")]
    #[case("2024-01-15T10:30:45.123456Z", TimeResolution::Second, "2024-01-15 10:30:45")]
    #[case("2024-01-15T12:30:45+02:00", TimeResolution::Second, "2024-01-15 10:30:45")]
    fn test_find_time_resolution(
        #[case] value: &str,
        #[case] resolution: TimeResolution,
        #[case] literal: &str,
    ) {
        assert_eq!(
            find_time_resolution(value).unwrap(),
            (resolution, literal.to_string())
        );
    }

    #[test]
    fn test_unparseable_date_is_invalid_query() {
        assert!(matches!(
            find_time_resolution("last tuesday"),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_mixed_resolutions_are_rejected() {
        let filter = SearchFilter::vector(
            "SubmissionTime",
            FilterOperator::In,
            ["2024-01", "2024-01-02"],
        );
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT job_id FROM jobs");
        assert!(matches!(
            push_where(&mut qb, &[filter]),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_where_clause_shape() {
        let filters = [
            SearchFilter::eq("Status", "Running"),
            SearchFilter::scalar("SubmissionTime", FilterOperator::Gt, "2024-01"),
            SearchFilter::vector("JobID", FilterOperator::NotIn, [1i64, 2]),
            SearchFilter::scalar("Owner", FilterOperator::Ilike, "ALI%"),
        ];
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT job_id FROM jobs");
        push_where(&mut qb, &filters).unwrap();
        push_order_by(&mut qb, &[SortSpec::desc("JobID")]).unwrap();

        assert_eq!(
            qb.sql(),
            "SELECT job_id FROM jobs WHERE status = ? \
             AND strftime('%Y-%m', submission_time) > ? \
             AND job_id NOT IN (?, ?) \
             AND LOWER(owner) LIKE LOWER(?) \
             ORDER BY job_id DESC"
        );
    }

    #[test]
    fn test_missing_values_are_rejected() {
        let filter = SearchFilter {
            parameter: "JobID".into(),
            operator: FilterOperator::In,
            value: Some(SearchScalar::Int(1)),
            values: None,
        };
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT job_id FROM jobs");
        assert!(push_where(&mut qb, &[filter]).is_err());
    }

    #[test]
    fn test_unknown_sort_column() {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT job_id FROM jobs");
        assert!(matches!(
            push_order_by(&mut qb, &[SortSpec::asc("Nope")]),
            Err(Error::InvalidQuery(_))
        ));
    }
}
