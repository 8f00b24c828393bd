//! Search and summary request models.

use serde::{Deserialize, Serialize};

use crate::database::models::job::{JobColumn, JobRow};
use crate::{Error, Result};

/// Comparison operator of a search filter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Lt,
    In,
    #[strum(serialize = "not in")]
    #[serde(rename = "not in")]
    NotIn,
    Like,
    Ilike,
}

impl FilterOperator {
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// A literal compared against a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for SearchScalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SearchScalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SearchScalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// One conjunctive predicate: `value` for scalar operators, `values` for
/// `in` / `not in`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub parameter: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SearchScalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<SearchScalar>>,
}

impl SearchFilter {
    pub fn scalar(
        parameter: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<SearchScalar>,
    ) -> Self {
        Self {
            parameter: parameter.into(),
            operator,
            value: Some(value.into()),
            values: None,
        }
    }

    pub fn eq(parameter: impl Into<String>, value: impl Into<SearchScalar>) -> Self {
        Self::scalar(parameter, FilterOperator::Eq, value)
    }

    pub fn vector<V: Into<SearchScalar>>(
        parameter: impl Into<String>,
        operator: FilterOperator,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            parameter: parameter.into(),
            operator,
            value: None,
            values: Some(values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn job_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::vector("JobID", FilterOperator::In, ids)
    }

    pub(crate) fn column(&self) -> Result<JobColumn> {
        JobColumn::parse(&self.parameter)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub parameter: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(parameter: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Page selection. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
}

impl Pagination {
    pub fn new(page: i64, per_page: i64) -> Self {
        Self { page, per_page }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.page < 1 {
            return Err(Error::invalid_query("Page must be a positive integer"));
        }
        if self.per_page < 1 {
            return Err(Error::invalid_query("Per page must be a positive integer"));
        }
        Ok(())
    }

    pub(crate) fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}

/// A job search request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Columns to return; `None` returns every column.
    pub parameters: Option<Vec<String>>,
    pub search: Vec<SearchFilter>,
    pub sort: Vec<SortSpec>,
    pub distinct: bool,
    pub page: Option<Pagination>,
}

impl SearchParams {
    pub fn filter(mut self, filter: SearchFilter) -> Self {
        self.search.push(filter);
        self
    }

    pub fn columns<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.parameters = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort_by(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn paginate(mut self, page: i64, per_page: i64) -> Self {
        self.page = Some(Pagination::new(page, per_page));
        self
    }
}

/// Total number of matches (before pagination) and the requested page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub total: i64,
    pub rows: Vec<JobRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_json_shape() {
        let filter: SearchFilter = serde_json::from_str(
            r#"{"parameter": "JobID", "operator": "not in", "values": [1, 2]}"#,
        )
        .unwrap();
        assert_eq!(filter.operator, FilterOperator::NotIn);
        assert_eq!(
            filter.values,
            Some(vec![SearchScalar::Int(1), SearchScalar::Int(2)])
        );

        let filter: SearchFilter =
            serde_json::from_str(r#"{"parameter": "Status", "operator": "eq", "value": "Running"}"#)
                .unwrap();
        assert_eq!(filter.value, Some(SearchScalar::Text("Running".into())));
    }

    #[test]
    fn test_pagination_bounds() {
        assert!(Pagination::new(1, 10).validate().is_ok());
        assert!(matches!(
            Pagination::new(0, 10).validate(),
            Err(Error::InvalidQuery(_))
        ));
        assert!(Pagination::new(1, 0).validate().is_err());
        assert_eq!(Pagination::new(3, 10).offset(), 20);
    }
}
