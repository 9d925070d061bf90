//! Query expressions and the query envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::record::{Record, RecordIdentity};
use crate::transform::RequestOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Equal,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Attribute filter applied to a record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub attribute: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub attribute: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpec {
    #[serde(default)]
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One query expression. Record-set expressions can be refined by filter,
/// sort and page terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryExpression {
    FindRecord {
        record: RecordIdentity,
    },
    #[serde(rename_all = "camelCase")]
    FindRecords {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        records: Option<Vec<RecordIdentity>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filter: Vec<FilterSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sort: Vec<SortSpec>,
        #[serde(skip_serializing_if = "Option::is_none")]
        page: Option<PageSpec>,
    },
    FindRelatedRecord {
        record: RecordIdentity,
        relationship: String,
    },
    #[serde(rename_all = "camelCase")]
    FindRelatedRecords {
        record: RecordIdentity,
        relationship: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filter: Vec<FilterSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sort: Vec<SortSpec>,
        #[serde(skip_serializing_if = "Option::is_none")]
        page: Option<PageSpec>,
    },
}

impl QueryExpression {
    /// Refine a record-set expression with an equality filter. No-op on
    /// single-record expressions.
    pub fn filter_eq(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filtered(FilterSpec {
            attribute: attribute.into(),
            op: FilterOp::Equal,
            value: value.into(),
        })
    }

    pub fn filtered(mut self, spec: FilterSpec) -> Self {
        match &mut self {
            QueryExpression::FindRecords { filter, .. }
            | QueryExpression::FindRelatedRecords { filter, .. } => filter.push(spec),
            _ => {}
        }
        self
    }

    pub fn sorted(mut self, attribute: impl Into<String>, order: SortOrder) -> Self {
        match &mut self {
            QueryExpression::FindRecords { sort, .. }
            | QueryExpression::FindRelatedRecords { sort, .. } => sort.push(SortSpec {
                attribute: attribute.into(),
                order,
            }),
            _ => {}
        }
        self
    }

    pub fn paged(mut self, offset: usize, limit: Option<usize>) -> Self {
        match &mut self {
            QueryExpression::FindRecords { page, .. }
            | QueryExpression::FindRelatedRecords { page, .. } => {
                *page = Some(PageSpec { offset, limit })
            }
            _ => {}
        }
        self
    }
}

/// An identified sequence of query expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub expressions: Vec<QueryExpression>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl Query {
    pub fn new(expressions: Vec<QueryExpression>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            expressions,
            options: RequestOptions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Inputs accepted by `query`/`pull`.
#[derive(Debug, Clone)]
pub enum QueryOrExpressions {
    Query(Query),
    Expression(QueryExpression),
    Expressions(Vec<QueryExpression>),
}

impl QueryOrExpressions {
    pub fn build(self, options: Option<RequestOptions>, id: Option<String>) -> Query {
        let mut query = match self {
            QueryOrExpressions::Query(query) => query,
            QueryOrExpressions::Expression(expr) => Query::new(vec![expr]),
            QueryOrExpressions::Expressions(exprs) => Query::new(exprs),
        };
        if let Some(id) = id {
            query.id = id;
        }
        if let Some(options) = options {
            query.options = options;
        }
        query
    }
}

impl From<Query> for QueryOrExpressions {
    fn from(query: Query) -> Self {
        QueryOrExpressions::Query(query)
    }
}

impl From<QueryExpression> for QueryOrExpressions {
    fn from(expr: QueryExpression) -> Self {
        QueryOrExpressions::Expression(expr)
    }
}

impl From<Vec<QueryExpression>> for QueryOrExpressions {
    fn from(exprs: Vec<QueryExpression>) -> Self {
        QueryOrExpressions::Expressions(exprs)
    }
}

/// Expression constructors.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryBuilder;

impl QueryBuilder {
    pub fn find_record(&self, record: RecordIdentity) -> QueryExpression {
        QueryExpression::FindRecord { record }
    }

    pub fn find_records(&self, model: impl Into<String>) -> QueryExpression {
        QueryExpression::FindRecords {
            model: Some(model.into()),
            records: None,
            filter: vec![],
            sort: vec![],
            page: None,
        }
    }

    pub fn find_records_by_identity(&self, records: Vec<RecordIdentity>) -> QueryExpression {
        QueryExpression::FindRecords {
            model: None,
            records: Some(records),
            filter: vec![],
            sort: vec![],
            page: None,
        }
    }

    pub fn find_related_record(
        &self,
        record: RecordIdentity,
        relationship: impl Into<String>,
    ) -> QueryExpression {
        QueryExpression::FindRelatedRecord {
            record,
            relationship: relationship.into(),
        }
    }

    pub fn find_related_records(
        &self,
        record: RecordIdentity,
        relationship: impl Into<String>,
    ) -> QueryExpression {
        QueryExpression::FindRelatedRecords {
            record,
            relationship: relationship.into(),
            filter: vec![],
            sort: vec![],
            page: None,
        }
    }
}

/// Result of evaluating one query expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Record(Option<Record>),
    Records(Vec<Record>),
}

impl QueryResult {
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            QueryResult::Record(record) => record.as_ref(),
            QueryResult::Records(_) => None,
        }
    }

    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            QueryResult::Records(records) => Some(records),
            QueryResult::Record(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_refinements() {
        let expr = QueryBuilder
            .find_records("planet")
            .filter_eq("classification", "gas giant")
            .sorted("name", SortOrder::Ascending)
            .paged(0, Some(10));

        match expr {
            QueryExpression::FindRecords {
                model,
                filter,
                sort,
                page,
                ..
            } => {
                assert_eq!(model.as_deref(), Some("planet"));
                assert_eq!(filter.len(), 1);
                assert_eq!(sort.len(), 1);
                assert_eq!(page.unwrap().limit, Some(10));
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn test_query_build_reuses_id() {
        let expr = QueryBuilder.find_record(RecordIdentity::new("planet", "jupiter"));
        let query = QueryOrExpressions::from(expr).build(None, Some("q1".to_string()));
        assert_eq!(query.id, "q1");
    }
}
