//! Synchronous query evaluation against the record cache.

use std::cmp::Ordering;

use serde_json::Value;

use orbit_api::{
    FilterOp, FilterSpec, OrbitError, PageSpec, Query, QueryExpression, QueryResult, Record,
    RecordIdentity, RelationshipData, RequestOptions, Result, SortOrder, SortSpec,
};

use super::RecordCache;

impl RecordCache {
    /// Evaluate every expression of the query, in order.
    pub fn query_sync(&self, query: &Query) -> Result<Vec<QueryResult>> {
        query
            .expressions
            .iter()
            .map(|expression| self.query_expression_sync(expression, &query.options))
            .collect()
    }

    pub fn query_expression_sync(
        &self,
        expression: &QueryExpression,
        options: &RequestOptions,
    ) -> Result<QueryResult> {
        match expression {
            QueryExpression::FindRecord { record } => {
                match self.get_record_sync(record) {
                    Some(found) => Ok(QueryResult::Record(Some(found.clone()))),
                    None if options.raise_not_found => Err(OrbitError::RecordNotFound {
                        kind: record.kind.clone(),
                        id: record.id.clone(),
                    }),
                    None => Ok(QueryResult::Record(None)),
                }
            }
            QueryExpression::FindRecords {
                model,
                records,
                filter,
                sort,
                page,
            } => {
                let mut found: Vec<Record> = match (model, records) {
                    (_, Some(identities)) => {
                        // Unknown identities are silently dropped.
                        identities
                            .iter()
                            .filter_map(|identity| self.get_record_sync(identity).cloned())
                            .collect()
                    }
                    (Some(model), None) => {
                        self.validate_model(model)?;
                        self.records_sync(model).into_iter().cloned().collect()
                    }
                    (None, None) => {
                        return Err(OrbitError::Assertion(
                            "findRecords requires a model or a list of identities".to_string(),
                        ))
                    }
                };
                refine(&mut found, filter, sort, page);
                Ok(QueryResult::Records(found))
            }
            QueryExpression::FindRelatedRecord {
                record,
                relationship,
            } => {
                let Some(owner) = self.get_record_sync(record) else {
                    if options.raise_not_found {
                        return Err(OrbitError::RecordNotFound {
                            kind: record.kind.clone(),
                            id: record.id.clone(),
                        });
                    }
                    return Ok(QueryResult::Record(None));
                };
                self.schema().relationship_def(&record.kind, relationship)?;
                let related = match owner.relationship(relationship) {
                    Some(RelationshipData::One(Some(identity))) => {
                        self.get_record_sync(identity).cloned()
                    }
                    _ => None,
                };
                Ok(QueryResult::Record(related))
            }
            QueryExpression::FindRelatedRecords {
                record,
                relationship,
                filter,
                sort,
                page,
            } => {
                let Some(owner) = self.get_record_sync(record) else {
                    if options.raise_not_found {
                        return Err(OrbitError::RecordNotFound {
                            kind: record.kind.clone(),
                            id: record.id.clone(),
                        });
                    }
                    return Ok(QueryResult::Records(vec![]));
                };
                self.schema().relationship_def(&record.kind, relationship)?;
                let identities: Vec<RecordIdentity> = match owner.relationship(relationship) {
                    Some(RelationshipData::Many(identities)) => identities.clone(),
                    _ => vec![],
                };
                let mut found: Vec<Record> = identities
                    .iter()
                    .filter_map(|identity| self.get_record_sync(identity).cloned())
                    .collect();
                refine(&mut found, filter, sort, page);
                Ok(QueryResult::Records(found))
            }
        }
    }
}

fn refine(records: &mut Vec<Record>, filter: &[FilterSpec], sort: &[SortSpec], page: &Option<PageSpec>) {
    if !filter.is_empty() {
        records.retain(|record| filter.iter().all(|spec| matches_filter(record, spec)));
    }
    if !sort.is_empty() {
        records.sort_by(|a, b| compare_by_specs(a, b, sort));
    }
    if let Some(page) = page {
        let start = page.offset.min(records.len());
        let end = match page.limit {
            Some(limit) => (start + limit).min(records.len()),
            None => records.len(),
        };
        *records = records[start..end].to_vec();
    }
}

fn matches_filter(record: &Record, spec: &FilterSpec) -> bool {
    let Some(value) = record.attribute(&spec.attribute) else {
        return false;
    };
    match spec.op {
        FilterOp::Equal => value == &spec.value,
        FilterOp::Gt => matches!(compare_values(value, &spec.value), Some(Ordering::Greater)),
        FilterOp::Gte => matches!(
            compare_values(value, &spec.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => matches!(compare_values(value, &spec.value), Some(Ordering::Less)),
        FilterOp::Lte => matches!(
            compare_values(value, &spec.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

fn compare_by_specs(a: &Record, b: &Record, specs: &[SortSpec]) -> Ordering {
    for spec in specs {
        let ordering = match (a.attribute(&spec.attribute), b.attribute(&spec.attribute)) {
            (Some(left), Some(right)) => compare_values(left, right).unwrap_or(Ordering::Equal),
            // Records missing the sort attribute go last, regardless of order.
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ordering = match spec.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(left), Value::Number(right)) => left
            .as_f64()
            .zip(right.as_f64())
            .and_then(|(l, r)| l.partial_cmp(&r)),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_api::{solar_system_schema, QueryBuilder, RecordOperation};
    use serde_json::json;
    use std::sync::Arc;

    fn seeded_cache() -> RecordCache {
        let mut cache = RecordCache::new(Arc::new(solar_system_schema()));
        let records = vec![
            Record::new("planet", "jupiter")
                .with_attribute("name", "Jupiter")
                .with_attribute("classification", "gas giant")
                .with_attribute("order", 5),
            Record::new("planet", "earth")
                .with_attribute("name", "Earth")
                .with_attribute("classification", "terrestrial")
                .with_attribute("order", 3),
            Record::new("planet", "venus")
                .with_attribute("name", "Venus")
                .with_attribute("classification", "terrestrial")
                .with_attribute("order", 2),
        ];
        for record in records {
            cache
                .patch(&[RecordOperation::AddRecord { record }])
                .unwrap();
        }
        cache
    }

    #[test]
    fn test_find_record() {
        let cache = seeded_cache();
        let query = Query::new(vec![
            QueryBuilder.find_record(RecordIdentity::new("planet", "earth"))
        ]);
        let results = cache.query_sync(&query).unwrap();
        assert_eq!(
            results[0].as_record().unwrap().attribute("name"),
            Some(&json!("Earth"))
        );
    }

    #[test]
    fn test_find_record_missing_raises_unless_suppressed() {
        let cache = seeded_cache();
        let query = Query::new(vec![
            QueryBuilder.find_record(RecordIdentity::new("planet", "pluto"))
        ]);
        assert!(matches!(
            cache.query_sync(&query),
            Err(OrbitError::RecordNotFound { .. })
        ));

        let mut options = RequestOptions::default();
        options.raise_not_found = false;
        let query = query.with_options(options);
        let results = cache.query_sync(&query).unwrap();
        assert_eq!(results[0], QueryResult::Record(None));
    }

    #[test]
    fn test_find_records_by_identity_drops_unknown() {
        let cache = seeded_cache();
        let query = Query::new(vec![QueryBuilder.find_records_by_identity(vec![
            RecordIdentity::new("planet", "earth"),
            RecordIdentity::new("planet", "pluto"),
        ])]);
        let results = cache.query_sync(&query).unwrap();
        assert_eq!(results[0].as_records().unwrap().len(), 1);
    }

    #[test]
    fn test_filter_sort_page() {
        let cache = seeded_cache();
        let query = Query::new(vec![QueryBuilder
            .find_records("planet")
            .filter_eq("classification", "terrestrial")
            .sorted("order", SortOrder::Descending)
            .paged(0, Some(1))]);
        let results = cache.query_sync(&query).unwrap();
        let records = results[0].as_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), "earth");
    }

    #[test]
    fn test_find_related_records() {
        let mut cache = seeded_cache();
        cache
            .patch(&[RecordOperation::AddRecord {
                record: Record::new("moon", "io").with_relationship(
                    "planet",
                    RelationshipData::One(Some(RecordIdentity::new("planet", "jupiter"))),
                ),
            }])
            .unwrap();

        let query = Query::new(vec![QueryBuilder
            .find_related_records(RecordIdentity::new("planet", "jupiter"), "moons")]);
        let results = cache.query_sync(&query).unwrap();
        let records = results[0].as_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), "io");

        let query = Query::new(vec![QueryBuilder
            .find_related_record(RecordIdentity::new("moon", "io"), "planet")]);
        let results = cache.query_sync(&query).unwrap();
        assert_eq!(results[0].as_record().unwrap().id(), "jupiter");
    }

    #[test]
    fn test_find_related_on_unknown_relationship_data_is_empty() {
        let cache = seeded_cache();
        let query = Query::new(vec![QueryBuilder
            .find_related_records(RecordIdentity::new("planet", "earth"), "moons")]);
        let results = cache.query_sync(&query).unwrap();
        assert!(results[0].as_records().unwrap().is_empty());
    }
}
