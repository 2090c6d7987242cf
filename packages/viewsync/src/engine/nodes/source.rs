use crate::engine::operators::Predicate;
use crate::engine::types::{Change, OutputRow, Row, RowChangeEvent, RowId};
use crate::error::PipelineError;
use crate::schema::TableSchema;

/// Entry point of a pipeline for one table. Validates rows against the
/// table schema and turns upstream mutations into weighted changes.
#[derive(Debug)]
pub(crate) struct SourceNode {
    schema: TableSchema,
    filter: Option<Predicate>,
}

impl SourceNode {
    pub(crate) fn new(schema: TableSchema, filter: Option<Predicate>) -> Self {
        Self { schema, filter }
    }

    pub(crate) fn table(&self) -> &str {
        &self.schema.name
    }

    fn output(&self, row: &Row) -> Result<Option<OutputRow>, PipelineError> {
        self.schema
            .validate(row)
            .map_err(|reason| PipelineError::MalformedRow {
                table: self.schema.name.clone(),
                reason,
            })?;
        if let Some(filter) = &self.filter {
            if !filter.eval(row) {
                return Ok(None);
            }
        }
        let key = self
            .schema
            .key_of(row)
            .map_err(|e| PipelineError::MalformedRow {
                table: self.schema.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(OutputRow::new(
            RowId::new(self.schema.name.clone(), key),
            row.clone(),
        )))
    }

    /// An update becomes a removal of the old row then an addition of the
    /// new one, each only if it passes the scan filter.
    pub(crate) fn push(
        &self,
        event: &RowChangeEvent,
        out: &mut Vec<Change>,
    ) -> Result<(), PipelineError> {
        if let Some(before) = &event.before {
            if let Some(row) = self.output(before)? {
                out.push(Change::Remove(row));
            }
        }
        if let Some(after) = &event.after {
            if let Some(row) = self.output(after)? {
                out.push(Change::Add(row));
            }
        }
        Ok(())
    }

    pub(crate) fn push_existing(&self, row: &Row, out: &mut Vec<Change>) -> Result<(), PipelineError> {
        if let Some(row) = self.output(row)? {
            out.push(Change::Add(row));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{row_from_json, Path};
    use crate::schema::ColumnType;
    use serde_json::json;

    fn source(filter: Option<Predicate>) -> SourceNode {
        SourceNode::new(
            TableSchema::new("issue", &["id"])
                .with_column("id", ColumnType::Number)
                .with_column("open", ColumnType::Boolean),
            filter,
        )
    }

    #[test]
    fn test_update_is_remove_then_add() {
        let node = source(None);
        let event = RowChangeEvent::update(
            "issue",
            Some(row_from_json(json!({"id": 1, "open": true}))),
            row_from_json(json!({"id": 1, "open": false})),
        );
        let mut out = Vec::new();
        node.push(&event, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out[0].is_add());
        assert!(out[1].is_add());
        assert_eq!(out[0].id(), out[1].id());
    }

    #[test]
    fn test_filter_turns_update_into_delete() {
        let node = source(Some(Predicate::Eq {
            field: Path::new("open"),
            value: true.into(),
        }));
        let event = RowChangeEvent::update(
            "issue",
            Some(row_from_json(json!({"id": 1, "open": true}))),
            row_from_json(json!({"id": 1, "open": false})),
        );
        let mut out = Vec::new();
        node.push(&event, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_add());
    }

    #[test]
    fn test_malformed_row_is_error() {
        let node = source(None);
        let mut out = Vec::new();
        let err = node
            .push_existing(&row_from_json(json!({"id": "x"})), &mut out)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRow { .. }));
    }
}
