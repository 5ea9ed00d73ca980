use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Tables every backup export must carry, in the order they are checked.
pub const REQUIRED_TABLES: [&str; 9] = [
    "career",
    "person",
    "professor",
    "student",
    "student_career",
    "application_domain",
    "tag",
    "project",
    "project_participant",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSummary {
    pub table: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub total_records: u64,
    pub table_summaries: Vec<TableSummary>,
}

impl BackupSummary {
    /// Entries worth showing before a restore: tables that actually hold rows.
    pub fn restore_summary_entries(&self) -> impl Iterator<Item = &TableSummary> {
        self.table_summaries.iter().filter(|t| t.count > 0)
    }
}

pub fn parse_backup_text(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| Error::InvalidBackup {
        message: format!("el archivo no contiene un JSON válido: {e}"),
    })
}

pub fn validate_backup_structure(doc: &Value) -> Result<()> {
    let Some(tables) = doc.as_object() else {
        return Err(Error::InvalidBackup {
            message: "el respaldo debe ser un objeto JSON con una entrada por tabla".to_string(),
        });
    };

    for table in REQUIRED_TABLES {
        if !tables.get(table).is_some_and(Value::is_array) {
            return Err(Error::InvalidBackup {
                message: format!("falta la tabla \"{table}\" o no es un arreglo"),
            });
        }
    }
    Ok(())
}

pub fn build_backup_summary(doc: &Value) -> BackupSummary {
    let mut table_summaries: Vec<TableSummary> = doc
        .as_object()
        .into_iter()
        .flatten()
        .filter_map(|(table, rows)| {
            rows.as_array().map(|rows| TableSummary {
                table: table.clone(),
                count: rows.len() as u64,
            })
        })
        .collect();
    table_summaries.sort_by(|a, b| a.table.cmp(&b.table));

    let total_records = table_summaries.iter().map(|t| t.count).sum();
    BackupSummary {
        total_records,
        table_summaries,
    }
}

/// Parses, validates and summarizes a backup file's text in one go.
pub fn inspect_backup_text(text: &str) -> Result<BackupSummary> {
    let doc = parse_backup_text(text)?;
    validate_backup_structure(&doc)?;
    Ok(build_backup_summary(&doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete_backup() -> Value {
        let mut doc = serde_json::Map::new();
        for table in REQUIRED_TABLES {
            doc.insert(table.to_string(), json!([]));
        }
        Value::Object(doc)
    }

    #[test]
    fn accepts_backup_with_every_required_table() {
        let mut doc = complete_backup();
        doc["career"] = json!([{ "id": 1 }]);
        doc["audit_log"] = json!("not a table");
        validate_backup_structure(&doc).unwrap();
    }

    #[test]
    fn rejects_each_missing_table_by_name() {
        for table in REQUIRED_TABLES {
            let mut doc = complete_backup();
            doc.as_object_mut().unwrap().remove(table);
            let err = validate_backup_structure(&doc).unwrap_err();
            assert!(
                err.to_string().contains(&format!("\"{table}\"")),
                "unexpected message for {table}: {err}"
            );
        }
    }

    #[test]
    fn rejects_table_that_is_not_an_array() {
        let mut doc = complete_backup();
        doc["tag"] = json!({ "id": 1 });
        let err = validate_backup_structure(&doc).unwrap_err();
        assert!(matches!(err, Error::InvalidBackup { .. }));
        assert!(err.to_string().contains("tag"));
    }

    #[test]
    fn reports_first_missing_table_in_check_order() {
        let doc = json!({ "career": [], "person": [] });
        let err = validate_backup_structure(&doc).unwrap_err();
        assert!(err.to_string().contains("\"professor\""));
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(validate_backup_structure(&json!([1, 2, 3])).is_err());
        assert!(validate_backup_structure(&json!(null)).is_err());
    }

    #[test]
    fn summary_counts_rows_sorted_by_table() {
        let mut doc = complete_backup();
        doc["person"] = json!([1]);
        doc["career"] = json!([1, 2]);
        doc["zeta_extra"] = json!([1, 2, 3, 4]);
        doc["metadata"] = json!({ "version": 3 });

        let summary = build_backup_summary(&doc);
        let names: Vec<&str> = summary
            .table_summaries
            .iter()
            .map(|t| t.table.as_str())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(!names.contains(&"metadata"));
        assert_eq!(
            summary.total_records,
            summary.table_summaries.iter().map(|t| t.count).sum::<u64>()
        );
        assert_eq!(summary.total_records, 7);
    }

    #[test]
    fn restore_entries_skip_empty_tables() {
        let text = r#"{"career":[1,2],"person":[1],"professor":[],"student":[],
            "student_career":[],"application_domain":[],"tag":[],"project":[],
            "project_participant":[]}"#;
        let summary = inspect_backup_text(text).unwrap();
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.table_summaries.len(), 9);

        let shown: Vec<&TableSummary> = summary.restore_summary_entries().collect();
        assert_eq!(
            shown,
            vec![
                &TableSummary {
                    table: "career".to_string(),
                    count: 2
                },
                &TableSummary {
                    table: "person".to_string(),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn summary_of_non_object_is_empty() {
        let summary = build_backup_summary(&json!("text"));
        assert_eq!(summary, BackupSummary::default());
    }

    #[test]
    fn invalid_json_is_a_backup_error() {
        let err = inspect_backup_text("{ not json").unwrap_err();
        assert!(matches!(err, Error::InvalidBackup { .. }));
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn missing_project_participant_is_named() {
        let text = r#"{"career":[],"person":[],"professor":[],"student":[],
            "student_career":[],"application_domain":[],"tag":[],"project":[]}"#;
        let err = inspect_backup_text(text).unwrap_err();
        assert!(err.to_string().contains("project_participant"));
    }
}
