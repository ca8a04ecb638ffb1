//! Export audit records to various formats

use crate::auditor::AuditQuery;
use crate::record::AuditRecord;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// RON format (Rust Object Notation)
    Ron,
    /// JSON format (requires serde_json feature)
    Json,
    /// One line per record
    Csv,
    /// Human-readable text format
    Text,
}

/// Exporter for audit records
pub struct Exporter<'a> {
    records: &'a [AuditRecord],
}

impl<'a> Exporter<'a> {
    pub fn new(records: &'a [AuditRecord]) -> Self {
        Self { records }
    }

    /// Export to a string in the specified format
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Ron => self.to_ron(),
            ExportFormat::Json => self.to_json(),
            ExportFormat::Csv => Ok(self.to_csv()),
            ExportFormat::Text => Ok(self.to_text()),
        }
    }

    /// Export to a writer
    pub fn export_to<W: Write>(&self, writer: &mut W, format: ExportFormat) -> Result<()> {
        let content = self.export(format)?;
        writer
            .write_all(content.as_bytes())
            .map_err(|e| Error::ExportError(e.to_string()))?;
        Ok(())
    }

    /// Export only the records a query selects
    pub fn export_query(&self, query: &AuditQuery, format: ExportFormat) -> Result<String> {
        let selected: Vec<AuditRecord> = self
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        Exporter::new(&selected).export(format)
    }

    pub fn to_ron(&self) -> Result<String> {
        let export = ExportData::from_records(self.records);
        ron::ser::to_string_pretty(&export, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    #[cfg(feature = "serde_json")]
    pub fn to_json(&self) -> Result<String> {
        let export = ExportData::from_records(self.records);
        serde_json::to_string_pretty(&export).map_err(|e| Error::Serialization(e.to_string()))
    }

    #[cfg(not(feature = "serde_json"))]
    pub fn to_json(&self) -> Result<String> {
        Err(Error::ExportError(
            "JSON export requires the 'serde_json' feature".to_string(),
        ))
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        output.push_str("lsn,timestamp,kind,txn,modules,summary\n");

        for record in self.records {
            let txn = record
                .payload
                .txn()
                .map(|t| t.0.to_string())
                .unwrap_or_default();
            let modules = record
                .payload
                .modules()
                .iter()
                .map(|m| m.0.to_string())
                .collect::<Vec<_>>()
                .join(";");
            let summary = record.payload.summary().replace('"', "\"\"");

            output.push_str(&format!(
                "{},{},{},{},{},\"{}\"\n",
                record.lsn,
                record.timestamp.to_rfc3339(),
                record.kind,
                txn,
                modules,
                summary
            ));
        }

        output
    }

    pub fn to_text(&self) -> String {
        let mut output = String::new();

        output.push_str("=== Audit Log Export ===\n\n");
        output.push_str(&format!("Total records: {}\n", self.records.len()));
        if let (Some(first), Some(last)) = (self.records.first(), self.records.last()) {
            output.push_str(&format!("Lsn range: {} - {}\n", first.lsn, last.lsn));
            output.push_str(&format!(
                "Time range: {} - {}\n",
                first.timestamp.to_rfc3339(),
                last.timestamp.to_rfc3339()
            ));
        }

        output.push_str("\n=== Records ===\n\n");
        for record in self.records {
            let mark = if record.verify() { "" } else { " [CORRUPT]" };
            output.push_str(&format!(
                "  #{} {} [{}]{} {}\n",
                record.lsn,
                record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.kind,
                mark,
                record.payload.summary()
            ));
        }

        output
    }
}

/// Data structure for a full export
#[derive(Debug, Clone, Serialize)]
struct ExportData<'a> {
    version: u32,
    stats: ExportStats,
    records: &'a [AuditRecord],
}

impl<'a> ExportData<'a> {
    fn from_records(records: &'a [AuditRecord]) -> Self {
        let mut by_kind = BTreeMap::new();
        for record in records {
            *by_kind.entry(record.kind.to_string()).or_insert(0) += 1;
        }
        Self {
            version: 1,
            stats: ExportStats {
                total_records: records.len(),
                first_lsn: records.first().map(|r| r.lsn),
                last_lsn: records.last().map(|r| r.lsn),
                first: records.first().map(|r| r.timestamp),
                last: records.last().map(|r| r.timestamp),
                by_kind,
            },
            records,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ExportStats {
    total_records: usize,
    first_lsn: Option<u64>,
    last_lsn: Option<u64>,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
    by_kind: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuditKind, AuditPayload};
    use hotswap_core::{ModuleId, TxnId};
    use hotswap_engine::{CircuitEvent, CircuitState, TransactionEvent};

    fn create_test_records() -> Vec<AuditRecord> {
        let payloads = [
            AuditPayload::Transaction(TransactionEvent::Committed {
                txn: TxnId(1),
                modules: vec![ModuleId(1), ModuleId(2)],
                commit_ts: 3,
                duration_us: 250,
            }),
            AuditPayload::Transaction(TransactionEvent::Aborted {
                txn: TxnId(2),
                reason: "module:1 rejected prepare: \"busy\"".into(),
            }),
            AuditPayload::Circuit(CircuitEvent {
                module: ModuleId(1),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }),
        ];
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| AuditRecord::new(i as u64 + 1, i as u64 + 1, p).unwrap())
            .collect()
    }

    #[test]
    fn test_export_ron() {
        let records = create_test_records();
        let ron = Exporter::new(&records).to_ron().unwrap();

        assert!(ron.contains("version"));
        assert!(ron.contains("records"));
        assert!(ron.contains("Committed"));
    }

    #[test]
    fn test_export_csv_escapes_quotes() {
        let records = create_test_records();
        let csv = Exporter::new(&records).to_csv();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "lsn,timestamp,kind,txn,modules,summary");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains(",transaction,1,1;2,"));
        assert!(lines[2].contains("\"\"busy\"\""));
        assert!(lines[3].contains(",circuit,,1,"));
    }

    #[test]
    fn test_export_text() {
        let records = create_test_records();
        let text = Exporter::new(&records).to_text();

        assert!(text.contains("Audit Log Export"));
        assert!(text.contains("Lsn range: 1 - 3"));
        assert!(text.contains("circuit module:1 closed -> open"));
        assert!(!text.contains("[CORRUPT]"));
    }

    #[test]
    fn test_export_query_selects_records() {
        let records = create_test_records();
        let csv = Exporter::new(&records)
            .export_query(&AuditQuery::new().by_kind(AuditKind::Circuit), ExportFormat::Csv)
            .unwrap();
        assert_eq!(csv.lines().count(), 2);
    }

    #[test]
    fn test_export_to_writer() {
        let records = create_test_records();
        let mut buf = Vec::new();
        Exporter::new(&records)
            .export_to(&mut buf, ExportFormat::Text)
            .unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("=== Audit Log Export ==="));
    }

    #[cfg(not(feature = "serde_json"))]
    #[test]
    fn test_json_requires_feature() {
        let records = create_test_records();
        assert!(matches!(
            Exporter::new(&records).to_json(),
            Err(Error::ExportError(_))
        ));
    }
}
