//! Audit trail of lossy operations.
//!
//! Every truncation, compaction, and instruction trim leaves an entry here.
//! Entries are append-only. For persistence each entry flattens to a
//! [`FlatAuditRecord`] (timestamp, kind, before/after sizes) and the trail
//! exports as JSON Lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::truncate::TruncationRecord;
use crate::instructions::InstructionTrim;

/// What a compaction did, without the summary text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompactionRecord {
    pub first_index: usize,
    pub last_index: usize,
    pub replaced_items: usize,
    pub original_tokens: usize,
    pub summary_tokens: usize,
    /// Tool items removed afterwards because their partner was gone.
    pub dropped_orphans: usize,
    pub created_at: DateTime<Utc>,
}

/// One lossy operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Truncation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        record: TruncationRecord,
    },
    Compaction(CompactionRecord),
    InstructionTrim(InstructionTrim),
}

impl AuditEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEntry::Truncation { .. } => "truncation",
            AuditEntry::Compaction(_) => "compaction",
            AuditEntry::InstructionTrim(_) => "instruction_trim",
        }
    }

    /// Flatten to the persisted record shape. Truncations and instruction
    /// trims are measured in bytes, compactions in tokens.
    pub fn to_flat(&self) -> FlatAuditRecord {
        let (timestamp, before, after, unit) = match self {
            AuditEntry::Truncation { record, .. } => (
                record.created_at,
                record.original_bytes,
                record.retained_bytes,
                SizeUnit::Bytes,
            ),
            AuditEntry::Compaction(c) => (
                c.created_at,
                c.original_tokens,
                c.summary_tokens,
                SizeUnit::Tokens,
            ),
            AuditEntry::InstructionTrim(t) => (
                t.trimmed_at,
                t.original_bytes,
                t.retained_bytes,
                SizeUnit::Bytes,
            ),
        };
        FlatAuditRecord {
            timestamp,
            kind: self.kind().to_string(),
            before,
            after,
            unit,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Bytes,
    Tokens,
}

/// Persisted audit row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FlatAuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub before: usize,
    pub after: usize,
    pub unit: SizeUnit,
}

/// Append-only log of lossy operations for one session.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn truncations(&self) -> impl Iterator<Item = &TruncationRecord> {
        self.entries.iter().filter_map(|e| match e {
            AuditEntry::Truncation { record, .. } => Some(record),
            _ => None,
        })
    }

    pub fn compactions(&self) -> impl Iterator<Item = &CompactionRecord> {
        self.entries.iter().filter_map(|e| match e {
            AuditEntry::Compaction(c) => Some(c),
            _ => None,
        })
    }

    pub fn flat_records(&self) -> Vec<FlatAuditRecord> {
        self.entries.iter().map(AuditEntry::to_flat).collect()
    }

    /// One JSON object per line, one line per entry.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for record in self.flat_records() {
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }
}
