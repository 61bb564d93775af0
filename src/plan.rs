// 📋 Merge Plans - batches of merges read from CSV
//
// entity_type,obsolete_id,surviving_id
// person,2,1
// dog,fido-uuid,rex-uuid
//
// Which records to merge is the caller's decision; a plan is just that
// decision written down.

use crate::record::Value;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct PlanRow {
    entity_type: String,
    obsolete_id: String,
    surviving_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeInstruction {
    pub entity_type: String,
    pub obsolete: Value,
    pub surviving: Value,
    /// 1-based data line in the source file, for error messages
    pub line: usize,
}

pub fn load_merge_plan(csv_path: &Path) -> Result<Vec<MergeInstruction>> {
    let rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open merge plan {}", csv_path.display()))?;
    read_merge_plan(rdr)
}

pub fn read_merge_plan<R: std::io::Read>(mut rdr: csv::Reader<R>) -> Result<Vec<MergeInstruction>> {
    let mut instructions = Vec::new();

    for (i, result) in rdr.deserialize().enumerate() {
        let row: PlanRow =
            result.with_context(|| format!("Failed to read merge plan row {}", i + 1))?;

        if row.entity_type.is_empty() {
            anyhow::bail!("Merge plan row {} has no entity_type", i + 1);
        }

        instructions.push(MergeInstruction {
            entity_type: row.entity_type,
            obsolete: Value::parse_identity(&row.obsolete_id),
            surviving: Value::parse_identity(&row.surviving_id),
            line: i + 1,
        });
    }

    Ok(instructions)
}

// ============================================================================
// TESTS
// ============================================================================
