//! Core data models used throughout the harvest pipeline.
//!
//! One record type covers every source; the source discriminator and the
//! optional `type_data` select behaviour (Part/Monograph for books,
//! dataset/dataverse for SciELO Data).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Which external protocol a record was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Preprint,
    Book,
    Dataset,
}

impl RecordSource {
    pub const ALL: [RecordSource; 3] = [
        RecordSource::Preprint,
        RecordSource::Book,
        RecordSource::Dataset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::Preprint => "preprint",
            RecordSource::Book => "book",
            RecordSource::Dataset => "dataset",
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "preprint" | "preprints" => Ok(RecordSource::Preprint),
            "book" | "books" => Ok(RecordSource::Book),
            "dataset" | "datasets" | "scielo_data" => Ok(RecordSource::Dataset),
            other => anyhow::bail!(
                "Unknown source: '{}'. Must be preprints, books, or datasets.",
                other
            ),
        }
    }
}

/// Harvest and index status share the same four states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Success => "success",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            other => anyhow::bail!("Unknown status: '{}'", other),
        }
    }
}

pub const BOOK_PART: &str = "Part";
pub const BOOK_MONOGRAPH: &str = "Monograph";
pub const DATA_DATASET: &str = "dataset";
pub const DATA_DATAVERSE: &str = "dataverse";

/// Selects the raw index a record is projected into and the transformation
/// scripts it triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HarvestModel {
    #[serde(rename = "HarvestedPreprint")]
    Preprint,
    #[serde(rename = "HarvestedBooks")]
    Books,
    #[serde(rename = "HarvestedSciELOData_dataset")]
    DataDataset,
    #[serde(rename = "HarvestedSciELOData_dataverse")]
    DataDataverse,
}

impl HarvestModel {
    pub const ALL: [HarvestModel; 4] = [
        HarvestModel::Preprint,
        HarvestModel::Books,
        HarvestModel::DataDataset,
        HarvestModel::DataDataverse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestModel::Preprint => "HarvestedPreprint",
            HarvestModel::Books => "HarvestedBooks",
            HarvestModel::DataDataset => "HarvestedSciELOData_dataset",
            HarvestModel::DataDataverse => "HarvestedSciELOData_dataverse",
        }
    }

    /// Resolves the model for a record. Datasets are discriminated by
    /// `type_data`; a dataset record without one has no model.
    pub fn for_record(source: RecordSource, type_data: Option<&str>) -> Option<HarvestModel> {
        match source {
            RecordSource::Preprint => Some(HarvestModel::Preprint),
            RecordSource::Book => Some(HarvestModel::Books),
            RecordSource::Dataset => match type_data {
                Some(DATA_DATASET) => Some(HarvestModel::DataDataset),
                Some(DATA_DATAVERSE) => Some(HarvestModel::DataDataverse),
                _ => None,
            },
        }
    }
}

impl fmt::Display for HarvestModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvestModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        HarvestModel::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown harvest model: '{}'. Must be one of: {}",
                    s,
                    HarvestModel::ALL.map(|m| m.as_str()).join(", ")
                )
            })
    }
}

/// A harvested record as stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestedRecord {
    pub id: String,
    pub source: RecordSource,
    pub identifier: String,
    pub source_url: Option<String>,
    pub raw_data: Value,
    pub datestamp: Option<i64>,
    pub harvest_status: Status,
    pub index_status: Status,
    /// Incremented each time a harvest attempt starts.
    pub harvest_attempt: i64,
    pub last_harvest_attempt: Option<i64>,
    pub indexed_at: Option<i64>,
    pub index_name: Option<String>,
    pub type_data: Option<String>,
    pub parent_id: Option<String>,
    pub last_seq: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl HarvestedRecord {
    pub fn harvest_model(&self) -> Option<HarvestModel> {
        HarvestModel::for_record(self.source, self.type_data.as_deref())
    }

    /// Null, empty objects, and empty arrays carry nothing worth indexing.
    pub fn has_raw_data(&self) -> bool {
        match &self.raw_data {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

/// One failing field of one attempt, before it is written to the store.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub field_name: String,
    pub exception_type: String,
    pub message: String,
    pub traceback: String,
    pub context_data: Value,
    pub occurred_at: i64,
}

/// A persisted error-log row.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLog {
    pub id: i64,
    pub record_id: String,
    pub attempt: i64,
    pub field_name: String,
    pub exception_type: String,
    pub message: String,
    pub traceback: String,
    pub context_data: Value,
    pub occurred_at: i64,
    pub is_resolved: bool,
    pub resolved_at: Option<i64>,
}

/// A user-managed reindex script that projects a raw index into a curated one.
#[derive(Debug, Clone, Serialize)]
pub struct TransformationScript {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub harvest_model: HarvestModel,
    pub source_index: String,
    pub dest_index: String,
    /// Query template with an `{{identifier}}` placeholder.
    pub query_script: Option<String>,
    pub transform_script: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_harvest_model_for_dataset_requires_type() {
        assert_eq!(
            HarvestModel::for_record(RecordSource::Dataset, Some("dataverse")),
            Some(HarvestModel::DataDataverse)
        );
        assert_eq!(HarvestModel::for_record(RecordSource::Dataset, None), None);
        assert_eq!(
            HarvestModel::for_record(RecordSource::Book, Some("Part")),
            Some(HarvestModel::Books)
        );
    }

    #[test]
    fn test_harvest_model_parse() {
        let m: HarvestModel = "HarvestedSciELOData_dataset".parse().unwrap();
        assert_eq!(m, HarvestModel::DataDataset);
        assert!("HarvestedThings".parse::<HarvestModel>().is_err());
    }

    #[test]
    fn test_has_raw_data() {
        let mut rec = HarvestedRecord {
            id: "x".into(),
            source: RecordSource::Preprint,
            identifier: "oai:1".into(),
            source_url: None,
            raw_data: json!({}),
            datestamp: None,
            harvest_status: Status::Pending,
            index_status: Status::Pending,
            harvest_attempt: 0,
            last_harvest_attempt: None,
            indexed_at: None,
            index_name: None,
            type_data: None,
            parent_id: None,
            last_seq: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!rec.has_raw_data());
        rec.raw_data = json!({"title": []});
        assert!(rec.has_raw_data());
    }
}
