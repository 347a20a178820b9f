use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD};
pub use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use serde::Deserialize;

pub const ASSET_RECORD_TYPE: &str = "CPLAsset";
pub const MASTER_RECORD_TYPE: &str = "CPLMaster";

#[derive(Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Deserialize)]
pub struct Record {
    #[serde(rename = "recordName")]
    pub record_name: String,
    #[serde(rename = "recordType")]
    pub record_type: String,
    #[serde(rename = "recordChangeTag")]
    pub record_change_tag: Option<String>,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Deserialize, Default)]
pub struct Fields {
    #[serde(rename = "masterRef")]
    pub master_ref: Option<Field<Reference>>,
    #[serde(rename = "assetDate")]
    pub asset_date: Option<Field<i64>>,
    #[serde(rename = "filenameEnc")]
    pub filename_enc: Option<Field<String>>,
    #[serde(rename = "resOriginalRes")]
    pub res_original_res: Option<Field<Resource>>,
    pub state: Option<Field<String>>,
}

#[derive(Deserialize)]
pub struct Field<T> {
    pub value: T,
}

#[derive(Deserialize)]
pub struct Reference {
    #[serde(rename = "recordName")]
    pub record_name: String,
}

#[derive(Deserialize)]
pub struct Resource {
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
    pub size: Option<u64>,
}

#[derive(Deserialize)]
pub struct ModifyResponse {
    #[serde(default)]
    pub records: Vec<ModifiedRecord>,
}

#[derive(Deserialize)]
pub struct ModifiedRecord {
    #[serde(rename = "recordName")]
    pub record_name: Option<String>,
    #[serde(rename = "serverErrorCode")]
    pub server_error_code: Option<String>,
    pub reason: Option<String>,
}

impl ModifyResponse {
    /// CloudKit reports per-record failures in a 200 response.
    pub fn first_error(&self) -> Option<String> {
        self.records.iter().find_map(|record| {
            let code = record.server_error_code.as_ref()?;
            Some(format!(
                "{name}: {code} {reason}",
                name = record.record_name.as_deref().unwrap_or("record"),
                reason = record.reason.as_deref().unwrap_or_default()
            ))
        })
    }
}

/// A photo or video in the remote library, joined from its asset and master records.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: String,
    pub record_type: String,
    pub change_tag: Option<String>,
    pub filename: String,
    pub created: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub download_url: String,
}

impl Asset {
    /// Calendar date of capture, in UTC.
    pub fn capture_date(&self) -> Option<NaiveDate> {
        self.created.map(|created| created.date_naive())
    }
}

/// One listing page: how many asset records the server returned, and the
/// ones that could be joined with a downloadable master.
pub struct Page {
    pub asset_records: usize,
    pub assets: Vec<Asset>,
}

impl Page {
    pub fn from_records(records: Vec<Record>) -> Page {
        let mut masters: HashMap<String, Record> = HashMap::new();
        let mut asset_records = Vec::new();
        for record in records {
            if record.record_type == MASTER_RECORD_TYPE {
                masters.insert(record.record_name.clone(), record);
            } else if record.record_type == ASSET_RECORD_TYPE {
                asset_records.push(record);
            }
        }

        let count = asset_records.len();
        let assets = asset_records
            .into_iter()
            .filter_map(|record| {
                let master_name = match &record.fields.master_ref {
                    Some(master_ref) => master_ref.value.record_name.as_str(),
                    None => {
                        warn!("Asset {} has no master reference, skipping.", record.record_name);
                        return None;
                    }
                };
                match masters.get(master_name) {
                    Some(master) => join(record, master),
                    None => {
                        warn!("Master {master_name} missing from page, skipping.");
                        None
                    }
                }
            })
            .collect();

        Page {
            asset_records: count,
            assets,
        }
    }
}

fn join(asset: Record, master: &Record) -> Option<Asset> {
    let original = master.fields.res_original_res.as_ref();
    let download_url = match original.and_then(|res| res.value.download_url.as_ref()) {
        Some(url) => url.clone(),
        None => {
            warn!("Master {} has no original download URL, skipping.", master.record_name);
            return None;
        }
    };

    let filename = master
        .fields
        .filename_enc
        .as_ref()
        .and_then(|encoded| decode_filename(&encoded.value))
        .unwrap_or_else(|| master.record_name.clone());

    Some(Asset {
        id: asset.record_name,
        record_type: asset.record_type,
        change_tag: asset.record_change_tag,
        filename,
        created: asset.fields.asset_date.and_then(|d| DateTime::from_timestamp_millis(d.value)),
        size: original.and_then(|res| res.value.size),
        download_url,
    })
}

fn decode_filename(encoded: &str) -> Option<String> {
    let bytes = STANDARD
        .decode(encoded)
        .inspect_err(|e| debug!("filenameEnc '{encoded}' is not base64: {e}"))
        .ok()?;
    String::from_utf8(bytes).ok().filter(|name| !name.is_empty())
}
