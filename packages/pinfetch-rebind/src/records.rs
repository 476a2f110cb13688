//! Static records answered ahead of the rebinding logic

use std::{collections::HashMap, net::IpAddr, path::Path};

use anyhow::Context;
use serde::Deserialize;

/// Maximum number of CNAME records followed for a single lookup
const MAX_CNAME_DEPTH: usize = 8;

/// Type of a static record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    /// IPv4 address
    A,
    /// IPv6 address
    Aaaa,
    /// Alias for another name
    Cname,
    /// Text, carries no address
    Txt,
}

/// Single static record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordConfig {
    /// Type of the record
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Value of the record
    pub value: String,
}

impl RecordConfig {
    /// Create a new record
    pub fn new(record_type: RecordType, value: impl Into<String>) -> Self {
        Self {
            record_type,
            value: value.into(),
        }
    }
}

/// Records for a name may be written as one record or a list of records
#[derive(Deserialize)]
#[serde(untagged)]
enum RecordList {
    Many(Vec<RecordConfig>),
    One(RecordConfig),
}

impl From<RecordList> for Vec<RecordConfig> {
    fn from(value: RecordList) -> Self {
        match value {
            RecordList::Many(records) => records,
            RecordList::One(record) => vec![record],
        }
    }
}

#[derive(Deserialize)]
struct RecordsFile {
    #[serde(default, alias = "record")]
    records: HashMap<String, RecordList>,
}

impl From<RecordsFile> for StaticRecords {
    fn from(value: RecordsFile) -> Self {
        let records = value
            .records
            .into_iter()
            .map(|(name, records)| (normalize_name(&name), records.into()))
            .collect();

        StaticRecords { records }
    }
}

/// Answer from the static records for a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticAnswer {
    /// Addresses found for the name (possibly after following aliases)
    Addresses(Vec<IpAddr>),
    /// Name is an alias for a name that has no static records
    Alias(String),
    /// Name has static records but none of them carry an address
    NoAddresses,
}

/// Collection of static records keyed by name
#[derive(Debug, Default, Clone)]
pub struct StaticRecords {
    records: HashMap<String, Vec<RecordConfig>>,
}

impl StaticRecords {
    /// Load records from the file at `path`, no path means no records
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, anything else
    /// as JSON
    pub fn load(path: Option<&Path>) -> anyhow::Result<StaticRecords> {
        let Some(path) = path else {
            return Ok(StaticRecords::default());
        };

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read records file {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| {
                extension.eq_ignore_ascii_case("yaml") || extension.eq_ignore_ascii_case("yml")
            });

        let records = if is_yaml {
            Self::from_yaml(&data)
        } else {
            Self::from_json(&data)
        };

        records.with_context(|| format!("failed to load records file {}", path.display()))
    }

    /// Parse records from JSON in the form `{"records": {"name": record-or-list}}`
    pub fn from_json(data: &str) -> anyhow::Result<StaticRecords> {
        let file: RecordsFile = serde_json::from_str(data).context("failed to parse records")?;
        Ok(file.into())
    }

    /// Parse records from YAML, names are listed under a top level `record`
    /// (or `records`) key
    pub fn from_yaml(data: &str) -> anyhow::Result<StaticRecords> {
        let file: RecordsFile = serde_yaml::from_str(data).context("failed to parse records")?;
        Ok(file.into())
    }

    /// Add a record for `name`
    pub fn with_record(mut self, name: &str, record: RecordConfig) -> Self {
        self.records
            .entry(normalize_name(name))
            .or_default()
            .push(record);
        self
    }

    /// Records for `name`
    pub fn get(&self, name: &str) -> Option<&[RecordConfig]> {
        self.records.get(&normalize_name(name)).map(Vec::as_slice)
    }

    /// Number of names with records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Answer `name` from the static records, [None] when the name has no
    /// static records at all
    pub fn lookup(&self, name: &str) -> Option<StaticAnswer> {
        let mut name = normalize_name(name);
        let mut records = self.records.get(&name)?;

        for _ in 0..=MAX_CNAME_DEPTH {
            let addresses = addresses(&name, records);
            if !addresses.is_empty() {
                return Some(StaticAnswer::Addresses(addresses));
            }

            let Some(alias) = records
                .iter()
                .find(|record| record.record_type == RecordType::Cname)
            else {
                return Some(StaticAnswer::NoAddresses);
            };

            name = normalize_name(&alias.value);
            records = match self.records.get(&name) {
                Some(value) => value,
                None => return Some(StaticAnswer::Alias(name)),
            };
        }

        tracing::warn!(%name, "cname chain exceeded maximum depth");
        Some(StaticAnswer::NoAddresses)
    }
}

/// Addresses from the A and AAAA records, values that are not an address of
/// the record family are skipped
fn addresses(name: &str, records: &[RecordConfig]) -> Vec<IpAddr> {
    records
        .iter()
        .filter_map(|record| {
            let expected_v4 = match record.record_type {
                RecordType::A => true,
                RecordType::Aaaa => false,
                RecordType::Cname | RecordType::Txt => return None,
            };

            match record.value.parse::<IpAddr>() {
                Ok(address) if address.is_ipv4() == expected_v4 => Some(address),
                _ => {
                    tracing::warn!(
                        %name,
                        value = %record.value,
                        record_type = ?record.record_type,
                        "error parsing static record address"
                    );
                    None
                }
            }
        })
        .collect()
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
