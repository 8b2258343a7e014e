use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cycle::CycleRecord;
use crate::state_metadata::StateMetaData;
use crate::PublicKey;

/// Kinds of data a consensus node can push to a subscribed archiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "CYCLE")]
    Cycle,
    #[serde(rename = "STATE_METADATA")]
    StateMetadata,
}

impl DataType {
    pub const ALL: [DataType; 2] = [DataType::Cycle, DataType::StateMetadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Cycle => "CYCLE",
            DataType::StateMetadata => "STATE_METADATA",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown data type {0:?}")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CYCLE" => Ok(DataType::Cycle),
            "STATE_METADATA" => Ok(DataType::StateMetadata),
            other => Err(UnknownDataType(other.to_string())),
        }
    }
}

/// Subscription request sent to a data sender, tagged for that sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Last counter we already hold; the sender streams everything after it.
    pub last_data: Option<u64>,
}

/// Body of a `DATA` push. Authenticated as a raw JSON value before it is
/// parsed into this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    /// Payload lists keyed by data type name. Unknown keys are kept so the
    /// acceptance filter can reject them.
    pub responses: BTreeMap<String, Value>,
    pub recipient: PublicKey,
    pub public_key: PublicKey,
}

impl DataResponse {
    /// Data types present in this push.
    pub fn data_types(&self) -> Result<Vec<DataType>, UnknownDataType> {
        self.responses.keys().map(|k| k.parse()).collect()
    }

    pub fn cycles(&self) -> Result<Vec<CycleRecord>, serde_json::Error> {
        self.list(DataType::Cycle)
    }

    pub fn state_metadata(&self) -> Result<Vec<StateMetaData>, serde_json::Error> {
        self.list(DataType::StateMetadata)
    }

    fn list<T: serde::de::DeserializeOwned>(&self, ty: DataType) -> Result<Vec<T>, serde_json::Error> {
        match self.responses.get(ty.as_str()) {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(Vec::new()),
        }
    }
}
