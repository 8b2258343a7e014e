use serde::{Deserialize, Serialize};

use crate::PublicKey;

/// A peer archiver, as listed in cycle records and in the bootstrap config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverNodeInfo {
    // Lowercase aliases: layered config sources fold key case.
    #[serde(alias = "publickey")]
    pub public_key: PublicKey,
    pub ip: String,
    pub port: u16,
    #[serde(default, alias = "curvepk", skip_serializing_if = "Option::is_none")]
    pub curve_pk: Option<String>,
}

impl ArchiverNodeInfo {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}
