//! Live channel addressing for streaming targets.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Serialize;

pub const CHANNEL_NAMESPACE: &str = "mongodb-datasource";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChannel {
    pub ref_id: String,
    pub path: String,
}

/// Channel for a streaming target, keyed by what it watches.
pub fn pipeline_channel(collection: &str, pipeline_text: &str) -> String {
    format!(
        "{CHANNEL_NAMESPACE}/{}-{}",
        URL_SAFE_NO_PAD.encode(collection),
        URL_SAFE_NO_PAD.encode(pipeline_text)
    )
}

/// Channel for a target of a live-streaming request.
pub fn live_channel(ref_id: &str) -> String {
    format!("{CHANNEL_NAMESPACE}/{ref_id}")
}
