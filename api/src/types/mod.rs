use serde::{Deserialize, Serialize};

#[derive(Deserialize, Default)]
pub struct StatsQuery {
    pub region: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct InitQuery {
    pub token: Option<String>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeasurementResponse {
    pub recorded: bool,
    pub key: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeResponse {
    pub message: String,
    pub measurements: usize,
    pub rollups: usize,
    pub elapsed_ms: u64,
}
