use serde::Deserialize;
use serde_json::Value;

/// Body returned by the submission endpoints on success.
#[derive(Deserialize, Debug)]
pub struct SubmitResponse {
    pub id: i64,
}

/// Envelope used by the list endpoints; some deployments return a bare array.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum ListResponse {
    Wrapped { data: Vec<Value> },
    Bare(Vec<Value>),
}

impl ListResponse {
    pub fn into_items(self) -> Vec<Value> {
        match self {
            ListResponse::Wrapped { data } => data,
            ListResponse::Bare(items) => items,
        }
    }
}
