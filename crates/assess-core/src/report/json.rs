//! JSON snapshot encoding

use super::VerdictSnapshot;
use crate::CoreResult;

pub fn generate(snapshot: &VerdictSnapshot) -> CoreResult<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

pub fn parse(data: &str) -> CoreResult<VerdictSnapshot> {
    Ok(serde_json::from_str(data)?)
}
