//! Control-plane HTTP API module.
//!
//! # Purpose
//! Route handler modules plus the query-string helpers they share: resource
//! id parsing, optional expected versions and search filters.
pub mod error;
pub mod feed;
pub mod instance_groups;
pub mod instances;
pub mod openapi;
pub mod ports;
pub mod resources;
pub mod subnets;
pub mod system;
pub mod types;

use crate::api::error::{ApiError, api_validation_error};
use crate::model::SearchFilter;
use nimbus_common::ids::ResourceId;
use serde_json::Value;
use std::collections::HashMap;

const LABEL_PREFIX: &str = "labels.";
const SPEC_PREFIX: &str = "spec.";

pub(crate) fn parse_resource_id(raw: &str) -> Result<ResourceId, ApiError> {
    raw.parse()
        .map_err(|_| api_validation_error("resource id must be a UUID"))
}

/// Optional integer query parameter; present but unparsable is an error.
pub(crate) fn optional_i64(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<Option<i64>, ApiError> {
    params
        .get(name)
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|_| api_validation_error(&format!("{name} must be an integer")))
        })
        .transpose()
}

/// Build a search filter from `labels.<key>=value` and `spec.<field>=value`
/// parameters. Spec values that parse as JSON numbers or booleans are
/// matched as such; anything else is a string. Names in `reserved` are
/// skipped; any other parameter is rejected.
pub(crate) fn search_filter(
    params: &HashMap<String, String>,
    reserved: &[&str],
) -> Result<SearchFilter, ApiError> {
    let mut filter = SearchFilter::default();
    for (key, value) in params {
        if let Some(label) = key.strip_prefix(LABEL_PREFIX) {
            if label.is_empty() {
                return Err(api_validation_error("empty label key in filter"));
            }
            filter = filter.with_label(label, value.clone());
        } else if let Some(field) = key.strip_prefix(SPEC_PREFIX) {
            if field.is_empty() {
                return Err(api_validation_error("empty spec field in filter"));
            }
            filter = filter.with_spec_field(field, filter_value(value));
        } else if !reserved.contains(&key.as_str()) {
            return Err(api_validation_error(&format!(
                "unsupported query parameter {key}"
            )));
        }
    }
    Ok(filter)
}

fn filter_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}
