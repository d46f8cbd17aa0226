//! Change-feed handlers: bounded search-stream and the SSE watch.
//!
//! # Purpose
//! Controllers list a collection with `search-stream`, remember the trailing
//! bookmark and then `watch` from it. Both span tenants unless the caller
//! scopes search-stream with `tenant_id`.
//!
//! # Key invariants
//! - A search-stream response always ends with exactly one bookmark.
//! - Closing the watch connection stops the server-side poll loop.
use crate::api::error::{ApiError, api_store_error, api_validation_error};
use crate::api::{optional_i64, search_filter};
use crate::app::AppState;
use crate::engine::WatchEvent;
use crate::model::ResourceKind;
use crate::store::StoreError;
use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::convert::Infallible;

const TENANT_ID: &str = "tenant_id";
const AFTER_VERSION: &str = "after_version";

pub(crate) async fn search_stream<K: ResourceKind>(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Json<Vec<WatchEvent<K>>>, ApiError> {
    let filter = search_filter(&params, &[TENANT_ID])?;
    let tenant_id = params.get(TENANT_ID).map(String::as_str);
    state
        .feed::<K>()
        .search_stream(tenant_id, &filter)
        .await
        .map(Json)
        .map_err(|err| api_store_error(&err))
}

pub(crate) async fn watch<K: ResourceKind>(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if let Some(unknown) = params.keys().find(|key| key.as_str() != AFTER_VERSION) {
        return Err(api_validation_error(&format!(
            "unsupported query parameter {unknown}"
        )));
    }
    let after = optional_i64(&params, AFTER_VERSION)?.unwrap_or(0);
    if after < 0 {
        return Err(api_validation_error("after_version must not be negative"));
    }
    tracing::debug!(kind = K::KIND, after, "watch connection opened");
    let events = state
        .feed::<K>()
        .subscribe(after)
        .map(|item| Ok(item.map_or_else(|err| error_event(&err), |event| sse_event(&event))));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event<K: ResourceKind>(event: &WatchEvent<K>) -> Event {
    let encoded = Event::default()
        .event(event.label())
        .id(event.resource_version().to_string())
        .json_data(event);
    match encoded {
        Ok(sse) => sse,
        Err(err) => {
            tracing::error!(kind = K::KIND, error = %err, "watch event encoding failed");
            Event::default().event("error").data("internal error")
        }
    }
}

/// The feed stops after reporting an error, so this is the last event the
/// client sees before the stream closes.
fn error_event(err: &StoreError) -> Event {
    let body = api_store_error(err).body;
    Event::default()
        .event("error")
        .json_data(&body)
        .unwrap_or_else(|_| Event::default().event("error").data(body.message))
}
