//! Snapshot reads and ordered change notifications for one resource kind.
//!
//! # Purpose
//! `search_stream` returns a consistent snapshot followed by a bookmark. A
//! watch started from that bookmark delivers every later change, in
//! `resource_version` order, with no gap between snapshot and watch.
//!
//! # Key invariants
//! - A poll covers the half-open window `(after, upto]` where `upto` is the
//!   table maximum read before the window query.
//! - When a page is truncated by the limit, the next poll resumes from the
//!   last delivered version, never from `upto`.
//! - Every poll ends with a bookmark carrying the position to resume from.
use crate::config::DEFAULT_CHANGES_LIMIT;
use crate::engine::versioned::VersionedStore;
use crate::model::{Record, ResourceKind, SearchFilter};
use crate::observability;
use crate::store::{RecordBackend, StoreResult};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", bound = "")]
pub enum WatchEvent<K: ResourceKind> {
    #[serde(rename = "UPDATED")]
    Updated { object: Record<K> },
    #[serde(rename = "DELETED")]
    Deleted { object: Record<K> },
    #[serde(rename = "BOOKMARK")]
    Bookmark {
        #[serde(rename = "resourceVersion")]
        resource_version: i64,
    },
}

impl<K: ResourceKind> WatchEvent<K> {
    pub fn resource_version(&self) -> i64 {
        match self {
            WatchEvent::Updated { object } | WatchEvent::Deleted { object } => {
                object.metadata.resource_version
            }
            WatchEvent::Bookmark { resource_version } => *resource_version,
        }
    }

    pub fn is_bookmark(&self) -> bool {
        matches!(self, WatchEvent::Bookmark { .. })
    }

    /// Lowercase event name, used as the SSE event type and metric label.
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Updated { .. } => "updated",
            WatchEvent::Deleted { .. } => "deleted",
            WatchEvent::Bookmark { .. } => "bookmark",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeedConfig {
    pub poll_interval: Duration,
    /// Maximum rows per poll; zero means [`DEFAULT_CHANGES_LIMIT`].
    pub page_limit: u64,
}

/// Result of one poll. `events` always ends with a bookmark at `resume_from`.
#[derive(Debug)]
pub struct WatchPage<K: ResourceKind> {
    pub events: Vec<WatchEvent<K>>,
    pub resume_from: i64,
    /// The window was truncated; more changes are ready immediately.
    pub truncated: bool,
}

pub struct ChangeFeed<K: ResourceKind> {
    backend: Arc<dyn RecordBackend>,
    config: FeedConfig,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> Clone for ChangeFeed<K> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config,
            _kind: PhantomData,
        }
    }
}

impl<K: ResourceKind> ChangeFeed<K> {
    pub fn new(backend: Arc<dyn RecordBackend>, config: FeedConfig) -> Self {
        Self {
            backend,
            config,
            _kind: PhantomData,
        }
    }

    /// Active records matching `filter` as of one version, then a bookmark at
    /// that version. `tenant_id = None` spans all tenants.
    pub async fn search_stream(
        &self,
        tenant_id: Option<&str>,
        filter: &SearchFilter,
    ) -> StoreResult<Vec<WatchEvent<K>>> {
        let snapshot = self.backend.max_version(K::TABLE).await?;
        let rows = self
            .backend
            .search_active(K::TABLE, tenant_id, &filter.to_document(), Some(snapshot))
            .await?;
        let mut events = Vec::with_capacity(rows.len() + 1);
        for row in rows {
            events.push(WatchEvent::Updated {
                object: VersionedStore::<K>::decode(row)?,
            });
        }
        events.push(WatchEvent::Bookmark {
            resource_version: snapshot,
        });
        Ok(events)
    }

    /// One pass over the changes after `after`.
    pub async fn poll(&self, after: i64) -> StoreResult<WatchPage<K>> {
        let limit = match self.config.page_limit {
            0 => DEFAULT_CHANGES_LIMIT,
            limit => limit,
        };
        let upto = self.backend.max_version(K::TABLE).await?.max(after);
        let rows = self.backend.changes(K::TABLE, after, upto, limit).await?;
        let truncated = !rows.is_empty() && rows.len() as u64 >= limit;
        let resume_from = if truncated {
            rows.last().map(|row| row.resource_version).unwrap_or(upto)
        } else {
            upto
        };

        let mut events = Vec::with_capacity(rows.len() + 1);
        for row in rows {
            let active = row.is_active();
            let object = VersionedStore::<K>::decode(row)?;
            events.push(if active {
                WatchEvent::Updated { object }
            } else {
                WatchEvent::Deleted { object }
            });
        }
        events.push(WatchEvent::Bookmark {
            resource_version: resume_from,
        });
        Ok(WatchPage {
            events,
            resume_from,
            truncated,
        })
    }

    /// Deliver changes after `after` into `sender` until `cancel` fires, the
    /// receiver goes away, or the backend fails. A backend error is sent to
    /// the receiver before returning.
    pub async fn watch(
        &self,
        after: i64,
        sender: mpsc::Sender<StoreResult<WatchEvent<K>>>,
        cancel: CancellationToken,
    ) {
        let table = K::TABLE.as_str();
        let mut position = after;
        tracing::debug!(table, after, "watch started");
        loop {
            let page = tokio::select! {
                _ = cancel.cancelled() => break,
                page = self.poll(position) => page,
            };
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(table, position, error = %err, "watch poll failed");
                    let _ = sender.send(Err(err)).await;
                    break;
                }
            };
            position = page.resume_from;
            for event in page.events {
                metrics::counter!(observability::WATCH_EVENTS, "table" => table, "type" => event.label())
                    .increment(1);
                if sender.send(Ok(event)).await.is_err() {
                    tracing::debug!(table, position, "watch receiver dropped");
                    return;
                }
            }
            if page.truncated {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(table, position, "watch stopped");
    }

    /// Spawn a watch task and return its event stream. Dropping the stream
    /// stops the task.
    pub fn subscribe(&self, after: i64) -> WatchSubscription<K> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let feed = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { feed.watch(after, sender, token).await });
        WatchSubscription {
            events: ReceiverStream::new(receiver),
            _guard: cancel.drop_guard(),
        }
    }
}

pub struct WatchSubscription<K: ResourceKind> {
    events: ReceiverStream<StoreResult<WatchEvent<K>>>,
    _guard: DropGuard,
}

impl<K: ResourceKind> Stream for WatchSubscription<K> {
    type Item = StoreResult<WatchEvent<K>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
