//! Keel kubehub: kube client, list+watch feeding the cache, and the write
//! side (status subresource updates, audit events).

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::StreamExt;
use keel_core::{ClientError, EventKind, EventRecorder, SampleResource, StatusClient};
use keel_store::CacheEvent;
use kube::{
    api::{Api, PostParams},
    runtime::{
        events::{Event as AuditEvent, EventType, Recorder, Reporter},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("inferring kube client from kubeconfig or in-cluster env")
}

/// SampleResource API scoped to `namespace`, or to all namespaces.
pub fn sample_api(client: Client, namespace: Option<&str>) -> Api<SampleResource> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

pub fn to_cache_event<K>(ev: Event<K>) -> CacheEvent<K> {
    match ev {
        Event::Applied(o) => CacheEvent::Applied(o),
        Event::Deleted(o) => CacheEvent::Deleted(o),
        Event::Restarted(list) => CacheEvent::Restarted(list),
    }
}

/// Run list+watch for `api` and forward events to the cache ingest loop.
/// Watch errors are retried with kube's default backoff; returns when
/// `token` is cancelled, the stream ends, or the ingest side is gone.
pub async fn start_informer<K>(api: Api<K>, tx: mpsc::Sender<CacheEvent<K>>, token: CancellationToken) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("informer started");
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                debug!("informer cancelled");
                break;
            }
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                counter!("watch_errors_total", 1);
                warn!(error = %e, "watch error; backing off");
                continue;
            }
            None => {
                warn!("watcher stream ended");
                break;
            }
        };
        if let Event::Restarted(list) = &ev {
            debug!(count = list.len(), "watch restart");
        }
        if tx.send(to_cache_event(ev)).await.is_err() {
            debug!("cache ingest closed; stopping informer");
            break;
        }
    }
    Ok(())
}

/// Map kube API failures onto the retryable client error kinds.
pub fn classify(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => ClientError::Conflict(resp.message),
            404 => ClientError::NotFound(resp.message),
            429 | 500..=599 => ClientError::Unavailable(resp.message),
            _ => ClientError::Rejected(format!("{} ({})", resp.message, resp.reason)),
        },
        other => ClientError::Unavailable(other.to_string()),
    }
}

/// Writes SampleResource status through the `/status` subresource. The
/// object's resourceVersion is sent along, so stale writes fail with 409.
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl StatusClient<SampleResource> for KubeStatusClient {
    async fn update_status(&self, obj: &SampleResource) -> Result<SampleResource, ClientError> {
        let name = obj.metadata.name.as_deref().ok_or_else(|| ClientError::Rejected("object has no name".into()))?;
        let ns = obj
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| ClientError::Rejected(format!("{} has no namespace", name)))?;
        let api: Api<SampleResource> = Api::namespaced(self.client.clone(), ns);
        let data = serde_json::to_vec(obj).map_err(|e| ClientError::Rejected(e.to_string()))?;
        api.replace_status(name, &PostParams::default(), data).await.map_err(classify)
    }
}

/// Publishes audit events as `events.k8s.io` records.
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// `instance` defaults to `$POD_NAME`, else a random id.
    pub fn new(client: Client, controller: &str) -> Self {
        let instance = std::env::var("POD_NAME").unwrap_or_else(|_| Uuid::new_v4().to_string());
        Self { client, reporter: Reporter { controller: controller.to_string(), instance: Some(instance) } }
    }
}

#[async_trait::async_trait]
impl<K> EventRecorder<K> for KubeEventRecorder
where
    K: Resource<DynamicType = ()> + Send + Sync,
{
    async fn record(&self, obj: &K, kind: EventKind, reason: &str, message: &str) -> Result<(), ClientError> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), obj.object_ref(&()));
        let type_ = match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        recorder
            .publish(AuditEvent {
                type_,
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await
            .map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::SampleResourceSpec;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn conflict_and_not_found_are_distinguished() {
        assert_eq!(classify(api_err(409, "Conflict")), ClientError::Conflict("Conflict happened".into()));
        assert_eq!(classify(api_err(404, "NotFound")), ClientError::NotFound("NotFound happened".into()));
    }

    #[test]
    fn throttling_and_server_errors_are_unavailable() {
        for code in [429, 500, 503] {
            assert!(matches!(classify(api_err(code, "X")), ClientError::Unavailable(_)), "code {code}");
        }
    }

    #[test]
    fn other_api_errors_are_rejected() {
        assert_eq!(
            classify(api_err(422, "Invalid")),
            ClientError::Rejected("Invalid happened (Invalid)".into())
        );
    }

    #[test]
    fn watcher_events_map_onto_cache_events() {
        let o = SampleResource::new("foo", SampleResourceSpec { name: "bar".into() });
        assert!(matches!(to_cache_event(Event::Applied(o.clone())), CacheEvent::Applied(_)));
        assert!(matches!(to_cache_event(Event::Deleted(o.clone())), CacheEvent::Deleted(_)));
        match to_cache_event(Event::Restarted(vec![o.clone(), o])) {
            CacheEvent::Restarted(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
