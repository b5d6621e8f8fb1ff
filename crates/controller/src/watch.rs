//! NodePool watcher feeding the preference controller

use controller_lib::controller::{NodePoolEvent, PreferenceController};
use controller_lib::health::{components, HealthRegistry};
use controller_lib::NodePoolRef;
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

const NODEPOOL_GROUP: &str = "karpenter.sh";
const NODEPOOL_VERSION: &str = "v1";
const NODEPOOL_KIND: &str = "NodePool";

pub fn nodepool_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        NODEPOOL_GROUP,
        NODEPOOL_VERSION,
        NODEPOOL_KIND,
    ))
}

/// Cluster-scoped NodePool API, read untyped
pub fn nodepool_api(client: Client) -> Api<DynamicObject> {
    Api::all_with(client, &nodepool_resource())
}

pub fn to_nodepool_ref(obj: &DynamicObject) -> NodePoolRef {
    NodePoolRef {
        name: obj.name_any(),
        uid: obj.uid(),
        annotations: obj.annotations().clone(),
    }
}

pub fn map_event(event: watcher::Event<DynamicObject>) -> NodePoolEvent {
    match event {
        watcher::Event::Applied(obj) => NodePoolEvent::Applied(to_nodepool_ref(&obj)),
        watcher::Event::Deleted(obj) => NodePoolEvent::Deleted(to_nodepool_ref(&obj)),
        watcher::Event::Restarted(objs) => {
            NodePoolEvent::Restarted(objs.iter().map(to_nodepool_ref).collect())
        }
    }
}

/// Watch NodePools until shutdown. Stream errors are retried by the
/// watcher's backoff; a failed pass is retried on the next event.
pub async fn run(
    api: Api<DynamicObject>,
    controller: Arc<PreferenceController>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Starting NodePool watcher");
    let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    let event = map_event(event);
                    debug!(?event, "NodePool event");
                    match controller.handle_event(event).await {
                        Ok(_) => health.set_healthy(components::PREFERENCE_WATCHER).await,
                        Err(e) => {
                            warn!(error = %e, "Preference reconcile failed");
                            health
                                .set_degraded(components::PREFERENCE_WATCHER, e.to_string())
                                .await;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "NodePool watch error");
                    health
                        .set_degraded(components::PREFERENCE_WATCHER, format!("watch error: {}", e))
                        .await;
                }
                None => {
                    warn!("NodePool watch stream ended");
                    health
                        .set_unhealthy(components::PREFERENCE_WATCHER, "watch stream ended")
                        .await;
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!("Shutting down NodePool watcher");
                break;
            }
        }
    }
}
