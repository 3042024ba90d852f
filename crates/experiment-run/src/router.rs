//! Mapping pod and Run notifications to Run keys

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use tracing::{debug, trace};

use experiment_common::crd::Run;
use experiment_common::keys::object_key;
use experiment_common::RUN_NAME_LABEL;

use crate::informer::ObjectEvent;

/// Resolves which Run a pod notification concerns
#[derive(Clone, Debug)]
pub struct EventRouter {
    owner_label: String,
    reconcile_on_delete: bool,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(RUN_NAME_LABEL, true)
    }
}

impl EventRouter {
    /// Create a router reading ownership from `owner_label`
    pub fn new(owner_label: impl Into<String>, reconcile_on_delete: bool) -> Self {
        Self {
            owner_label: owner_label.into(),
            reconcile_on_delete,
        }
    }

    /// Key of the Run owning `pod`, or `None` for pods that belong to no Run
    pub fn resolve_owner_key(&self, pod: &Pod) -> Option<String> {
        let namespace = pod.namespace()?;
        match pod.labels().get(&self.owner_label) {
            Some(run) if !run.is_empty() => {
                let key = object_key(&namespace, run);
                trace!(pod = %pod.name_any(), run = %key, "pod change mapped to run");
                Some(key)
            }
            _ => None,
        }
    }

    /// Key to enqueue for a pod notification, if any
    pub fn route_pod(&self, event: &ObjectEvent<Pod>) -> Option<String> {
        match event {
            ObjectEvent::Added(pod) => self.resolve_owner_key(pod),
            ObjectEvent::Updated { old, new } => {
                if same_version(&**old, &**new) {
                    return None;
                }
                self.resolve_owner_key(new)
            }
            ObjectEvent::Deleted(pod) if self.reconcile_on_delete => {
                debug!(pod = %pod.name_any(), "pod deleted");
                self.resolve_owner_key(pod)
            }
            ObjectEvent::Deleted(_) => None,
        }
    }
}

/// Key to enqueue for a Run notification.
///
/// Deleted Runs have nothing left to converge.
pub fn route_run(event: &ObjectEvent<Run>) -> Option<String> {
    let run = match event {
        ObjectEvent::Added(run) => run,
        ObjectEvent::Updated { old, new } if !same_version(&**old, &**new) => new,
        ObjectEvent::Updated { .. } | ObjectEvent::Deleted(_) => return None,
    };
    Some(object_key(&run.namespace()?, &run.name_any()))
}

/// Two snapshots with the same resource version are the same object state
fn same_version<K: Resource>(old: &K, new: &K) -> bool {
    old.meta().resource_version == new.meta().resource_version
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_common::crd::RunSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn pod(owner: Option<&str>, rv: &str) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some("mnist-1-worker-0".to_string()),
                namespace: Some("team-a".to_string()),
                resource_version: Some(rv.to_string()),
                labels: owner.map(|o| [(RUN_NAME_LABEL.to_string(), o.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn run(rv: &str) -> Arc<Run> {
        let mut run = Run::new("mnist-1", RunSpec::default());
        run.metadata.namespace = Some("team-a".to_string());
        run.metadata.resource_version = Some(rv.to_string());
        Arc::new(run)
    }

    #[test]
    fn owner_label_resolves_to_namespaced_key() {
        let router = EventRouter::default();
        assert_eq!(
            router.resolve_owner_key(&pod(Some("mnist-1"), "1")),
            Some("team-a/mnist-1".to_string())
        );
    }

    #[test]
    fn unowned_pods_are_ignored() {
        let router = EventRouter::default();
        assert_eq!(router.resolve_owner_key(&pod(None, "1")), None);
        assert_eq!(router.resolve_owner_key(&pod(Some(""), "1")), None);
    }

    #[test]
    fn owner_label_key_is_configurable() {
        let router = EventRouter::new("experiments.example.com/run", true);
        assert_eq!(router.resolve_owner_key(&pod(Some("mnist-1"), "1")), None);

        let mut labelled = (*pod(None, "1")).clone();
        labelled.metadata.labels = Some(
            [("experiments.example.com/run".to_string(), "mnist-9".to_string())].into(),
        );
        assert_eq!(
            router.resolve_owner_key(&labelled),
            Some("team-a/mnist-9".to_string())
        );
    }

    #[test]
    fn pod_add_is_routed() {
        let router = EventRouter::default();
        let event = ObjectEvent::Added(pod(Some("mnist-1"), "1"));
        assert_eq!(router.route_pod(&event), Some("team-a/mnist-1".to_string()));
    }

    #[test]
    fn pod_update_is_routed_only_when_version_changes() {
        let router = EventRouter::default();

        let resync = ObjectEvent::Updated {
            old: pod(Some("mnist-1"), "7"),
            new: pod(Some("mnist-1"), "7"),
        };
        assert_eq!(router.route_pod(&resync), None);

        let changed = ObjectEvent::Updated {
            old: pod(Some("mnist-1"), "7"),
            new: pod(Some("mnist-1"), "8"),
        };
        assert_eq!(router.route_pod(&changed), Some("team-a/mnist-1".to_string()));
    }

    #[test]
    fn pod_delete_routing_is_configurable() {
        let event = ObjectEvent::Deleted(pod(Some("mnist-1"), "9"));
        assert_eq!(
            EventRouter::new(RUN_NAME_LABEL, true).route_pod(&event),
            Some("team-a/mnist-1".to_string())
        );
        assert_eq!(EventRouter::new(RUN_NAME_LABEL, false).route_pod(&event), None);
    }

    #[test]
    fn run_add_and_change_are_routed_but_not_delete() {
        assert_eq!(
            route_run(&ObjectEvent::Added(run("1"))),
            Some("team-a/mnist-1".to_string())
        );
        assert_eq!(
            route_run(&ObjectEvent::Updated {
                old: run("1"),
                new: run("2")
            }),
            Some("team-a/mnist-1".to_string())
        );
        assert_eq!(
            route_run(&ObjectEvent::Updated {
                old: run("2"),
                new: run("2")
            }),
            None
        );
        assert_eq!(route_run(&ObjectEvent::Deleted(run("3"))), None);
    }
}
