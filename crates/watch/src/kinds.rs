//! Supported-kind catalogue.
//!
//! The catalogue is a single dispatch table; extending coverage means
//! adding a row here, nothing else.

use kube::core::ApiResource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSpec {
    /// Lowercase kind name used in monitor configs.
    pub name: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

impl KindSpec {
    pub fn api_resource(&self) -> ApiResource {
        let api_version = if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ApiResource {
            group: self.group.to_string(),
            version: self.version.to_string(),
            api_version,
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

pub const SUPPORTED_KINDS: &[KindSpec] = &[
    KindSpec { name: "pod", group: "", version: "v1", kind: "Pod", plural: "pods", namespaced: true },
    KindSpec { name: "replicationcontroller", group: "", version: "v1", kind: "ReplicationController", plural: "replicationcontrollers", namespaced: true },
    KindSpec { name: "service", group: "", version: "v1", kind: "Service", plural: "services", namespaced: true },
    KindSpec { name: "endpoints", group: "", version: "v1", kind: "Endpoints", plural: "endpoints", namespaced: true },
    KindSpec { name: "configmap", group: "", version: "v1", kind: "ConfigMap", plural: "configmaps", namespaced: true },
    KindSpec { name: "secret", group: "", version: "v1", kind: "Secret", plural: "secrets", namespaced: true },
    KindSpec { name: "serviceaccount", group: "", version: "v1", kind: "ServiceAccount", plural: "serviceaccounts", namespaced: true },
    KindSpec { name: "persistentvolumeclaim", group: "", version: "v1", kind: "PersistentVolumeClaim", plural: "persistentvolumeclaims", namespaced: true },
    KindSpec { name: "node", group: "", version: "v1", kind: "Node", plural: "nodes", namespaced: false },
    KindSpec { name: "deployment", group: "apps", version: "v1", kind: "Deployment", plural: "deployments", namespaced: true },
    KindSpec { name: "daemonset", group: "apps", version: "v1", kind: "DaemonSet", plural: "daemonsets", namespaced: true },
    KindSpec { name: "statefulset", group: "apps", version: "v1", kind: "StatefulSet", plural: "statefulsets", namespaced: true },
    KindSpec { name: "replicaset", group: "apps", version: "v1", kind: "ReplicaSet", plural: "replicasets", namespaced: true },
    KindSpec { name: "job", group: "batch", version: "v1", kind: "Job", plural: "jobs", namespaced: true },
    KindSpec { name: "cronjob", group: "batch", version: "v1", kind: "CronJob", plural: "cronjobs", namespaced: true },
    KindSpec { name: "ingress", group: "networking.k8s.io", version: "v1", kind: "Ingress", plural: "ingresses", namespaced: true },
    KindSpec { name: "storageclass", group: "storage.k8s.io", version: "v1", kind: "StorageClass", plural: "storageclasses", namespaced: false },
];

/// Case-insensitive lookup by the lowercase kind name.
pub fn lookup(kind: &str) -> Option<&'static KindSpec> {
    let needle = kind.to_ascii_lowercase();
    SUPPORTED_KINDS.iter().find(|k| k.name == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup("Pod").is_some());
        assert!(lookup("POD").is_some());
        assert!(lookup("pod").is_some());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(lookup("customresource").is_none());
    }

    #[test]
    fn api_resource_for_core_and_grouped_kinds() {
        let pod = lookup("pod").unwrap().api_resource();
        assert_eq!(pod.api_version, "v1");
        let deploy = lookup("deployment").unwrap().api_resource();
        assert_eq!(deploy.api_version, "apps/v1");
        assert_eq!(deploy.plural, "deployments");
    }

    #[test]
    fn cluster_scoped_kinds_flagged() {
        assert!(!lookup("node").unwrap().namespaced);
        assert!(!lookup("storageclass").unwrap().namespaced);
        assert!(lookup("pod").unwrap().namespaced);
    }
}
