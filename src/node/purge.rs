//! Node Purge Controller
//!
//! Removes a node from the cluster and cleans up what the node leaves behind:
//! its storage daemon (deployment plus the storage cluster's own record) and,
//! for control-plane nodes, its API endpoint in the kubeadm cluster status
//! and its etcd membership.
//!
//! Reading and deleting the node are fatal. Every later step is attempted
//! independently; failures are collected and reported together with the
//! step and resource they concern. Nothing is rolled back.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::controlplane::metrics::Metrics;
use crate::crd::ObjectList;
use crate::domain::{ApiRequest, ApiResponse, ClusterApiRef, ExecOutput, Verb};
use crate::error::{Error, PurgeFailure, Result};

const STEP_STORAGE_DEPLOYMENT: &str = "delete storage daemon deployment";
const STEP_STORAGE_PURGE: &str = "purge storage daemon";
const STEP_STORAGE_LIST: &str = "list storage daemons";
const STEP_ENDPOINT: &str = "remove control-plane endpoint";
const STEP_CONSENSUS: &str = "remove consensus member";

// =============================================================================
// Configuration
// =============================================================================

/// Where the storage and control-plane pieces live
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Namespace of the storage operator and its daemons
    pub storage_namespace: String,
    pub storage_daemon_selector: String,
    /// Label carrying the storage engine's id for a daemon
    pub storage_daemon_id_label: String,
    pub storage_operator_selector: String,
    /// Node label matched against daemon node selectors
    pub hostname_label: String,
    /// Any of these labels marks a control-plane node
    pub control_plane_labels: Vec<String>,
    pub kubeadm_namespace: String,
    pub kubeadm_config_map: String,
    pub cluster_status_key: String,
    pub etcd_selector: String,
    pub etcd_container: String,
    pub etcd_endpoint: String,
    pub etcd_ca_cert: String,
    pub etcd_cert: String,
    pub etcd_key: String,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            storage_namespace: "rook-ceph".to_string(),
            storage_daemon_selector: "app=rook-ceph-osd".to_string(),
            storage_daemon_id_label: "ceph-osd-id".to_string(),
            storage_operator_selector: "app=rook-ceph-operator".to_string(),
            hostname_label: "kubernetes.io/hostname".to_string(),
            control_plane_labels: vec![
                "node-role.kubernetes.io/master".to_string(),
                "node-role.kubernetes.io/control-plane".to_string(),
            ],
            kubeadm_namespace: "kube-system".to_string(),
            kubeadm_config_map: "kubeadm-config".to_string(),
            cluster_status_key: "ClusterStatus".to_string(),
            etcd_selector: "component=etcd".to_string(),
            etcd_container: "etcd".to_string(),
            etcd_endpoint: "https://127.0.0.1:2379".to_string(),
            etcd_ca_cert: "/etc/kubernetes/pki/etcd/ca.crt".to_string(),
            etcd_cert: "/etc/kubernetes/pki/etcd/healthcheck-client.crt".to_string(),
            etcd_key: "/etc/kubernetes/pki/etcd/healthcheck-client.key".to_string(),
        }
    }
}

/// What a successful purge cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub node: String,
    /// Storage daemon deployments deleted
    pub storage_deployments: Vec<String>,
    /// Storage engine ids purged from the storage cluster
    pub purged_storage_ids: Vec<String>,
    pub control_plane: bool,
    /// Consensus member id removed, if one was registered
    pub consensus_member: Option<String>,
    /// Cleanup steps left out on purpose, with the reason
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

// =============================================================================
// Purger
// =============================================================================

/// Deletes nodes and their leftovers
pub struct NodePurger {
    cluster: ClusterApiRef,
    config: PurgeConfig,
    metrics: Option<Arc<Metrics>>,
}

impl NodePurger {
    pub fn new(cluster: ClusterApiRef, config: PurgeConfig) -> Self {
        Self {
            cluster,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delete `node` and clean up after it
    #[instrument(skip(self))]
    pub async fn purge(&self, node: &str) -> Result<PurgeReport> {
        let result = self.run(node).await;
        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(_) => "complete",
                Err(Error::PurgeIncomplete { .. }) => "incomplete",
                Err(_) => "failed",
            };
            metrics.node_purges.with_label_values(&[label]).inc();
        }
        result
    }

    async fn run(&self, node: &str) -> Result<PurgeReport> {
        let path = format!("/api/v1/nodes/{}", node);
        let response = self.cluster.send(ApiRequest::get(&path)).await?;
        if response.status == 404 {
            return Err(Error::NodeNotFound {
                node: node.to_string(),
            });
        }
        let current: Node = expect_success(Verb::Get, &path, response)?.json()?;

        let response = self.cluster.send(ApiRequest::delete(&path)).await?;
        if !matches!(response.status, 200 | 202) {
            return Err(Error::UnexpectedStatus {
                method: Verb::Delete.to_string(),
                path,
                code: response.status,
            });
        }
        info!(node = %node, "deleted node");

        let labels = current.metadata.labels.unwrap_or_default();
        let hostname = labels
            .get(&self.config.hostname_label)
            .cloned()
            .unwrap_or_else(|| node.to_string());
        let control_plane = self
            .config
            .control_plane_labels
            .iter()
            .any(|l| labels.contains_key(l));

        let mut report = PurgeReport {
            node: node.to_string(),
            control_plane,
            ..Default::default()
        };
        let mut failures = Vec::new();

        self.purge_storage(&hostname, &mut report, &mut failures).await;

        if control_plane {
            if let Err(e) = self.remove_endpoint(node).await {
                failures.push(failure(STEP_ENDPOINT, &self.kubeadm_resource(), e));
            }
            match self.remove_consensus_member(node).await {
                Ok(member) => report.consensus_member = member,
                Err((resource, e)) => failures.push(failure(STEP_CONSENSUS, &resource, e)),
            }
        }

        if failures.is_empty() {
            info!(node = %node, "purge complete");
            Ok(report)
        } else {
            warn!(node = %node, failed = failures.len(), "purge incomplete");
            Err(Error::PurgeIncomplete {
                node: node.to_string(),
                failures,
            })
        }
    }

    // =========================================================================
    // Storage daemon
    // =========================================================================

    async fn purge_storage(
        &self,
        hostname: &str,
        report: &mut PurgeReport,
        failures: &mut Vec<PurgeFailure>,
    ) {
        let ns = &self.config.storage_namespace;
        let deployments_path = format!("/apis/apps/v1/namespaces/{}/deployments", ns);
        let deployments: Vec<Deployment> = match self
            .list(&deployments_path, &self.config.storage_daemon_selector)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                failures.push(failure(STEP_STORAGE_LIST, &deployments_path, e));
                return;
            }
        };

        let on_node = deployments.into_iter().filter(|d| {
            d.spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|s| s.node_selector.as_ref())
                .and_then(|sel| sel.get(&self.config.hostname_label))
                .is_some_and(|h| h == hostname)
        });

        let mut operator: Option<std::result::Result<String, String>> = None;
        for deployment in on_node {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            let resource = format!("{}/{}", ns, name);
            let storage_id = deployment
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(&self.config.storage_daemon_id_label))
                .cloned();

            let response = self
                .cluster
                .send(ApiRequest::delete(format!("{}/{}", deployments_path, name)))
                .await;
            match response {
                Ok(r) if r.is_success() => {
                    info!(deployment = %resource, "deleted storage daemon deployment");
                    report.storage_deployments.push(name.clone());
                }
                Ok(r) => {
                    failures.push(failure(
                        STEP_STORAGE_DEPLOYMENT,
                        &resource,
                        format!("unexpected status {}", r.status),
                    ));
                }
                Err(e) => failures.push(failure(STEP_STORAGE_DEPLOYMENT, &resource, e)),
            }

            let Some(storage_id) = storage_id else {
                warn!(deployment = %resource, "storage daemon has no id label, not purging");
                continue;
            };

            if operator.is_none() {
                operator = Some(self.storage_operator_pod().await);
            }
            let pod = match &operator {
                Some(Ok(pod)) => pod,
                Some(Err(reason)) => {
                    report.skipped.push(format!(
                        "{} ({} id {}): {}",
                        STEP_STORAGE_PURGE, resource, storage_id, reason
                    ));
                    continue;
                }
                None => continue,
            };

            let command = vec![
                "ceph".to_string(),
                "osd".to_string(),
                "purge".to_string(),
                storage_id.clone(),
                "--yes-i-really-mean-it".to_string(),
            ];
            match self.exec_checked(ns, pod, None, command).await {
                Ok(_) => {
                    info!(id = %storage_id, "purged storage daemon");
                    report.purged_storage_ids.push(storage_id);
                }
                Err(e) => failures.push(failure(
                    STEP_STORAGE_PURGE,
                    &format!("{} (id {})", resource, storage_id),
                    e,
                )),
            }
        }
    }

    /// The single storage operator pod, or why there isn't one to use
    async fn storage_operator_pod(&self) -> std::result::Result<String, String> {
        let path = format!("/api/v1/namespaces/{}/pods", self.config.storage_namespace);
        let pods: Vec<Pod> = match self.list(&path, &self.config.storage_operator_selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "failed to list storage operator pods, skipping purge");
                return Err(format!("listing storage operator pods failed: {}", e));
            }
        };
        if pods.len() != 1 {
            warn!(
                found = pods.len(),
                "expected exactly one storage operator pod, skipping purge"
            );
            return Err(format!(
                "found {} storage operator pods matching {}, expected exactly one",
                pods.len(),
                self.config.storage_operator_selector
            ));
        }
        pods.into_iter()
            .next()
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| "storage operator pod has no name".to_string())
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    fn kubeadm_resource(&self) -> String {
        format!(
            "{}/{}",
            self.config.kubeadm_namespace, self.config.kubeadm_config_map
        )
    }

    /// Drop `node` from the kubeadm cluster status
    async fn remove_endpoint(&self, node: &str) -> Result<()> {
        let path = format!(
            "/api/v1/namespaces/{}/configmaps/{}",
            self.config.kubeadm_namespace, self.config.kubeadm_config_map
        );
        let response = self.cluster.send(ApiRequest::get(&path)).await?;
        let mut config_map: ConfigMap = expect_success(Verb::Get, &path, response)?.json()?;

        let key = &self.config.cluster_status_key;
        let Some(status) = config_map.data.as_mut().and_then(|d| d.get_mut(key)) else {
            debug!(config_map = %path, "no cluster status recorded");
            return Ok(());
        };

        let mut value: serde_yaml::Value = serde_yaml::from_str(status)?;
        let removed = value
            .get_mut("apiEndpoints")
            .and_then(serde_yaml::Value::as_mapping_mut)
            .and_then(|endpoints| endpoints.remove(node));
        if removed.is_none() {
            debug!(node = %node, "no API endpoint recorded for node");
            return Ok(());
        }
        *status = serde_yaml::to_string(&value)?;

        let response = self
            .cluster
            .send(ApiRequest::new(Verb::Put, &path).json(&config_map)?)
            .await?;
        expect_success(Verb::Put, &path, response)?;
        info!(node = %node, "removed control-plane endpoint");
        Ok(())
    }

    /// Remove `node` from etcd through a surviving member
    ///
    /// Errors carry the resource they concern.
    async fn remove_consensus_member(
        &self,
        node: &str,
    ) -> std::result::Result<Option<String>, (String, Error)> {
        let ns = &self.config.kubeadm_namespace;
        let path = format!("/api/v1/namespaces/{}/pods", ns);
        let pods: Vec<Pod> = self
            .list(&path, &self.config.etcd_selector)
            .await
            .map_err(|e| (path.clone(), e))?;

        let survivor = pods
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) != Some(node))
            .find_map(|p| p.metadata.name.clone())
            .ok_or_else(|| {
                (
                    path.clone(),
                    Error::Internal("no etcd member left to run membership change".into()),
                )
            })?;
        let resource = format!("{}/{}", ns, survivor);

        let container = Some(self.config.etcd_container.as_str());
        let list = self
            .exec_checked(ns, &survivor, container, self.etcdctl(&["member", "list"]))
            .await
            .map_err(|e| (resource.clone(), e))?;

        let Some(member_id) = find_member(&list.stdout, node) else {
            info!(node = %node, "node is not an etcd member");
            return Ok(None);
        };

        self.exec_checked(
            ns,
            &survivor,
            container,
            self.etcdctl(&["member", "remove", member_id.as_str()]),
        )
        .await
        .map_err(|e| (resource.clone(), e))?;

        info!(node = %node, member = %member_id, "removed etcd member");
        Ok(Some(member_id))
    }

    fn etcdctl(&self, args: &[&str]) -> Vec<String> {
        let mut command = vec![
            "etcdctl".to_string(),
            format!("--endpoints={}", self.config.etcd_endpoint),
            format!("--cacert={}", self.config.etcd_ca_cert),
            format!("--cert={}", self.config.etcd_cert),
            format!("--key={}", self.config.etcd_key),
        ];
        command.extend(args.iter().map(|a| a.to_string()));
        command
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        label_selector: &str,
    ) -> Result<Vec<T>> {
        let response = self
            .cluster
            .send(ApiRequest::get(path).query("labelSelector", label_selector))
            .await?;
        let list: ObjectList<T> = expect_success(Verb::Get, path, response)?.json()?;
        Ok(list.items)
    }

    async fn exec_checked(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let output = self.cluster.exec(namespace, pod, container, command).await?;
        if !output.success {
            return Err(Error::ExecFailed {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn expect_success(verb: Verb, path: &str, response: ApiResponse) -> Result<ApiResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(Error::UnexpectedStatus {
            method: verb.to_string(),
            path: path.to_string(),
            code: response.status,
        })
    }
}

fn failure(step: &str, resource: &str, reason: impl std::fmt::Display) -> PurgeFailure {
    PurgeFailure {
        step: step.to_string(),
        resource: resource.to_string(),
        reason: reason.to_string(),
    }
}

/// Member id for `name` in `etcdctl member list` output
///
/// Lines look like `8e9e05c52164694d, started, node-1, https://..., https://..., false`.
fn find_member(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        (fields.len() >= 3 && fields[2] == name && !fields[0].is_empty())
            .then(|| fields[0].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use assert_matches::assert_matches;
    use serde_json::json;

    const NODE: &str = "/api/v1/nodes/node-2";
    const DEPLOYMENTS: &str = "/apis/apps/v1/namespaces/rook-ceph/deployments";
    const STORAGE_PODS: &str = "/api/v1/namespaces/rook-ceph/pods";
    const KUBEADM: &str = "/api/v1/namespaces/kube-system/configmaps/kubeadm-config";
    const SYSTEM_PODS: &str = "/api/v1/namespaces/kube-system/pods";

    const MEMBER_LIST: &str = "\
8e9e05c52164694d, started, node-1, https://10.0.0.1:2380, https://10.0.0.1:2379, false
91bc3c398fb3c146, started, node-2, https://10.0.0.2:2380, https://10.0.0.2:2379, false
";

    fn node(control_plane: bool) -> serde_json::Value {
        let mut labels = json!({"kubernetes.io/hostname": "host-2"});
        if control_plane {
            labels["node-role.kubernetes.io/master"] = json!("");
        }
        json!({"metadata": {"name": "node-2", "labels": labels}})
    }

    fn osd(name: &str, host: &str, id: &str) -> serde_json::Value {
        json!({
            "metadata": {"name": name, "labels": {"app": "rook-ceph-osd", "ceph-osd-id": id}},
            "spec": {
                "selector": {"matchLabels": {"app": "rook-ceph-osd"}},
                "template": {"spec": {
                    "nodeSelector": {"kubernetes.io/hostname": host},
                    "containers": []
                }}
            }
        })
    }

    fn pod(name: &str, node: &str) -> serde_json::Value {
        json!({"metadata": {"name": name}, "spec": {"nodeName": node, "containers": []}})
    }

    fn worker_cluster(operators: usize) -> Arc<FakeCluster> {
        let cluster = FakeCluster::new();
        cluster.respond_json(Verb::Get, NODE, 200, node(false));
        cluster.respond_json(Verb::Delete, NODE, 200, json!({}));
        cluster.respond_json(
            Verb::Get,
            DEPLOYMENTS,
            200,
            json!({"items": [osd("rook-ceph-osd-1", "host-1", "1"), osd("rook-ceph-osd-3", "host-2", "3")]}),
        );
        cluster.respond_json(
            Verb::Delete,
            &format!("{}/rook-ceph-osd-3", DEPLOYMENTS),
            200,
            json!({}),
        );
        let items: Vec<_> = (0..operators)
            .map(|i| pod(&format!("rook-ceph-operator-{}", i), "node-1"))
            .collect();
        cluster.respond_json(Verb::Get, STORAGE_PODS, 200, json!({ "items": items }));
        cluster
    }

    fn control_plane_cluster() -> Arc<FakeCluster> {
        let cluster = worker_cluster(1);
        cluster.respond_json(Verb::Get, NODE, 200, node(true));
        let status = "apiEndpoints:\n  node-1:\n    advertiseAddress: 10.0.0.1\n    bindPort: 6443\n  node-2:\n    advertiseAddress: 10.0.0.2\n    bindPort: 6443\napiVersion: kubeadm.k8s.io/v1beta2\nkind: ClusterStatus\n";
        cluster.respond_json(
            Verb::Get,
            KUBEADM,
            200,
            json!({"metadata": {"name": "kubeadm-config", "namespace": "kube-system"}, "data": {"ClusterStatus": status}}),
        );
        cluster.respond(Verb::Put, KUBEADM, |req| {
            ApiResponse::new(200, req.body.clone().unwrap_or_default())
        });
        cluster.respond_json(
            Verb::Get,
            SYSTEM_PODS,
            200,
            json!({"items": [pod("etcd-node-2", "node-2"), pod("etcd-node-1", "node-1")]}),
        );
        cluster
    }

    fn etcd_exec(cluster: &FakeCluster, remove_ok: bool) {
        cluster.on_exec(move |call| {
            let out = match call.command.first().map(String::as_str) {
                Some("etcdctl") if call.command.contains(&"list".to_string()) => ExecOutput {
                    stdout: MEMBER_LIST.to_string(),
                    stderr: String::new(),
                    success: true,
                },
                Some("etcdctl") => ExecOutput {
                    stdout: String::new(),
                    stderr: if remove_ok { String::new() } else { "context deadline exceeded".into() },
                    success: remove_ok,
                },
                _ => ExecOutput {
                    success: true,
                    ..Default::default()
                },
            };
            Ok(out)
        });
    }

    #[tokio::test]
    async fn test_worker_purge() {
        let cluster = worker_cluster(1);
        let purger = NodePurger::new(cluster.clone(), PurgeConfig::default());

        let report = purger.purge("node-2").await.unwrap();
        assert!(!report.control_plane);
        assert_eq!(report.storage_deployments, vec!["rook-ceph-osd-3"]);
        assert_eq!(report.purged_storage_ids, vec!["3"]);
        assert!(report.skipped.is_empty());

        let execs = cluster.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].pod, "rook-ceph-operator-0");
        assert_eq!(
            execs[0].command,
            vec!["ceph", "osd", "purge", "3", "--yes-i-really-mean-it"]
        );
        assert_eq!(
            cluster.count(Verb::Delete, &format!("{}/rook-ceph-osd-1", DEPLOYMENTS)),
            0
        );
    }

    #[tokio::test]
    async fn test_ambiguous_operator_skips_purge_softly() {
        for operators in [0, 2] {
            let cluster = worker_cluster(operators);
            let purger = NodePurger::new(cluster.clone(), PurgeConfig::default());

            let report = purger.purge("node-2").await.unwrap();
            assert_eq!(report.storage_deployments, vec!["rook-ceph-osd-3"]);
            assert!(report.purged_storage_ids.is_empty());
            assert!(cluster.execs().is_empty());

            assert_eq!(report.skipped.len(), 1);
            let reason = &report.skipped[0];
            assert!(reason.starts_with("purge storage daemon (rook-ceph/rook-ceph-osd-3 id 3)"));
            assert!(reason.contains(&format!("found {} storage operator pods", operators)));

            let body = serde_json::to_value(&report).unwrap();
            assert_eq!(body["skipped"][0], reason.as_str());
        }
    }

    #[tokio::test]
    async fn test_control_plane_purge() {
        let cluster = control_plane_cluster();
        etcd_exec(&cluster, true);
        let purger = NodePurger::new(cluster.clone(), PurgeConfig::default());

        let report = purger.purge("node-2").await.unwrap();
        assert!(report.control_plane);
        assert_eq!(report.consensus_member.as_deref(), Some("91bc3c398fb3c146"));

        let put = &cluster.bodies(Verb::Put, KUBEADM)[0];
        let status: serde_yaml::Value =
            serde_yaml::from_str(put["data"]["ClusterStatus"].as_str().unwrap()).unwrap();
        let endpoints = status["apiEndpoints"].as_mapping().unwrap();
        assert!(endpoints.contains_key("node-1"));
        assert!(!endpoints.contains_key("node-2"));

        let etcd: Vec<_> = cluster
            .execs()
            .into_iter()
            .filter(|c| c.command[0] == "etcdctl")
            .collect();
        assert_eq!(etcd.len(), 2);
        assert!(etcd.iter().all(|c| c.pod == "etcd-node-1"));
        assert!(etcd.iter().all(|c| c.container.as_deref() == Some("etcd")));
        assert_eq!(
            &etcd[1].command[etcd[1].command.len() - 3..],
            &["member", "remove", "91bc3c398fb3c146"]
        );
    }

    #[tokio::test]
    async fn test_consensus_failure_keeps_endpoint_edit() {
        let cluster = control_plane_cluster();
        etcd_exec(&cluster, false);
        let purger = NodePurger::new(cluster.clone(), PurgeConfig::default());

        let err = purger.purge("node-2").await.unwrap_err();
        assert_matches!(err, Error::PurgeIncomplete { ref failures, .. } if failures.len() == 1);
        if let Error::PurgeIncomplete { failures, .. } = err {
            assert_eq!(failures[0].step, STEP_CONSENSUS);
            assert_eq!(failures[0].resource, "kube-system/etcd-node-1");
            assert!(failures[0].reason.contains("context deadline exceeded"));
        }
        assert_eq!(cluster.count(Verb::Put, KUBEADM), 1);
        assert_eq!(
            cluster.count(Verb::Delete, &format!("{}/rook-ceph-osd-3", DEPLOYMENTS)),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_node() {
        let cluster = FakeCluster::new();
        let purger = NodePurger::new(cluster.clone(), PurgeConfig::default());
        let err = purger.purge("node-2").await.unwrap_err();
        assert_matches!(err, Error::NodeNotFound { .. });
    }

    #[tokio::test]
    async fn test_node_delete_failure_stops_purge() {
        let cluster = worker_cluster(1);
        cluster.respond_json(Verb::Delete, NODE, 500, json!({}));
        let purger = NodePurger::new(cluster.clone(), PurgeConfig::default());

        let err = purger.purge("node-2").await.unwrap_err();
        assert_matches!(err, Error::UnexpectedStatus { code: 500, .. });
        assert_eq!(cluster.count(Verb::Get, DEPLOYMENTS), 0);
    }

    #[test]
    fn test_find_member() {
        assert_eq!(find_member(MEMBER_LIST, "node-2").as_deref(), Some("91bc3c398fb3c146"));
        assert_eq!(find_member(MEMBER_LIST, "node-9"), None);
        assert_eq!(find_member("garbage", "node-1"), None);
    }
}
