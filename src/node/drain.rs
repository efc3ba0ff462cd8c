//! Node Drain Controller
//!
//! One drain invocation is a single pass, similar to `kubectl drain`:
//! cordon the node, then evict its pods wave by wave. Waves hold back pods
//! that other workloads depend on (storage daemons, cluster DNS, the console
//! itself) until everything before them has been processed.
//!
//! Evictions go through the Eviction API so PodDisruptionBudgets are
//! respected. A 429 means a budget is blocking for now, a 500 means the pod
//! is covered by conflicting budgets. Both are folded into the returned
//! `DrainOutcome` instead of failing the drain; the caller decides whether
//! to re-invoke.

use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::Eviction;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::controlplane::metrics::Metrics;
use crate::crd::ObjectList;
use crate::domain::{ApiRequest, ClusterApiRef, Verb};
use crate::error::{Error, Result};

/// Annotation the kubelet puts on mirror pods of static manifests
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

// =============================================================================
// Configuration
// =============================================================================

/// A set of pods evicted together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainWave {
    pub name: String,
    /// Label selector, combined with the node field selector
    pub label_selector: String,
}

impl DrainWave {
    pub fn new(name: &str, label_selector: &str) -> Self {
        Self {
            name: name.to_string(),
            label_selector: label_selector.to_string(),
        }
    }
}

/// Drain configuration
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Waves in the order they are drained
    pub waves: Vec<DrainWave>,
    /// Evictions in flight at once within a wave
    pub concurrency: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            waves: vec![
                DrainWave::new(
                    "workloads",
                    "app notin (rook-ceph-mon,rook-ceph-osd,rook-ceph-operator,kotsadm-api),k8s-app!=kube-dns",
                ),
                DrainWave::new(
                    "storage",
                    "app in (rook-ceph-mon,rook-ceph-osd,rook-ceph-operator)",
                ),
                DrainWave::new("dns", "k8s-app=kube-dns"),
                DrainWave::new("console", "app=kotsadm-api"),
            ],
            concurrency: 5,
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Aggregate result of a drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainOutcome {
    /// A disruption budget blocked at least one eviction; retry later
    pub wait_and_retry: bool,
    /// At least one pod is covered by a misconfigured disruption budget
    pub misconfigured_policy_disruption_budget: bool,
}

impl DrainOutcome {
    pub const EVICTED: Self = Self {
        wait_and_retry: false,
        misconfigured_policy_disruption_budget: false,
    };

    /// Interpret an eviction response code; `None` for codes that abort the drain
    pub fn from_eviction_status(code: u16) -> Option<Self> {
        match code {
            200 | 201 => Some(Self::EVICTED),
            429 => Some(Self {
                wait_and_retry: true,
                ..Self::EVICTED
            }),
            500 => Some(Self {
                misconfigured_policy_disruption_budget: true,
                ..Self::EVICTED
            }),
            _ => None,
        }
    }

    pub fn is_clean(&self) -> bool {
        *self == Self::EVICTED
    }

    /// Operator-facing error for this outcome, if any
    ///
    /// A misconfigured budget needs a human, so it wins over wait-and-retry.
    pub fn operator_error(&self, node: &str) -> Option<Error> {
        if self.misconfigured_policy_disruption_budget {
            Some(Error::EvictionMisconfigured {
                node: node.to_string(),
            })
        } else if self.wait_and_retry {
            Some(Error::EvictionBudgetBlocked {
                node: node.to_string(),
            })
        } else {
            None
        }
    }
}

impl BitOr for DrainOutcome {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            wait_and_retry: self.wait_and_retry || rhs.wait_and_retry,
            misconfigured_policy_disruption_budget: self.misconfigured_policy_disruption_budget
                || rhs.misconfigured_policy_disruption_budget,
        }
    }
}

impl BitOrAssign for DrainOutcome {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

// =============================================================================
// Pod classification
// =============================================================================

/// Whether a drain should evict `pod`
///
/// Finished pods are always evicted. Mirror pods and DaemonSet-controlled
/// pods are left alone since nothing we do will keep them off the node.
pub fn should_drain(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Succeeded") | Some("Failed")) {
        return true;
    }

    if pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
    {
        info!(pod = %pod_key(pod), "not draining mirror pod");
        return false;
    }

    // TODO: evict DaemonSet pods whose DaemonSet no longer exists, as kubectl does
    if pod.metadata.owner_references.as_ref().is_some_and(|refs| {
        refs.iter()
            .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
    }) {
        info!(pod = %pod_key(pod), "not draining DaemonSet pod");
        return false;
    }

    true
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

// =============================================================================
// Drainer
// =============================================================================

/// Cordons nodes and evicts their pods
pub struct NodeDrainer {
    cluster: ClusterApiRef,
    config: DrainConfig,
    metrics: Option<Arc<Metrics>>,
}

impl NodeDrainer {
    pub fn new(cluster: ClusterApiRef, config: DrainConfig) -> Self {
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

    /// Cordon `node` and make one eviction pass over its pods
    #[instrument(skip(self))]
    pub async fn drain(&self, node: &str) -> Result<DrainOutcome> {
        self.cordon(node).await?;

        let mut outcome = DrainOutcome::default();
        for wave in &self.config.waves {
            let pods = self.list_pods(node, &wave.label_selector).await?;
            let targets: Vec<Pod> = pods.into_iter().filter(should_drain).collect();
            debug!(wave = %wave.name, pods = targets.len(), "draining wave");

            outcome |= stream::iter(targets)
                .map(|pod| async move { self.evict(&pod).await })
                .buffer_unordered(self.config.concurrency.max(1))
                .try_fold(DrainOutcome::default(), |acc, o| async move { Ok(acc | o) })
                .await?;
        }

        info!(
            wait_and_retry = outcome.wait_and_retry,
            misconfigured = outcome.misconfigured_policy_disruption_budget,
            "drain pass complete"
        );
        Ok(outcome)
    }

    /// Mark `node` unschedulable
    pub async fn cordon(&self, node: &str) -> Result<()> {
        let path = format!("/api/v1/nodes/{}", node);
        let response = self.cluster.send(ApiRequest::get(&path)).await?;
        match response.status {
            404 => {
                return Err(Error::NodeNotFound {
                    node: node.to_string(),
                })
            }
            code if !response.is_success() => {
                return Err(Error::UnexpectedStatus {
                    method: Verb::Get.to_string(),
                    path,
                    code,
                })
            }
            _ => {}
        }

        let mut current: Node = response.json()?;
        current.spec.get_or_insert_with(Default::default).unschedulable = Some(true);

        let response = self
            .cluster
            .send(ApiRequest::new(Verb::Put, &path).json(&current)?)
            .await?;
        if !response.is_success() {
            return Err(Error::CordonFailed {
                node: node.to_string(),
                code: response.status,
            });
        }

        info!(node = %node, "cordoned node");
        Ok(())
    }

    async fn list_pods(&self, node: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let path = "/api/v1/pods";
        let request = ApiRequest::get(path)
            .query("fieldSelector", format!("spec.nodeName={}", node))
            .query("labelSelector", label_selector);
        let response = self.cluster.send(request).await?;
        if !response.is_success() {
            return Err(Error::UnexpectedStatus {
                method: Verb::Get.to_string(),
                path: path.to_string(),
                code: response.status,
            });
        }
        let list: ObjectList<Pod> = response.json()?;
        Ok(list.items)
    }

    /// Request eviction of `pod`
    pub async fn evict(&self, pod: &Pod) -> Result<DrainOutcome> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let eviction = Eviction {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            delete_options: None,
        };

        info!(
            pod = %name,
            namespace = %namespace,
            node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or_default(),
            "evicting pod"
        );
        let path = format!("/api/v1/namespaces/{}/pods/{}/eviction", namespace, name);
        let response = self
            .cluster
            .send(ApiRequest::new(Verb::Post, path).json(&eviction)?)
            .await?;

        let outcome = DrainOutcome::from_eviction_status(response.status).ok_or_else(|| {
            Error::EvictionFailed {
                namespace: namespace.clone(),
                pod: name.clone(),
                code: response.status,
            }
        })?;

        let label = if outcome.misconfigured_policy_disruption_budget {
            error!(pod = %name, namespace = %namespace, "eviction failed: possible PodDisruptionBudget misconfiguration");
            "misconfigured"
        } else if outcome.wait_and_retry {
            warn!(pod = %name, namespace = %namespace, "eviction blocked by PodDisruptionBudget");
            "blocked"
        } else {
            "evicted"
        };
        if let Some(metrics) = &self.metrics {
            metrics.evictions.with_label_values(&[label]).inc();
        }
        Ok(outcome)
    }
}
