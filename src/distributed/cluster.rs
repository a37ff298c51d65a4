//! Cluster membership and hardware capability detection (§3 NodeCapabilities/ClusterNode,
//! §4.7). Grounded on `distributed/cluster.py`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    AppleSilicon,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Ready,
    Busy,
    Offline,
}

/// §3 NodeCapabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub device_type: DeviceType,
    pub chip_name: Option<String>,
    pub cpu_cores: u32,
    pub gpu_cores: Option<u32>,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub estimated_tflops: f64,
}

/// 14-entry Apple Silicon chip → (gpu_cores, estimated_tflops) table, ported verbatim from
/// `_estimate_apple_performance`.
const CHIP_SPECS: &[(&str, u32, f64)] = &[
    ("m1 ultra", 64, 21.0),
    ("m1 max", 32, 10.4),
    ("m1 pro", 16, 5.2),
    ("m1", 8, 2.6),
    ("m2 ultra", 76, 27.2),
    ("m2 max", 38, 13.6),
    ("m2 pro", 19, 6.8),
    ("m2", 10, 3.6),
    ("m3 max", 40, 16.4),
    ("m3 pro", 18, 7.4),
    ("m3", 10, 4.1),
    ("m4 max", 40, 18.0),
    ("m4 pro", 20, 9.0),
    ("m4", 10, 4.5),
];

impl NodeCapabilities {
    /// Detects the capabilities of the local machine. On Apple Silicon, shells out to
    /// `sysctl`; otherwise falls back to a generic CPU-only profile.
    pub fn detect_local() -> Self {
        if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
            if let Some(caps) = Self::detect_apple_silicon() {
                return caps;
            }
        }
        Self::detect_generic()
    }

    fn detect_apple_silicon() -> Option<Self> {
        let brand = sysctl_string("machdep.cpu.brand_string")?;
        let mem_bytes = sysctl_string("hw.memsize")?.trim().parse::<f64>().ok()?;
        let cpu_cores = sysctl_string("hw.ncpu")?.trim().parse::<u32>().ok()?;
        let total_memory_gb = mem_bytes / (1024.0 * 1024.0 * 1024.0);
        let available_memory_gb = total_memory_gb * 0.7;
        let (gpu_cores, estimated_tflops) = estimate_apple_performance(&brand);
        Some(Self {
            device_type: DeviceType::AppleSilicon,
            chip_name: Some(brand),
            cpu_cores,
            gpu_cores: Some(gpu_cores),
            total_memory_gb,
            available_memory_gb,
            estimated_tflops,
        })
    }

    fn detect_generic() -> Self {
        let cpu_cores = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);
        Self {
            device_type: DeviceType::Generic,
            chip_name: None,
            cpu_cores,
            gpu_cores: None,
            total_memory_gb: 0.0,
            available_memory_gb: 0.0,
            estimated_tflops: 0.0,
        }
    }

    pub fn can_run_distributed(&self) -> bool {
        self.device_type == DeviceType::AppleSilicon
    }

    pub fn memory_weight(&self) -> f64 {
        self.available_memory_gb.max(0.0)
    }

    /// Placeholder capabilities for a remote node registered before it has self-reported its
    /// hardware profile (e.g. via an admin CRUD call or a P2P announcement). The node is
    /// treated as unable to run distributed inference until it reports in.
    pub fn unknown() -> Self {
        Self {
            device_type: DeviceType::Generic,
            chip_name: None,
            cpu_cores: 0,
            gpu_cores: None,
            total_memory_gb: 0.0,
            available_memory_gb: 0.0,
            estimated_tflops: 0.0,
        }
    }
}

fn sysctl_string(key: &str) -> Option<String> {
    let output = Command::new("sysctl").arg("-n").arg(key).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn estimate_apple_performance(brand: &str) -> (u32, f64) {
    let normalized = brand.to_lowercase();
    for (chip, gpu_cores, tflops) in CHIP_SPECS {
        if normalized.contains(chip) {
            return (*gpu_cores, *tflops);
        }
    }
    (8, 2.6) // Unknown chip: assume a base M1 profile.
}

/// §3 ClusterNode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub assigned_layers: Option<(u32, u32)>,
    pub current_model: Option<String>,
}

impl ClusterNode {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status, NodeStatus::Online | NodeStatus::Ready)
    }

    pub fn memory_gb(&self) -> f64 {
        self.capabilities.available_memory_gb
    }

    pub fn to_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "node_id": self.node_id,
            "host": self.host,
            "port": self.port,
            "status": self.status,
            "memory_gb": self.memory_gb(),
            "device_type": self.capabilities.device_type,
            "current_model": self.current_model,
        })
    }
}

/// §3 DistributedCluster. Mutation is serialized behind a read/write lock (§5); reads (layer
/// lookups, summaries) vastly outnumber writes (node join/leave, re-partition).
pub struct DistributedCluster {
    local_node_id: String,
    nodes: RwLock<HashMap<String, ClusterNode>>,
    current_model: RwLock<Option<String>>,
    total_layers: RwLock<Option<u32>>,
}

impl DistributedCluster {
    pub fn initialize_local(host: impl Into<String>, port: u16) -> Self {
        let node_id = format!("{}-{}", gethostname::gethostname().to_string_lossy(), &uuid::Uuid::new_v4().to_string()[..8]);
        let local = ClusterNode {
            node_id: node_id.clone(),
            host: host.into(),
            port,
            capabilities: NodeCapabilities::detect_local(),
            status: NodeStatus::Online,
            assigned_layers: None,
            current_model: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(node_id.clone(), local);
        Self {
            local_node_id: node_id,
            nodes: RwLock::new(nodes),
            current_model: RwLock::new(None),
            total_layers: RwLock::new(None),
        }
    }

    pub fn add_node(&self, node: ClusterNode) {
        self.nodes.write().unwrap().insert(node.node_id.clone(), node);
    }

    /// Removing the local node is forbidden — it always anchors the cluster. Returns `false`
    /// (not an error) when `node_id` is unknown, matching the original's `remove_node` contract.
    pub fn remove_node(&self, node_id: &str) -> anyhow::Result<bool> {
        if node_id == self.local_node_id {
            anyhow::bail!("cannot remove the local node from the cluster");
        }
        Ok(self.nodes.write().unwrap().remove(node_id).is_some())
    }

    pub fn get_available_nodes(&self) -> Vec<ClusterNode> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.is_available() && n.capabilities.can_run_distributed())
            .cloned()
            .collect()
    }

    pub fn get_total_memory(&self) -> f64 {
        self.get_available_nodes().iter().map(|n| n.memory_gb()).sum()
    }

    pub fn get_total_tflops(&self) -> f64 {
        self.get_available_nodes().iter().map(|n| n.capabilities.estimated_tflops).sum()
    }

    pub fn get_cluster_info(&self) -> serde_json::Value {
        let nodes = self.nodes.read().unwrap();
        serde_json::json!({
            "local_node_id": self.local_node_id,
            "node_count": nodes.len(),
            "total_memory_gb": self.get_total_memory(),
            "total_tflops": self.get_total_tflops(),
            "current_model": *self.current_model.read().unwrap(),
            "nodes": nodes.values().map(|n| n.to_summary()).collect::<Vec<_>>(),
        })
    }

    /// Partitions `total_layers` of `model` across currently available nodes using
    /// memory-weighted ring partitioning (§4.7), recording the assignment on each node.
    pub fn assign_layers(&self, model: &str, total_layers: u32) -> anyhow::Result<Vec<super::partition::ModelPartition>> {
        let available = self.get_available_nodes();
        let partitions = super::partition::RingPartitioner.partition(&available, total_layers)?;

        let mut nodes = self.nodes.write().unwrap();
        for partition in &partitions {
            if let Some(node) = nodes.get_mut(&partition.node_id) {
                node.assigned_layers = Some((partition.start_layer, partition.end_layer));
                node.current_model = Some(model.to_string());
            }
        }
        *self.current_model.write().unwrap() = Some(model.to_string());
        *self.total_layers.write().unwrap() = Some(total_layers);
        Ok(partitions)
    }

    pub fn get_node_for_layer(&self, layer: u32) -> Option<ClusterNode> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .find(|n| matches!(n.assigned_layers, Some((start, end)) if layer >= start && layer < end))
            .cloned()
    }

    pub fn clear_assignments(&self) {
        let mut nodes = self.nodes.write().unwrap();
        for node in nodes.values_mut() {
            node.assigned_layers = None;
            node.current_model = None;
        }
        *self.current_model.write().unwrap() = None;
        *self.total_layers.write().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, memory_gb: f64) -> ClusterNode {
        ClusterNode {
            node_id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8765,
            capabilities: NodeCapabilities {
                device_type: DeviceType::AppleSilicon,
                chip_name: Some("Apple M2 Max".to_string()),
                cpu_cores: 12,
                gpu_cores: Some(38),
                total_memory_gb: memory_gb / 0.7,
                available_memory_gb: memory_gb,
                estimated_tflops: 13.6,
            },
            status: NodeStatus::Online,
            assigned_layers: None,
            current_model: None,
        }
    }

    #[test]
    fn estimate_apple_performance_matches_known_chips() {
        assert_eq!(estimate_apple_performance("Apple M1"), (8, 2.6));
        assert_eq!(estimate_apple_performance("Apple M2 Max"), (38, 13.6));
        assert_eq!(estimate_apple_performance("Apple M4 Pro"), (20, 9.0));
    }

    #[test]
    fn cannot_remove_local_node() {
        let cluster = DistributedCluster::initialize_local("127.0.0.1", 8765);
        let result = cluster.remove_node(&cluster.local_node_id);
        assert!(result.is_err());
    }

    #[test]
    fn remove_node_returns_false_for_unknown_id() {
        let cluster = DistributedCluster::initialize_local("127.0.0.1", 8765);
        assert!(!cluster.remove_node("no-such-node").unwrap());
        cluster.add_node(node("real", 16.0));
        assert!(cluster.remove_node("real").unwrap());
        assert!(!cluster.remove_node("real").unwrap());
    }

    #[test]
    fn get_available_nodes_filters_offline_and_non_apple_silicon() {
        let cluster = DistributedCluster::initialize_local("127.0.0.1", 8765);
        let mut offline = node("offline", 16.0);
        offline.status = NodeStatus::Offline;
        cluster.add_node(offline);
        let mut generic = node("generic", 16.0);
        generic.capabilities.device_type = DeviceType::Generic;
        cluster.add_node(generic);
        cluster.add_node(node("online", 16.0));

        let available = cluster.get_available_nodes();
        let ids: Vec<&str> = available.iter().map(|n| n.node_id.as_str()).collect();
        assert!(ids.contains(&"online"));
        assert!(!ids.contains(&"offline"));
        assert!(!ids.contains(&"generic"));
    }
}
