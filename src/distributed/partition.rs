//! Model partitioning (§4.7): memory-weighted ring partitioning of transformer layers across
//! cluster nodes. Grounded on `distributed/partition.py`.

use super::cluster::ClusterNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStrategy {
    Ring,
    Performance,
}

/// A contiguous half-open layer range `[start_layer, end_layer)` assigned to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPartition {
    pub node_id: String,
    pub start_layer: u32,
    pub end_layer: u32,
}

impl ModelPartition {
    pub fn layer_count(&self) -> u32 {
        self.end_layer - self.start_layer
    }
}

/// Per-4-bit-quantization resource estimate for a model, by parameter-count hint in its name.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequirements {
    pub estimated_layers: u32,
    pub memory_gb_fp16: f64,
    pub memory_gb_4bit: f64,
    pub memory_per_layer_gb: f64,
}

/// Verbatim table from `estimate_model_requirements`: substring-matched on model name, most
/// specific parameter count first.
pub fn estimate_model_requirements(model_name: &str) -> ModelRequirements {
    let name = model_name.to_lowercase();
    let (estimated_layers, memory_gb_fp16, memory_gb_4bit, memory_per_layer_gb) = if name.contains("70b") || name.contains("72b")
    {
        (80, 140.0, 35.0, 0.44)
    } else if name.contains("34b") || name.contains("33b") {
        (60, 68.0, 17.0, 0.28)
    } else if name.contains("13b") || name.contains("14b") {
        (40, 26.0, 7.0, 0.18)
    } else if name.contains("8b") {
        (32, 16.0, 4.0, 0.13)
    } else if name.contains("7b") {
        (32, 14.0, 4.0, 0.13)
    } else if name.contains("3b") {
        (26, 6.0, 2.0, 0.08)
    } else if name.contains("1.5b") || name.contains("1b") {
        (22, 3.0, 1.0, 0.05)
    } else {
        (32, 14.0, 4.0, 0.45)
    };
    ModelRequirements {
        estimated_layers,
        memory_gb_fp16,
        memory_gb_4bit,
        memory_per_layer_gb,
    }
}

/// 1.2x overhead factor for activations/KV cache beyond raw weight storage.
const CLUSTER_OVERHEAD_FACTOR: f64 = 1.2;

pub fn can_cluster_run_model(total_memory_gb: f64, requirements: &ModelRequirements) -> bool {
    total_memory_gb >= requirements.memory_gb_4bit * CLUSTER_OVERHEAD_FACTOR
}

pub trait Partitioner {
    fn partition(&self, nodes: &[ClusterNode], total_layers: u32) -> anyhow::Result<Vec<ModelPartition>>;
}

/// Memory-proportional ring partitioner (§8 S4): nodes sorted descending by available memory,
/// each gets `max(1, floor(total_layers * weight))` layers except the last, which absorbs the
/// remainder so every layer is assigned exactly once.
pub struct RingPartitioner;

impl RingPartitioner {
    fn equal_partition(&self, nodes: &[ClusterNode], total_layers: u32) -> Vec<ModelPartition> {
        let n = nodes.len() as u32;
        let base = total_layers / n;
        let remainder = total_layers % n;
        let mut start = 0;
        let mut partitions = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let extra = if (i as u32) < remainder { 1 } else { 0 };
            let count = base + extra;
            let end = start + count;
            partitions.push(ModelPartition {
                node_id: node.node_id.clone(),
                start_layer: start,
                end_layer: end,
            });
            start = end;
        }
        partitions
    }
}

impl Partitioner for RingPartitioner {
    fn partition(&self, nodes: &[ClusterNode], total_layers: u32) -> anyhow::Result<Vec<ModelPartition>> {
        if nodes.is_empty() {
            anyhow::bail!("cannot partition across an empty node set");
        }

        let mut sorted: Vec<&ClusterNode> = nodes.iter().collect();
        sorted.sort_by(|a, b| b.memory_gb().partial_cmp(&a.memory_gb()).unwrap_or(std::cmp::Ordering::Equal));

        let total_weight: f64 = sorted.iter().map(|n| n.memory_gb()).sum();
        if total_weight <= 0.0 {
            return Ok(self.equal_partition(nodes, total_layers));
        }

        Ok(ring_assign(&sorted, total_layers, |n| n.memory_gb() / total_weight))
    }
}

/// Shared sequential assignment for both ring partitioners: each non-last node gets
/// `max(1, floor(total_layers * weight))` layers, capped so enough layers remain for every
/// node still to come to get at least one; the last node absorbs whatever remains. Without the
/// cap, a heavily skewed weight table (e.g. one node holding nearly all the memory) can leave
/// trailing nodes a zero-length `[start, start)` range once `total_layers` runs out (§4.7
/// invariant: every assigned node receives at least one layer).
fn ring_assign(sorted: &[&ClusterNode], total_layers: u32, weight_of: impl Fn(&ClusterNode) -> f64) -> Vec<ModelPartition> {
    let mut partitions = Vec::with_capacity(sorted.len());
    let mut start = 0u32;
    let last_index = sorted.len() - 1;
    for (i, node) in sorted.iter().enumerate() {
        let end = if i == last_index {
            total_layers
        } else {
            let remaining_after = (last_index - i) as u32;
            let count = ((total_layers as f64 * weight_of(node)).floor() as u32).max(1);
            let room = total_layers.saturating_sub(start).saturating_sub(remaining_after).max(1);
            (start + count.min(room)).min(total_layers)
        };
        partitions.push(ModelPartition {
            node_id: node.node_id.clone(),
            start_layer: start,
            end_layer: end,
        });
        start = end;
    }
    partitions
}

/// Weights nodes by a blend of memory and compute throughput rather than memory alone; falls
/// back to `RingPartitioner` ordering but scales allocation by `estimated_tflops` as well.
pub struct PerformancePartitioner;

impl Partitioner for PerformancePartitioner {
    fn partition(&self, nodes: &[ClusterNode], total_layers: u32) -> anyhow::Result<Vec<ModelPartition>> {
        if nodes.is_empty() {
            anyhow::bail!("cannot partition across an empty node set");
        }

        let mut sorted: Vec<&ClusterNode> = nodes.iter().collect();
        sorted.sort_by(|a, b| {
            let score_a = a.memory_gb() * a.capabilities.estimated_tflops.max(0.1);
            let score_b = b.memory_gb() * b.capabilities.estimated_tflops.max(0.1);
            score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_weight: f64 = sorted
            .iter()
            .map(|n| n.memory_gb() * n.capabilities.estimated_tflops.max(0.1))
            .sum();
        if total_weight <= 0.0 {
            return Ok(RingPartitioner.equal_partition(nodes, total_layers));
        }

        Ok(ring_assign(&sorted, total_layers, |n| {
            (n.memory_gb() * n.capabilities.estimated_tflops.max(0.1)) / total_weight
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::cluster::{DeviceType, NodeCapabilities, NodeStatus};

    fn node(id: &str, memory_gb: f64) -> ClusterNode {
        ClusterNode {
            node_id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8765,
            capabilities: NodeCapabilities {
                device_type: DeviceType::AppleSilicon,
                chip_name: None,
                cpu_cores: 8,
                gpu_cores: Some(16),
                total_memory_gb: memory_gb,
                available_memory_gb: memory_gb,
                estimated_tflops: 5.0,
            },
            status: NodeStatus::Online,
            assigned_layers: None,
            current_model: None,
        }
    }

    #[test]
    fn ring_partition_matches_scenario_s4_with_l64() {
        // A=32GB, B=16GB, C=16GB, L=64 -> A:[0,32) B:[32,48) C:[48,64)
        let nodes = vec![node("A", 32.0), node("B", 16.0), node("C", 16.0)];
        let partitions = RingPartitioner.partition(&nodes, 64).unwrap();
        let by_id = |id: &str| partitions.iter().find(|p| p.node_id == id).unwrap().clone();
        assert_eq!(by_id("A"), ModelPartition { node_id: "A".into(), start_layer: 0, end_layer: 32 });
        assert_eq!(by_id("B"), ModelPartition { node_id: "B".into(), start_layer: 32, end_layer: 48 });
        assert_eq!(by_id("C"), ModelPartition { node_id: "C".into(), start_layer: 48, end_layer: 64 });
    }

    #[test]
    fn ring_partition_matches_scenario_s4_with_l10() {
        // Same nodes, L=10 -> A:[0,5) B:[5,7) C:[7,10)
        let nodes = vec![node("A", 32.0), node("B", 16.0), node("C", 16.0)];
        let partitions = RingPartitioner.partition(&nodes, 10).unwrap();
        let by_id = |id: &str| partitions.iter().find(|p| p.node_id == id).unwrap().clone();
        assert_eq!(by_id("A"), ModelPartition { node_id: "A".into(), start_layer: 0, end_layer: 5 });
        assert_eq!(by_id("B"), ModelPartition { node_id: "B".into(), start_layer: 5, end_layer: 7 });
        assert_eq!(by_id("C"), ModelPartition { node_id: "C".into(), start_layer: 7, end_layer: 10 });
    }

    #[test]
    fn skewed_weights_still_give_every_node_at_least_one_layer() {
        // One node holds nearly all the memory; naive floor rounding leaves the trailing
        // nodes a zero-length range once L runs out.
        let nodes = vec![node("A", 100.0), node("B", 1.0), node("C", 1.0), node("D", 1.0)];
        let partitions = RingPartitioner.partition(&nodes, 4).unwrap();
        assert_eq!(partitions.len(), 4);
        for p in &partitions {
            assert!(p.end_layer > p.start_layer, "{} got an empty range", p.node_id);
        }
        let total: u32 = partitions.iter().map(|p| p.layer_count()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn zero_total_weight_falls_back_to_equal_partition() {
        let nodes = vec![node("A", 0.0), node("B", 0.0)];
        let partitions = RingPartitioner.partition(&nodes, 10).unwrap();
        let total: u32 = partitions.iter().map(|p| p.layer_count()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn model_requirements_table_matches_known_sizes() {
        let r = estimate_model_requirements("llama-70b-instruct");
        assert_eq!(r.estimated_layers, 80);
        assert_eq!(r.memory_gb_4bit, 35.0);

        let r = estimate_model_requirements("qwen2.5:7b");
        assert_eq!(r.estimated_layers, 32);
        assert_eq!(r.memory_gb_4bit, 4.0);

        let r = estimate_model_requirements("tinyllama-1.1b");
        assert_eq!(r.estimated_layers, 22);
    }
}
