//! Distributed inference coordination (§4.7): hardware capability detection, memory-weighted
//! model partitioning, and cluster membership.

pub mod cluster;
pub mod inference;
pub mod partition;

pub use cluster::{ClusterNode, DeviceType, DistributedCluster, NodeCapabilities, NodeStatus};
pub use inference::{DistributedInferenceCoordinator, GenerationResult};
pub use partition::{estimate_model_requirements, ModelPartition, Partitioner, PerformancePartitioner, RingPartitioner};
