use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Inclusive key range `[start, end]` served by one partition.
/// A trailing partition left without keys by the ceiling division has `start == end + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    /// First key of the range.
    pub start: u64,
    /// Last key of the range, inclusive.
    pub end: u64,
}

impl PartitionRange {
    /// True when no key of the domain falls into this range.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// True when `value` lies within `[start, end]`.
    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }
}

/// One shard of a partitioned collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Partitioned field.
    pub partition_key: String,
    /// Number of partitions.
    pub total_partitions: u64,
    /// Index of this partition.
    pub partition_index: u64,
    /// Keys owned by this partition.
    pub range: PartitionRange,
}

fn per_partition(total_domain: u64, num_partitions: u64) -> Result<u64> {
    if total_domain < 1 || num_partitions < 1 || num_partitions > total_domain {
        return Err(ProxyError::InvalidPartitioning {
            total_domain,
            num_partitions,
        });
    }
    Ok(total_domain.div_ceil(num_partitions))
}

/// Split the key domain `[0, total_domain)` into `num_partitions` contiguous ranges.
///
/// Every partition covers `ceil(total_domain / num_partitions)` keys; the last
/// non-empty range is clipped to `total_domain - 1`.
pub fn compute_partitions(total_domain: u64, num_partitions: u64) -> Result<Vec<PartitionRange>> {
    let per_partition = per_partition(total_domain, num_partitions)?;

    Ok((0..num_partitions)
        .map(|i| {
            let start = (i * per_partition).min(total_domain);
            let end = (start + per_partition - 1).min(total_domain - 1);
            PartitionRange { start, end }
        })
        .collect())
}

/// Index of the partition that owns `value`.
pub fn compute_partition_index(num_partitions: u64, value: u64, total_domain: u64) -> Result<u64> {
    let per_partition = per_partition(total_domain, num_partitions)?;
    Ok(value / per_partition)
}

/// Full partition descriptors for a partition key.
pub fn partition_specs(
    partition_key: &str,
    total_domain: u64,
    num_partitions: u64,
) -> Result<Vec<PartitionSpec>> {
    Ok(compute_partitions(total_domain, num_partitions)?
        .into_iter()
        .enumerate()
        .map(|(i, range)| PartitionSpec {
            partition_key: partition_key.to_string(),
            total_partitions: num_partitions,
            partition_index: i as u64,
            range,
        })
        .collect())
}
