//! GPU allocation - Round-robin placement of instances onto GPU slots

use serde::{Deserialize, Serialize};

use super::error::{FleetError, FleetResult};

/// Placement of one instance: which GPU and which slot on that GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuSlot {
    pub gpu: u32,
    pub slot: u32,
}

impl std::fmt::Display for GpuSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gpu {} / slot {}", self.gpu, self.slot)
    }
}

/// Assigns instance ordinals to GPU slots.
///
/// Instance `i` lands on `gpus[i % gpus.len()]`, slot `i / gpus.len()`. The result is
/// computed once per run and never rebalanced; restarts reuse the original slot.
#[derive(Debug, Clone)]
pub struct GpuAllocator {
    gpus: Vec<u32>,
    max_per_gpu: u32,
}

impl GpuAllocator {
    pub fn new(gpus: Vec<u32>, max_per_gpu: u32) -> Self {
        Self { gpus, max_per_gpu }
    }

    /// Total number of slots available across all GPUs
    pub fn capacity(&self) -> usize {
        self.gpus.len() * self.max_per_gpu as usize
    }

    /// Compute the assignment for `count` instances, indexed by ordinal
    pub fn allocate(&self, count: usize) -> FleetResult<Vec<GpuSlot>> {
        if self.gpus.is_empty() {
            return Err(FleetError::config("no GPUs available"));
        }
        if self.max_per_gpu == 0 {
            return Err(FleetError::config("max instances per GPU must be at least 1"));
        }
        let mut seen = self.gpus.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.gpus.len() {
            return Err(FleetError::config(format!(
                "GPU list contains duplicates: {:?}",
                self.gpus
            )));
        }
        if count > self.capacity() {
            return Err(FleetError::config(format!(
                "{} instances requested but {} GPUs x {} per GPU only fit {}",
                count,
                self.gpus.len(),
                self.max_per_gpu,
                self.capacity()
            )));
        }

        let n = self.gpus.len();
        Ok((0..count)
            .map(|i| GpuSlot {
                gpu: self.gpus[i % n],
                slot: (i / n) as u32,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn four_instances_on_two_gpus() {
        let slots = GpuAllocator::new(vec![0, 1], 2).allocate(4).unwrap();
        assert_eq!(
            slots,
            vec![
                GpuSlot { gpu: 0, slot: 0 },
                GpuSlot { gpu: 1, slot: 0 },
                GpuSlot { gpu: 0, slot: 1 },
                GpuSlot { gpu: 1, slot: 1 },
            ]
        );
    }

    #[test]
    fn assignments_are_unique_and_within_capacity() {
        for gpu_count in 1..=4u32 {
            for max in 1..=3u32 {
                let gpus: Vec<u32> = (0..gpu_count).map(|g| g + 3).collect();
                let allocator = GpuAllocator::new(gpus, max);
                for n in 0..=allocator.capacity() {
                    let slots = allocator.allocate(n).unwrap();
                    assert_eq!(slots.len(), n);
                    let unique: HashSet<_> = slots.iter().collect();
                    assert_eq!(unique.len(), n);

                    let mut per_gpu: HashMap<u32, u32> = HashMap::new();
                    for s in &slots {
                        *per_gpu.entry(s.gpu).or_default() += 1;
                        assert!(s.slot < max);
                    }
                    assert!(per_gpu.values().all(|&c| c <= max));
                }
            }
        }
    }

    #[test]
    fn overcommit_is_rejected() {
        let err = GpuAllocator::new(vec![0, 1], 2).allocate(5).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn empty_gpu_list_is_rejected() {
        assert!(GpuAllocator::new(vec![], 4).allocate(1).is_err());
        assert!(GpuAllocator::new(vec![], 4).allocate(0).is_err());
    }

    #[test]
    fn duplicate_gpus_are_rejected() {
        assert!(GpuAllocator::new(vec![1, 1], 4).allocate(2).is_err());
    }
}
