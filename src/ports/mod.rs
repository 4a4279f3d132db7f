use std::collections::BTreeSet;

use crate::core::{EnvError, EnvResult};

/// Hands out free host ports for container port-mappings. The caller supplies
/// the reserved set (every host port held by a non-deleted record) and holds
/// the registry commit lock across allocation and the write that records it,
/// so an allocated port is never observed unrecorded.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    default_port: u16,
    range_start: u16,
    range_end: u16,
}

impl PortAllocator {
    pub fn new(default_port: u16, range_start: u16, range_end: u16) -> Self {
        Self {
            default_port,
            range_start,
            range_end,
        }
    }

    /// Returns `count` host ports absent from `reserved`: the configured
    /// default port first when free, then scanning upward through the range.
    pub fn allocate(&self, count: usize, reserved: &BTreeSet<u16>) -> EnvResult<Vec<u16>> {
        let mut allocated = Vec::with_capacity(count);
        let mut taken = reserved.clone();

        if allocated.len() < count && !taken.contains(&self.default_port) {
            allocated.push(self.default_port);
            taken.insert(self.default_port);
        }

        let mut candidate = self.range_start;
        while allocated.len() < count && candidate <= self.range_end {
            if !taken.contains(&candidate) {
                allocated.push(candidate);
                taken.insert(candidate);
            }
            if candidate == u16::MAX {
                break;
            }
            candidate += 1;
        }

        if allocated.len() < count {
            return Err(EnvError::Conflict(format!(
                "host port range {}-{} exhausted: needed {count}, found {}",
                self.range_start,
                self.range_end,
                allocated.len()
            )));
        }
        Ok(allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> PortAllocator {
        PortAllocator::new(8188, 8189, 8193)
    }

    #[test]
    fn prefers_default_port_when_free() {
        let ports = allocator().allocate(1, &BTreeSet::new()).unwrap();
        assert_eq!(ports, vec![8188]);
    }

    #[test]
    fn scans_upward_when_default_taken() {
        let reserved: BTreeSet<u16> = [8188, 8189].into_iter().collect();
        let ports = allocator().allocate(2, &reserved).unwrap();
        assert_eq!(ports, vec![8190, 8191]);
    }

    #[test]
    fn never_hands_out_duplicates_in_one_call() {
        let ports = allocator().allocate(3, &BTreeSet::new()).unwrap();
        let unique: BTreeSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn exhaustion_is_a_conflict() {
        let reserved: BTreeSet<u16> = (8188..=8193).collect();
        let err = allocator().allocate(1, &reserved).unwrap_err();
        assert!(matches!(err, EnvError::Conflict(_)));
    }
}
