use std::collections::{BTreeMap, HashSet};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{NodeError, NodeResult};
use crate::id::{AllocationId, IdGenerator};

/// A fractional resource quantity with exact decimal arithmetic.
/// Floating point would drift over thousands of allocate/release cycles,
/// so comparisons against the capacity ceiling must be exact.
pub type Quantity = Decimal;

/// Per-instance quantities requested for each named resource.
/// The vector index identifies the physical instance (e.g. GPU device 0
/// and GPU device 1 are tracked separately to preserve device affinity).
pub type ResourceRequest = BTreeMap<String, Vec<Quantity>>;

/// Quantities reserved from the ledger by a single `allocate` call.
/// The allocation id backs the double-release guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    id: AllocationId,
    resources: BTreeMap<String, Vec<Quantity>>,
}

/// The id carried by merged allocations.
/// It is never issued by the ledger, so releasing a merged view fails
/// the outstanding-allocation check.
const MERGED_ALLOCATION_ID: u64 = 0;

impl Allocation {
    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn resources(&self) -> &BTreeMap<String, Vec<Quantity>> {
        &self.resources
    }

    pub fn get(&self, name: &str) -> Option<&[Quantity]> {
        self.resources.get(name).map(|x| x.as_slice())
    }

    /// Returns the total quantity reserved for a resource across all
    /// of its instances.
    pub fn total(&self, name: &str) -> Quantity {
        self.resources
            .get(name)
            .map(|quantities| quantities.iter().sum())
            .unwrap_or(Quantity::ZERO)
    }

    /// Combines two allocations held by the same worker into a single view,
    /// adding quantities instance by instance. This is used to report the
    /// per-task and lifetime allocations of an actor worker together.
    /// The result is a reporting view and cannot be released.
    pub fn merge(&self, other: &Allocation) -> Allocation {
        let mut resources = self.resources.clone();
        for (name, quantities) in &other.resources {
            let merged = resources.entry(name.clone()).or_default();
            if merged.len() < quantities.len() {
                merged.resize(quantities.len(), Quantity::ZERO);
            }
            for (index, quantity) in quantities.iter().enumerate() {
                merged[index] += *quantity;
            }
        }
        Allocation {
            id: AllocationId::from(MERGED_ALLOCATION_ID),
            resources,
        }
    }
}

/// Authoritative bookkeeping of per-instance fractional resource
/// availability for one node.
///
/// Quantities are tracked per physical instance. An instance-sliced
/// resource (e.g. GPUs) advertises a capacity of at most 1 per instance,
/// so outstanding allocations for it stay within `[0, 1]`; a fungible
/// resource advertises a single instance with an arbitrary non-negative
/// capacity.
#[derive(Debug)]
pub struct ResourceInstanceLedger {
    capacity: BTreeMap<String, Vec<Quantity>>,
    available: BTreeMap<String, Vec<Quantity>>,
    outstanding: HashSet<AllocationId>,
    allocation_id_generator: IdGenerator<AllocationId>,
}

impl ResourceInstanceLedger {
    pub fn new(capacity: BTreeMap<String, Vec<Quantity>>) -> Self {
        let available = capacity.clone();
        Self {
            capacity,
            available,
            outstanding: HashSet::new(),
            allocation_id_generator: IdGenerator::new(),
        }
    }

    /// Reserves the requested per-instance quantities.
    /// The reservation is atomic across all resources in the request:
    /// either every quantity is reserved or the ledger is left unchanged
    /// and the call fails with `InsufficientResources`.
    pub fn allocate(&mut self, request: &ResourceRequest) -> NodeResult<Allocation> {
        for (name, quantities) in request {
            let Some(available) = self.available.get(name) else {
                return Err(NodeError::InsufficientResources {
                    message: format!("resource {name} is not advertised by this node"),
                });
            };
            if quantities.len() > available.len() {
                return Err(NodeError::InsufficientResources {
                    message: format!(
                        "resource {name} has {} instances but {} were requested",
                        available.len(),
                        quantities.len()
                    ),
                });
            }
            for (index, quantity) in quantities.iter().enumerate() {
                if quantity.is_sign_negative() {
                    return Err(NodeError::InternalError(format!(
                        "negative quantity {quantity} requested for resource {name}"
                    )));
                }
                if *quantity > available[index] {
                    return Err(NodeError::InsufficientResources {
                        message: format!(
                            "resource {name} instance {index}: requested {quantity}, available {}",
                            available[index]
                        ),
                    });
                }
            }
        }
        for (name, quantities) in request {
            let Some(available) = self.available.get_mut(name) else {
                continue;
            };
            for (index, quantity) in quantities.iter().enumerate() {
                available[index] -= *quantity;
            }
        }
        let id = self.allocation_id_generator.next()?;
        self.outstanding.insert(id);
        Ok(Allocation {
            id,
            resources: request.clone(),
        })
    }

    /// Returns the quantities of an allocation to the free pool.
    /// Each allocation may be released at most once; a second release of
    /// the same allocation fails with `DoubleRelease` and leaves the
    /// ledger unchanged.
    pub fn release(&mut self, allocation: &Allocation) -> NodeResult<()> {
        if !self.outstanding.contains(&allocation.id) {
            return Err(NodeError::DoubleRelease(allocation.id));
        }
        for (name, quantities) in &allocation.resources {
            let (Some(available), Some(capacity)) =
                (self.available.get(name), self.capacity.get(name))
            else {
                return Err(NodeError::InternalError(format!(
                    "allocation {} refers to unknown resource {name}",
                    allocation.id
                )));
            };
            for (index, quantity) in quantities.iter().enumerate() {
                if available[index] + *quantity > capacity[index] {
                    return Err(NodeError::InternalError(format!(
                        "releasing allocation {} would exceed the capacity of resource {name}",
                        allocation.id
                    )));
                }
            }
        }
        self.outstanding.remove(&allocation.id);
        for (name, quantities) in &allocation.resources {
            let Some(available) = self.available.get_mut(name) else {
                continue;
            };
            for (index, quantity) in quantities.iter().enumerate() {
                available[index] += *quantity;
            }
        }
        Ok(())
    }

    pub fn capacity(&self, name: &str) -> Option<&[Quantity]> {
        self.capacity.get(name).map(|x| x.as_slice())
    }

    pub fn available(&self, name: &str) -> Option<&[Quantity]> {
        self.available.get(name).map(|x| x.as_slice())
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.capacity.keys().map(|x| x.as_str())
    }

    /// Returns the fraction of a resource currently allocated, summed over
    /// all instances. This feeds the per-resource utilization gauges.
    pub fn utilization(&self, name: &str) -> Option<f64> {
        let capacity: Quantity = self.capacity.get(name)?.iter().sum();
        if capacity.is_zero() {
            return Some(0.0);
        }
        let available: Quantity = self.available.get(name)?.iter().sum();
        let used = capacity - available;
        Some((used / capacity).to_f64().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn ledger() -> ResourceInstanceLedger {
        ResourceInstanceLedger::new(BTreeMap::from([
            ("CPU".to_string(), vec![dec!(4)]),
            ("GPU".to_string(), vec![dec!(1), dec!(1)]),
        ]))
    }

    fn request(entries: &[(&str, &[Quantity])]) -> ResourceRequest {
        entries
            .iter()
            .map(|(name, quantities)| (name.to_string(), quantities.to_vec()))
            .collect()
    }

    #[test]
    fn test_allocate_and_release_restores_availability() {
        let mut ledger = ledger();
        let allocation = ledger
            .allocate(&request(&[
                ("CPU", &[dec!(1)]),
                ("GPU", &[dec!(0.5), dec!(1)]),
            ]))
            .unwrap();
        assert_eq!(ledger.available("CPU").unwrap(), &[dec!(3)]);
        assert_eq!(ledger.available("GPU").unwrap(), &[dec!(0.5), dec!(0)]);
        ledger.release(&allocation).unwrap();
        assert_eq!(ledger.available("CPU").unwrap(), &[dec!(4)]);
        assert_eq!(ledger.available("GPU").unwrap(), &[dec!(1), dec!(1)]);
    }

    #[test]
    fn test_allocate_is_atomic_on_failure() {
        let mut ledger = ledger();
        // The CPU portion is satisfiable but the GPU portion is not;
        // nothing may be reserved.
        let result = ledger.allocate(&request(&[
            ("CPU", &[dec!(2)]),
            ("GPU", &[dec!(1), dec!(1.5)]),
        ]));
        assert!(matches!(
            result,
            Err(NodeError::InsufficientResources { .. })
        ));
        assert_eq!(ledger.available("CPU").unwrap(), &[dec!(4)]);
        assert_eq!(ledger.available("GPU").unwrap(), &[dec!(1), dec!(1)]);
    }

    #[test]
    fn test_allocate_unknown_resource() {
        let mut ledger = ledger();
        let result = ledger.allocate(&request(&[("TPU", &[dec!(1)])]));
        assert!(matches!(
            result,
            Err(NodeError::InsufficientResources { .. })
        ));
    }

    #[test]
    fn test_double_release_is_detected() {
        let mut ledger = ledger();
        let allocation = ledger.allocate(&request(&[("CPU", &[dec!(1)])])).unwrap();
        ledger.release(&allocation).unwrap();
        let result = ledger.release(&allocation);
        assert!(matches!(result, Err(NodeError::DoubleRelease(_))));
        assert_eq!(ledger.available("CPU").unwrap(), &[dec!(4)]);
    }

    #[test]
    fn test_fractional_cycles_do_not_drift() {
        let mut ledger = ledger();
        for _ in 0..1000 {
            let allocation = ledger
                .allocate(&request(&[("CPU", &[dec!(0.1)]), ("GPU", &[dec!(0.3)])]))
                .unwrap();
            ledger.release(&allocation).unwrap();
        }
        assert_eq!(ledger.available("CPU").unwrap(), &[dec!(4)]);
        assert_eq!(ledger.available("GPU").unwrap(), &[dec!(1), dec!(1)]);
    }

    #[test]
    fn test_availability_never_exceeded() {
        let mut ledger = ledger();
        let first = ledger.allocate(&request(&[("GPU", &[dec!(0.7)])])).unwrap();
        let second = ledger.allocate(&request(&[("GPU", &[dec!(0.3)])])).unwrap();
        // GPU instance 0 is fully committed now.
        let result = ledger.allocate(&request(&[("GPU", &[dec!(0.1)])]));
        assert!(matches!(
            result,
            Err(NodeError::InsufficientResources { .. })
        ));
        ledger.release(&first).unwrap();
        ledger.release(&second).unwrap();
    }

    #[test]
    fn test_merge_is_pure_and_not_releasable() {
        let mut ledger = ledger();
        let task = ledger
            .allocate(&request(&[("GPU", &[dec!(0.25), dec!(0)])]))
            .unwrap();
        let lifetime = ledger
            .allocate(&request(&[("GPU", &[dec!(0.5)])]))
            .unwrap();
        let available_before = ledger.available("GPU").unwrap().to_vec();
        let merged = task.merge(&lifetime);
        assert_eq!(merged.get("GPU").unwrap(), &[dec!(0.75), dec!(0)]);
        assert_eq!(ledger.available("GPU").unwrap(), available_before);
        let result = ledger.release(&merged);
        assert!(matches!(result, Err(NodeError::DoubleRelease(_))));
    }

    #[test]
    fn test_utilization() {
        let mut ledger = ledger();
        assert_eq!(ledger.utilization("CPU"), Some(0.0));
        let _allocation = ledger.allocate(&request(&[("CPU", &[dec!(1)])])).unwrap();
        assert_eq!(ledger.utilization("CPU"), Some(0.25));
        assert_eq!(ledger.utilization("TPU"), None);
    }
}
