use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::LimitsConfig;
use crate::error::{EngineError, EngineResult};

/// Process-wide admission gates: searches and ingests are capped
/// independently, with an optional per-tenant cap across both. Admission
/// never queues; beyond a cap the request fails fast with `overloaded`.
pub struct AdmissionController {
    searches: Gate,
    ingests: Gate,
    tenant_cap: Option<usize>,
    tenants: DashMap<String, Arc<AtomicUsize>>,
}

#[derive(Debug)]
struct Gate {
    active: AtomicUsize,
    max: usize,
}

impl Gate {
    fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < self.max {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// RAII admission slot; dropping it releases the gate (and the tenant
/// counter when a per-tenant cap is set).
#[derive(Debug)]
pub struct Permit<'a> {
    gate: &'a Gate,
    tenant: Option<Arc<AtomicUsize>>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.release();
        if let Some(counter) = &self.tenant {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl AdmissionController {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            searches: Gate::new(limits.search.max_concurrent),
            ingests: Gate::new(limits.ingest.max_concurrent),
            tenant_cap: limits.tenant.max_concurrent,
            tenants: DashMap::new(),
        }
    }

    pub fn admit_search(&self, tenant: &str) -> EngineResult<Permit<'_>> {
        self.admit(&self.searches, tenant, "search")
    }

    pub fn admit_ingest(&self, tenant: &str) -> EngineResult<Permit<'_>> {
        self.admit(&self.ingests, tenant, "ingest")
    }

    pub fn active_searches(&self) -> usize {
        self.searches.active.load(Ordering::Acquire)
    }

    pub fn active_ingests(&self) -> usize {
        self.ingests.active.load(Ordering::Acquire)
    }

    fn admit<'a>(&'a self, gate: &'a Gate, tenant: &str, op: &str) -> EngineResult<Permit<'a>> {
        if !gate.try_acquire() {
            return Err(EngineError::Overloaded(format!(
                "{op} concurrency limit ({}) reached",
                gate.max
            )));
        }

        let tenant_counter = match self.tenant_cap {
            None => None,
            Some(cap) => {
                let counter = self
                    .tenants
                    .entry(tenant.to_string())
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                    .clone();
                let admitted = counter
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        if current < cap {
                            Some(current + 1)
                        } else {
                            None
                        }
                    })
                    .is_ok();
                if !admitted {
                    gate.release();
                    return Err(EngineError::Overloaded(format!(
                        "tenant '{tenant}' concurrency limit ({cap}) reached"
                    )));
                }
                Some(counter)
            }
        };

        Ok(Permit {
            gate,
            tenant: tenant_counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestLimits, SearchLimits, TenantLimits};

    fn limits(search: usize, ingest: usize, tenant: Option<usize>) -> LimitsConfig {
        LimitsConfig {
            search: SearchLimits {
                max_concurrent: search,
                ..Default::default()
            },
            ingest: IngestLimits {
                max_concurrent: ingest,
                ..Default::default()
            },
            tenant: TenantLimits {
                max_concurrent: tenant,
            },
        }
    }

    #[test]
    fn search_gate_sheds_beyond_cap() {
        let admission = AdmissionController::new(&limits(2, 4, None));

        let p1 = admission.admit_search("a").unwrap();
        let _p2 = admission.admit_search("a").unwrap();
        assert_eq!(admission.active_searches(), 2);

        let err = admission.admit_search("a").unwrap_err();
        assert_eq!(err.code(), "overloaded");

        drop(p1);
        assert_eq!(admission.active_searches(), 1);
        let _p3 = admission.admit_search("a").unwrap();
    }

    #[test]
    fn gates_are_independent() {
        let admission = AdmissionController::new(&limits(1, 1, None));
        let _s = admission.admit_search("a").unwrap();
        // a held search slot does not block ingest admission
        let _i = admission.admit_ingest("a").unwrap();
        assert!(admission.admit_search("b").is_err());
    }

    #[test]
    fn tenant_cap_spans_both_gates() {
        let admission = AdmissionController::new(&limits(8, 8, Some(2)));

        let _p1 = admission.admit_search("acme").unwrap();
        let _p2 = admission.admit_ingest("acme").unwrap();
        let err = admission.admit_search("acme").unwrap_err();
        assert_eq!(err.code(), "overloaded");

        // other tenants are unaffected
        let _p3 = admission.admit_search("globex").unwrap();
    }

    #[test]
    fn tenant_rejection_releases_the_gate_slot() {
        let admission = AdmissionController::new(&limits(1, 1, Some(1)));
        let p1 = admission.admit_search("acme").unwrap();
        assert!(admission.admit_search("acme").is_err());
        drop(p1);
        // both the gate and the tenant counter were released
        let _p2 = admission.admit_search("acme").unwrap();
    }

    #[test]
    fn exactly_cap_permits_run_concurrently() {
        let admission = AdmissionController::new(&limits(2, 2, None));
        let mut granted = 0;
        let mut shed = 0;
        let mut held = Vec::new();
        for _ in 0..10 {
            match admission.admit_search("t") {
                Ok(p) => {
                    granted += 1;
                    held.push(p);
                }
                Err(_) => shed += 1,
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(shed, 8);
        assert_eq!(admission.active_searches(), 2);
    }
}
