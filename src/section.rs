//! Scoped allocator sections
//!
//! All cache-touching work between suspension points runs inside one of two
//! scoped sections:
//!
//! - a **read section** covers cursor navigation and entry lookup; no
//!   concurrent invalidation can move references out from under the scope
//!   (only operations performed inside it, such as dummy elision, may do so,
//!   and they restore the cursor themselves);
//! - an **update section** additionally covers insertion, promotion into the
//!   latest version, and eviction. On every exit, including an early return,
//!   the guard inspects the region's allocation-failure flag and invalidates
//!   outstanding references, so failed population can never leak dangling
//!   handles. Allocation failure is a result kind that the guard resolves;
//!   no cleanup obligation falls on the failing call site.
//!
//! Guards are owned values and deliberately `!Send`: a `Send` future cannot
//! hold one across an `.await`, which is the sections-never-span-suspensions
//! rule enforced at the type level. Sections do not nest.

use crate::partition::Region;
use std::marker::PhantomData;
use std::sync::Arc;

/// Factory for scoped sections over one region
#[derive(Clone)]
pub struct LsaManager {
    region: Arc<Region>,
}

impl LsaManager {
    /// Manager over `region`
    pub fn new(region: Arc<Region>) -> Self {
        Self { region }
    }

    /// The managed region
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Enter a read section
    pub fn read_section(&self) -> ReadSection {
        self.region.enter_section();
        ReadSection {
            region: self.region.clone(),
            _not_send: PhantomData,
        }
    }

    /// Enter an update section
    pub fn update_section(&self) -> UpdateSection {
        self.region.enter_section();
        UpdateSection {
            region: self.region.clone(),
            _not_send: PhantomData,
        }
    }
}

/// Scope for navigation and lookup
pub struct ReadSection {
    region: Arc<Region>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadSection {
    fn drop(&mut self) {
        // Population can run under a read section on the cache-hit path;
        // a failed allocation there still invalidates on exit.
        if self.region.take_alloc_failure() {
            self.region.invalidate_references();
        }
        self.region.exit_section();
    }
}

/// Scope for insertion, promotion, and eviction
pub struct UpdateSection {
    region: Arc<Region>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for UpdateSection {
    fn drop(&mut self) {
        if self.region.take_alloc_failure() {
            self.region.invalidate_references();
        }
        self.region.exit_section();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_section_resolves_alloc_failure() {
        let region = Arc::new(Region::new());
        let lsa = LsaManager::new(region.clone());
        let generation = region.reference_generation();
        {
            let _section = lsa.update_section();
            region.fail_next_allocation();
            assert!(region.try_alloc().is_err());
            // Still the same generation while inside the section.
            assert_eq!(region.reference_generation(), generation);
        }
        // Exit invalidated references exactly once.
        assert_eq!(region.reference_generation(), generation + 1);
    }

    #[test]
    fn test_clean_exit_keeps_references() {
        let region = Arc::new(Region::new());
        let lsa = LsaManager::new(region.clone());
        let generation = region.reference_generation();
        {
            let _section = lsa.read_section();
            assert!(region.try_alloc().is_ok());
        }
        assert_eq!(region.reference_generation(), generation);
    }

    #[test]
    fn test_sections_are_sequential() {
        let region = Arc::new(Region::new());
        let lsa = LsaManager::new(region.clone());
        drop(lsa.read_section());
        drop(lsa.update_section());
        drop(lsa.read_section());
    }
}
