//! The Chronicle (immutable hash-chained audit log) lives outside the core;
//! mount only consumes its integrity-verify hook, one phase into the mount
//! pipeline.

use crate::hal::Hal;

/// External collaborator contract: mount calls `verify` once, before
/// trusting any other on-disk structure beyond the elected superblock and
/// epoch ring. A hook that can't reach its log should return `false` rather
/// than panic — mount treats that as "force read-only", not "abort".
pub trait IntegrityHook: Send + Sync {
    fn verify(&self, hal: &dyn Hal) -> bool;
}

/// Always-pass hook for volumes formatted without a Chronicle attached, or
/// for tests that don't exercise phase 5's failure path.
pub struct NullHook;

impl IntegrityHook for NullHook {
    fn verify(&self, _hal: &dyn Hal) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{HwFlags, MemHal};

    struct AlwaysFail;
    impl IntegrityHook for AlwaysFail {
        fn verify(&self, _hal: &dyn Hal) -> bool {
            false
        }
    }

    #[test]
    fn null_hook_always_passes() {
        let hal = MemHal::new(1 << 20, 512, HwFlags::empty());
        assert!(NullHook.verify(&hal));
    }

    #[test]
    fn custom_hook_can_fail() {
        let hal = MemHal::new(1 << 20, 512, HwFlags::empty());
        assert!(!AlwaysFail.verify(&hal));
    }
}
