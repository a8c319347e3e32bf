use std::sync::atomic::{AtomicUsize, Ordering::*};

/// Version number of a channel's stored value.
///
/// Bumped once per genuine change. Uses a step size of 2 so the least
/// significant bit stays free for the disposed flag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Version(usize);

impl Version {
    /// Version of a channel that has never seen a change.
    pub const INITIAL: Self = Version(0);
    /// Increment between two consecutive versions.
    pub const STEP: usize = 2;

    /// Moves the version one step back so the next comparison reports a
    /// change.
    #[inline]
    pub fn decrement(&mut self) {
        self.0 = self.0.wrapping_sub(Self::STEP);
    }

    /// Number of changes this version represents.
    #[inline]
    pub fn changes(self) -> u64 {
        (self.0 / Self::STEP) as u64
    }

    pub(crate) fn inner(self) -> usize {
        self.0
    }
}

/// A snapshot of a channel's version and disposed status.
#[derive(Copy, Clone, Debug)]
pub(crate) struct StateSnapshot(usize);

impl StateSnapshot {
    pub(crate) const DISPOSED_BIT: usize = 1;

    #[inline]
    pub(crate) fn version(self) -> Version {
        Version(self.0 & !Self::DISPOSED_BIT)
    }

    #[inline]
    pub(crate) fn is_disposed(self) -> bool {
        (self.0 & Self::DISPOSED_BIT) == Self::DISPOSED_BIT
    }
}

/// Version and disposed flag packed into a single atomic word.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicUsize);

impl AtomicState {
    pub(crate) fn new() -> Self {
        AtomicState(AtomicUsize::new(Version::INITIAL.inner()))
    }

    #[inline]
    pub(crate) fn load(&self) -> StateSnapshot {
        StateSnapshot(self.0.load(Acquire))
    }

    /// Must only be called while the channel lock is held.
    #[inline]
    pub(crate) fn increment_version(&self) -> Version {
        let previous = self.0.fetch_add(Version::STEP, Release);
        StateSnapshot(previous.wrapping_add(Version::STEP)).version()
    }

    pub(crate) fn set_disposed(&self) {
        self.0.fetch_or(StateSnapshot::DISPOSED_BIT, Release);
    }
}
