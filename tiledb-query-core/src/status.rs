use std::sync::atomic::{AtomicU8, Ordering};

/// The lifecycle state of a `Query`, per `SPEC_FULL.md` §4.7.
///
/// `status()` must be safe to call from a thread other than the one
/// driving `submit`/`async_process` (a background worker transitions the
/// status; observers only ever load it). It is stored as an `AtomicU8` so
/// reads never race with the single writer that owns the transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    Uninitialized = 0,
    InProgress = 1,
    Incomplete = 2,
    Completed = 3,
    Failed = 4,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Uninitialized,
            1 => Status::InProgress,
            2 => Status::Incomplete,
            3 => Status::Completed,
            4 => Status::Failed,
            _ => unreachable!("invalid status discriminant"),
        }
    }

    /// `Completed` or `Failed`: the query is inert and will not transition
    /// again without a fresh `init`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

/// An atomically-observable status cell shared between the thread driving
/// a query and any thread merely calling `status()`/`overflow()`.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(initial: Status) -> Self {
        AtomicStatus(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        AtomicStatus::new(Status::Uninitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let s = AtomicStatus::new(Status::Uninitialized);
        assert_eq!(s.load(), Status::Uninitialized);
        s.store(Status::InProgress);
        assert_eq!(s.load(), Status::InProgress);
        assert!(!s.load().is_terminal());
        s.store(Status::Completed);
        assert!(s.load().is_terminal());
    }
}
