//! Lock striping for the dependency store
//!
//! Every tag and every key hash maps onto one of a fixed number of stripes. An
//! operation locks the stripes of everything it will mutate, always in ascending
//! stripe order, so two operations over overlapping tag sets can never deadlock and
//! operations over unrelated tags rarely contend.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Which namespace a name belongs to; a tag and a hash with the same text are
/// different lock subjects.
#[derive(Debug, Clone, Copy, Hash)]
enum Subject {
    Tag,
    Key,
}

/// Fixed array of mutex stripes
pub struct LockStripes {
    stripes: Box<[Mutex<()>]>,
    mask: usize,
}

impl LockStripes {
    /// Create `count` stripes, rounded up to a power of two (at least one)
    pub fn new(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        let stripes = (0..count).map(|_| Mutex::new(())).collect::<Vec<_>>();
        Self {
            stripes: stripes.into_boxed_slice(),
            mask: count - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    fn stripe_of(&self, subject: Subject, name: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        subject.hash(&mut hasher);
        name.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    /// Stripe guarding a dependency tag's member set
    pub fn tag_stripe(&self, tag: &str) -> usize {
        self.stripe_of(Subject::Tag, tag)
    }

    /// Stripe guarding a primary entry
    pub fn key_stripe(&self, hash: &str) -> usize {
        self.stripe_of(Subject::Key, hash)
    }

    /// Lock the given stripes in ascending order
    pub fn lock(&self, stripes: &BTreeSet<usize>) -> StripeGuard<'_> {
        let guards = stripes.iter().map(|&i| self.stripes[i].lock()).collect();
        StripeGuard {
            held: stripes.clone(),
            _guards: guards,
        }
    }

    /// Lock every stripe
    pub fn lock_all(&self) -> StripeGuard<'_> {
        let all: BTreeSet<usize> = (0..self.stripes.len()).collect();
        self.lock(&all)
    }
}

impl std::fmt::Debug for LockStripes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockStripes").field("stripes", &self.stripes.len()).finish()
    }
}

/// Held stripes; released on drop
pub struct StripeGuard<'a> {
    held: BTreeSet<usize>,
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl StripeGuard<'_> {
    /// True if every stripe in `required` is held
    pub fn covers(&self, required: &BTreeSet<usize>) -> bool {
        required.is_subset(&self.held)
    }

    pub fn held(&self) -> &BTreeSet<usize> {
        &self.held
    }
}
