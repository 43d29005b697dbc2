//! The Naming Pool (§4.A).
//!
//! Allocates unique, human-readable session names from a fixed list, falling
//! back to a numeric suffix once every name in the list is in use.
//! Allocation is serialized by its own lock so that two concurrent
//! `CreateSession` calls can never pick the same name — the authoritative
//! "used" set always comes from the live Session Registry at call time, the
//! pool itself holds no session state.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Fixed pool of 50 candidate names, matching the reference implementation's
/// fruit-name pool.
const NAME_POOL: [&str; 50] = [
  "apple", "apricot", "avocado", "banana", "blackberry", "blueberry", "boysenberry", "cantaloupe", "cherimoya",
  "cherry", "clementine", "coconut", "cranberry", "currant", "date", "dragonfruit", "durian", "elderberry", "fig",
  "gooseberry", "grape", "grapefruit", "guava", "honeydew", "jackfruit", "jujube", "kiwi", "kumquat", "lemon",
  "lime", "lychee", "mandarin", "mango", "mulberry", "nectarine", "olive", "orange", "papaya", "passionfruit",
  "peach", "pear", "persimmon", "pineapple", "plantain", "plum", "pomegranate", "quince", "raspberry",
  "starfruit", "tangerine",
];

/// Serializes name allocation so two concurrent `CreateSession` calls never
/// race to pick the same name. Holds no state of its own beyond the lock:
/// the "used" set is supplied fresh by the caller on every allocation.
pub struct NamingPool {
  lock: Mutex<()>,
}

impl NamingPool {
  #[must_use]
  pub fn new() -> Self {
    NamingPool { lock: Mutex::new(()) }
  }

  /// Allocate a name not present in `used`. If every name in the fixed pool
  /// is taken, appends a numeric suffix starting at 2 and increments until a
  /// free name is found (`apple`, then `apple2`, `apple3`, ...).
  ///
  /// # Panics
  /// Panics if the internal lock is poisoned by a prior panicking holder.
  #[must_use]
  pub fn allocate(&self, used: &HashSet<String>) -> String {
    let _guard = self.lock.lock().expect("naming pool lock poisoned");

    let mut rng = SmallRng::from_entropy();
    let free: Vec<&str> = NAME_POOL.iter().copied().filter(|n| !used.contains(*n)).collect();
    if !free.is_empty() {
      let name = free[rng.gen_range(0..free.len())];
      return name.to_string();
    }

    // Pool exhausted: fall back to a random base name with an incrementing
    // numeric suffix until we find one that isn't in use.
    let base = NAME_POOL[rng.gen_range(0..NAME_POOL.len())];
    let mut suffix = 2u64;
    loop {
      let candidate = format!("{base}{suffix}");
      if !used.contains(&candidate) {
        return candidate;
      }
      suffix += 1;
    }
  }
}

impl Default for NamingPool {
  fn default() -> Self {
    Self::new()
  }
}
