//! Global registry for named statistics counters.
//!
//! Drivers create counters by name at construction time and keep the
//! returned handles for hot-path increments; diagnostic code looks counters
//! up by name. Creating a name twice yields the same underlying counter.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64};
use spin::{Mutex, Once};

/// A registered counter, 32- or 64-bit wide.
#[derive(Clone)]
pub enum Stat {
    /// 32-bit counter or gauge.
    U32(Arc<AtomicU32>),
    /// 64-bit counter.
    U64(Arc<AtomicU64>),
}

/// Global counter registry.
static REGISTRY: Once<Mutex<BTreeMap<String, Stat>>> = Once::new();

/// Get the registry, initializing if needed.
fn registry() -> &'static Mutex<BTreeMap<String, Stat>> {
    REGISTRY.call_once(|| Mutex::new(BTreeMap::new()))
}

/// Create (or fetch) a 32-bit counter with the given name.
///
/// # Panics
///
/// Panics if the name is already registered with a different width.
pub fn create_u32(name: &str) -> Arc<AtomicU32> {
    let mut map = registry().lock();
    match map
        .entry(name.to_string())
        .or_insert_with(|| Stat::U32(Arc::new(AtomicU32::new(0))))
    {
        Stat::U32(c) => c.clone(),
        Stat::U64(_) => panic!("stat {} already registered as u64", name),
    }
}

/// Create (or fetch) a 64-bit counter with the given name.
///
/// # Panics
///
/// Panics if the name is already registered with a different width.
pub fn create_u64(name: &str) -> Arc<AtomicU64> {
    let mut map = registry().lock();
    match map
        .entry(name.to_string())
        .or_insert_with(|| Stat::U64(Arc::new(AtomicU64::new(0))))
    {
        Stat::U64(c) => c.clone(),
        Stat::U32(_) => panic!("stat {} already registered as u32", name),
    }
}

/// Look up a counter by name.
pub fn get(name: &str) -> Option<Stat> {
    registry().lock().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn test_create_and_increment() {
        let c = create_u64("test.stats.increment");
        c.fetch_add(3, Ordering::Relaxed);

        match get("test.stats.increment") {
            Some(Stat::U64(seen)) => assert_eq!(seen.load(Ordering::Relaxed), 3),
            _ => panic!("counter missing"),
        }
    }

    #[test]
    fn test_create_is_idempotent() {
        let a = create_u32("test.stats.same");
        let b = create_u32("test.stats.same");
        a.store(7, Ordering::Relaxed);
        assert_eq!(b.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_unknown_name() {
        assert!(get("test.stats.unknown").is_none());
    }
}
