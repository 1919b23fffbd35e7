//! Process-wide kernel registry.
//!
//! Every generated driver registers a record for its equation on first
//! execution, keyed by a stable fingerprint of the canonicalized analysis.
//! Reverse-mode integrations look adjoint availability up here instead of
//! relying on which frameworks happen to be in scope at expansion time.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Metadata about one compiled equation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRecord {
    /// Stable hash of the canonical equation rendering.
    pub fingerprint: u64,
    /// Canonical equation text, e.g. `z[i, k] := a[i, j] * b[j, k]`.
    pub equation: String,
    /// Named-axis labels of the output, when the call site used any.
    pub axis_names: Vec<String>,
    /// Whether a pullback was synthesized alongside the forward kernel.
    pub has_gradient: bool,
}

fn table() -> &'static Mutex<HashMap<u64, KernelRecord>> {
    static TABLE: OnceLock<Mutex<HashMap<u64, KernelRecord>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record a kernel; the first registration for a fingerprint wins.
pub fn register(record: KernelRecord) {
    let mut t = table().lock().expect("kernel registry poisoned");
    t.entry(record.fingerprint).or_insert(record);
}

pub fn lookup(fingerprint: u64) -> Option<KernelRecord> {
    let t = table().lock().expect("kernel registry poisoned");
    t.get(&fingerprint).cloned()
}

pub fn len() -> usize {
    table().lock().expect("kernel registry poisoned").len()
}

/// Snapshot of every registered record, in no particular order.
pub fn all() -> Vec<KernelRecord> {
    let t = table().lock().expect("kernel registry poisoned");
    t.values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let rec = KernelRecord {
            fingerprint: 0xfeed,
            equation: "z[i] := a[i, j]".into(),
            axis_names: vec![],
            has_gradient: false,
        };
        register(rec.clone());
        // duplicate registration is a no-op
        register(KernelRecord {
            has_gradient: true,
            ..rec.clone()
        });
        assert_eq!(lookup(0xfeed), Some(rec));
        assert_eq!(lookup(0xdead_0000_0000_0000), None);
    }
}
