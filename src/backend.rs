//! Compute backend enumeration.
//!
//! The list of available backends is probed once on first query and then
//! stays immutable for the lifetime of the process, so indices handed to a
//! caller remain valid for as long as the caller keeps them.

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::error::{EngineError, Result};

/// Kind of compute environment a backend represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Portable CPU execution.
    Cpu,
}

/// A single enumerable compute environment.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Backend kind tag.
    pub kind: BackendKind,
    /// Stable human-readable name.
    pub name: &'static str,
}

lazy_static! {
    static ref BACKENDS: RwLock<Option<Vec<Backend>>> = RwLock::new(None);
}

fn probe() -> Vec<Backend> {
    // Only the portable CPU path exists in this build. Accelerated backends
    // would be appended here in probe order, which fixes their indices.
    vec![Backend {
        kind: BackendKind::Cpu,
        name: "cpu",
    }]
}

fn with_backends<T>(f: impl FnOnce(&[Backend]) -> T) -> T {
    {
        let guard = BACKENDS.read();
        if let Some(list) = guard.as_ref() {
            return f(list);
        }
    }
    let mut guard = BACKENDS.write();
    let list = guard.get_or_insert_with(probe);
    f(list)
}

/// Number of available compute backends.
pub fn backend_count() -> usize {
    with_backends(|list| list.len())
}

/// Name of the backend at `index`.
///
/// Indices are stable for the process lifetime. Out-of-range indices are
/// rejected with [`EngineError::InvalidArgument`].
pub fn backend_name(index: usize) -> Result<&'static str> {
    with_backends(|list| {
        list.get(index).map(|b| b.name).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "backend index {index} out of range (count {})",
                list.len()
            ))
        })
    })
}

/// Kind tag of the backend at `index`.
pub fn backend_kind(index: usize) -> Result<BackendKind> {
    with_backends(|list| {
        list.get(index).map(|b| b.kind).ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "backend index {index} out of range (count {})",
                list.len()
            ))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_backend() {
        assert!(backend_count() >= 1);
    }

    #[test]
    fn names_stable_across_queries() {
        let first = backend_name(0).unwrap();
        for _ in 0..3 {
            assert_eq!(backend_name(0).unwrap(), first);
            assert_eq!(backend_count(), backend_count());
        }
    }

    #[test]
    fn cpu_backend_present() {
        let names: Vec<_> = (0..backend_count())
            .map(|i| backend_name(i).unwrap())
            .collect();
        assert!(names.contains(&"cpu"));
        assert_eq!(backend_kind(0).unwrap(), BackendKind::Cpu);
    }

    #[test]
    fn out_of_range_index_rejected() {
        let err = backend_name(backend_count()).unwrap_err();
        assert_eq!(err.status_code(), -1);
    }
}
