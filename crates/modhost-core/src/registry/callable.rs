//! Type-erased function references stored in the registries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A registered function of any signature.
///
/// Registrants store plain function pointers (`fn(&str) -> i32` and the
/// like); dispatchers recover them with [`Callable::get`] using the
/// signature agreed for the hook or slot.
#[derive(Clone)]
pub struct Callable(Arc<dyn Any + Send + Sync>);

impl Callable {
    pub fn new<F: Any + Send + Sync>(f: F) -> Self {
        Self(Arc::new(f))
    }

    /// Copy the stored function out if it has type `F`.
    pub fn get<F: Any + Copy>(&self) -> Option<F> {
        self.0.downcast_ref::<F>().copied()
    }

    pub fn downcast_ref<F: Any>(&self) -> Option<&F> {
        self.0.downcast_ref::<F>()
    }

    pub fn is<F: Any>(&self) -> bool {
        self.0.downcast_ref::<F>().is_some()
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callable(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(x: i32) -> i32 {
        x * 2
    }

    #[test]
    fn test_round_trip_fn_pointer() {
        let c = Callable::new(double as fn(i32) -> i32);
        assert!(c.is::<fn(i32) -> i32>());
        let f = c.get::<fn(i32) -> i32>().unwrap();
        assert_eq!(f(21), 42);
        assert!(c.get::<fn(i64) -> i64>().is_none());
    }
}
