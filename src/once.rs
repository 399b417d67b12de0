//! A cell that is written at most once, with fallible initialization.
// TODO: Switch to `std::cell::OnceCell` once `get_or_try_init` is
//       stable.

use std::cell::UnsafeCell;
use std::fmt;


/// A cell which can be written to only once.
///
/// Shared references to the inner value can be handed out without
/// runtime borrow checks.
pub(crate) struct OnceCell<T> {
    // Invariant: only ever written to while `None` through a shared
    //            reference.
    inner: UnsafeCell<Option<T>>,
}

impl<T> OnceCell<T> {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> Option<&T> {
        // SAFETY: Once set, the value is never modified through a
        //         shared reference.
        unsafe { &*self.inner.get() }.as_ref()
    }

    /// Set the value if the cell is still empty, handing `value` back
    /// otherwise.
    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        if self.get().is_some() {
            return Err(value)
        }
        // SAFETY: The slot is empty, so nobody can hold a reference to
        //         its contents.
        let slot = unsafe { &mut *self.inner.get() };
        *slot = Some(value);
        Ok(())
    }

    #[inline]
    pub(crate) fn get_or_init<F>(&self, f: F) -> &T
    where
        F: FnOnce() -> T,
    {
        match self.get_or_try_init(|| Ok::<T, ()>(f())) {
            Ok(val) => val,
            Err(()) => unreachable!(),
        }
    }

    /// Get the contents of the cell, initializing it with `f` if it
    /// was empty. A failure of `f` leaves the cell empty.
    ///
    /// # Panics
    /// Reentrant initialization from within `f` panics.
    pub(crate) fn get_or_try_init<F, E>(&self, f: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(val) = self.get() {
            return Ok(val)
        }

        let val = f()?;
        if self.set(val).is_err() {
            panic!("reentrant OnceCell initialization")
        }
        // SANITY: We just populated the cell.
        Ok(self.get().unwrap())
    }
}

impl<T> Default for OnceCell<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for OnceCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_tuple("OnceCell");
        match self.get() {
            Some(v) => d.field(v),
            None => d.field(&format_args!("<uninit>")),
        };
        d.finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_tag::tag;


    /// Check basic set and retrieval semantics.
    #[tag(miri)]
    #[test]
    fn set_once() {
        let cell = OnceCell::new();
        assert_eq!(format!("{cell:?}"), "OnceCell(<uninit>)");
        assert_eq!(cell.set(1), Ok(()));
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    /// Make sure that a failed initialization leaves the cell empty.
    #[tag(miri)]
    #[test]
    fn failed_init() {
        let cell = OnceCell::<u32>::new();
        let result = cell.get_or_try_init(|| Err("nope"));
        assert_eq!(result, Err("nope"));
        assert_eq!(cell.get(), None);

        let value = cell.get_or_try_init(|| Ok::<_, ()>(42)).unwrap();
        assert_eq!(*value, 42);
        assert_eq!(*cell.get_or_init(|| 43), 42);
    }
}
