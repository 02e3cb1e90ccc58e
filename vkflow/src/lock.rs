//! Interior mutability whose thread-safety is selected by the `threadsafe` feature.
//!
//! With the feature enabled, [`Lock`] is a [`parking_lot::Mutex`] and [`Counter`] is an atomic.
//! Without it, both degrade to their single-threaded `RefCell`/`Cell` counterparts, which makes
//! the types containing them `!Sync`.

#[cfg(feature = "threadsafe")]
pub(crate) use self::threadsafe::{Counter, Lock};

#[cfg(not(feature = "threadsafe"))]
pub(crate) use self::local::{Counter, Lock};

#[cfg(feature = "threadsafe")]
mod threadsafe {
    use std::sync::atomic::{AtomicU64, Ordering};

    pub(crate) type Lock<T> = parking_lot::Mutex<T>;

    #[derive(Debug)]
    pub(crate) struct Counter {
        inner: AtomicU64,
    }

    impl Counter {
        pub(crate) const fn new(value: u64) -> Self {
            Counter {
                inner: AtomicU64::new(value),
            }
        }

        #[inline]
        pub(crate) fn load(&self) -> u64 {
            self.inner.load(Ordering::Acquire)
        }

        /// Increments the counter and returns the new value.
        #[inline]
        pub(crate) fn increment(&self) -> u64 {
            self.inner.fetch_add(1, Ordering::AcqRel) + 1
        }
    }
}

#[cfg(not(feature = "threadsafe"))]
mod local {
    use std::cell::{Cell, RefCell, RefMut};

    #[derive(Debug, Default)]
    pub(crate) struct Lock<T> {
        inner: RefCell<T>,
    }

    impl<T> Lock<T> {
        pub(crate) const fn new(value: T) -> Self {
            Lock {
                inner: RefCell::new(value),
            }
        }

        #[inline]
        pub(crate) fn lock(&self) -> RefMut<'_, T> {
            self.inner.borrow_mut()
        }

        #[inline]
        pub(crate) fn get_mut(&mut self) -> &mut T {
            self.inner.get_mut()
        }
    }

    #[derive(Debug)]
    pub(crate) struct Counter {
        inner: Cell<u64>,
    }

    impl Counter {
        pub(crate) const fn new(value: u64) -> Self {
            Counter {
                inner: Cell::new(value),
            }
        }

        #[inline]
        pub(crate) fn load(&self) -> u64 {
            self.inner.get()
        }

        #[inline]
        pub(crate) fn increment(&self) -> u64 {
            let value = self.inner.get() + 1;
            self.inner.set(value);

            value
        }
    }
}
