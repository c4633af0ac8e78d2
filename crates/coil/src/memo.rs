//! Lazily computed values shared across threads.

use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Boxed producer used by [`Memoized`] when the closure type is not named.
pub type Producer<T> = Box<dyn FnOnce() -> T + Send>;

/// A value computed on first access, at most once.
///
/// Reads after the first computation never lock. The first computation is
/// guarded with check, lock, check: callers racing on an unset value wait on
/// the lock and then find the value already stored by the winner. Whether the
/// value is set is tracked separately from the value itself, so the producer
/// may return anything, including `None` or an empty collection.
///
/// The producer is dropped as soon as it has run, together with everything it
/// captured.
pub struct Memoized<T, F = Producer<T>> {
    value: OnceLock<T>,
    producer: Mutex<Option<F>>,
}

impl<T, F> Memoized<T, F>
where
    F: FnOnce() -> T,
{
    pub fn new(producer: F) -> Self {
        Self {
            value: OnceLock::new(),
            producer: Mutex::new(Some(producer)),
        }
    }

    /// Return the memoized value, computing it if this is the first access.
    ///
    /// # Panics
    ///
    /// Panics if the producer panicked during an earlier access.
    pub fn get(&self) -> &T {
        if let Some(value) = self.value.get() {
            return value;
        }
        let mut producer = self.producer.lock();
        if let Some(value) = self.value.get() {
            return value;
        }
        match producer.take() {
            Some(produce) => self.value.get_or_init(produce),
            None => panic!("memoized producer panicked during an earlier access"),
        }
    }

    /// The value, if it has been computed.
    pub fn peek(&self) -> Option<&T> {
        self.value.get()
    }

    pub fn is_computed(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<T> Memoized<T> {
    /// Memoize a boxed producer, for storage in homogeneous collections.
    pub fn boxed(producer: impl FnOnce() -> T + Send + 'static) -> Self {
        Self::new(Box::new(producer) as Producer<T>)
    }
}

impl<T: fmt::Debug, F> fmt::Debug for Memoized<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("value", &self.value.get())
            .finish_non_exhaustive()
    }
}
