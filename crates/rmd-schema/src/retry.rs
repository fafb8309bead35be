//! Bounded retry around a fallible cache lookup.
//!
//! Schema registration propagates to caches asynchronously, so a miss right
//! after a new schema appears may be transient. Lookups are retried
//! immediately, without sleeping, up to a fixed number of attempts.

use std::error::Error as StdError;

/// Attempts made before a deserializer lookup gives up.
pub const MAX_RESOLVE_ATTEMPTS: u32 = 5;

/// A keyed lookup that may fail.
pub trait FallibleCache<K: ?Sized, V>: Send + Sync {
    /// Lookup failure
    type Error: StdError + Send + Sync + 'static;

    /// Look up `key`, populating the cache if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be produced right now.
    fn get(&self, key: &K) -> Result<V, Self::Error>;
}

/// Query `cache` up to `max_attempts` times, returning the first success.
///
/// `max_attempts` below one is treated as one.
///
/// # Errors
///
/// Returns [`RetryError`] carrying the attempt count and the last failure
/// once every attempt has failed.
pub fn retrying_get<K, V, C>(cache: &C, key: &K, max_attempts: u32) -> Result<V, RetryError<C::Error>>
where
    K: ?Sized,
    C: FallibleCache<K, V> + ?Sized,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match cache.get(key) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                tracing::warn!(attempt, max_attempts, error = %err, "Cache lookup failed, retrying");
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(attempts = attempt, error = %err, "Cache lookup failed, giving up");
                return Err(RetryError {
                    attempts: attempt,
                    last: err,
                });
            }
        }
    }
}

/// Every attempt of a retried lookup failed.
#[derive(Debug, thiserror::Error)]
#[error("lookup failed after {attempts} attempts: {last}")]
pub struct RetryError<E: StdError + 'static> {
    /// Attempts made
    pub attempts: u32,
    /// Failure of the final attempt
    #[source]
    pub last: E,
}
