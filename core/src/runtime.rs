//! Rayon pools behind every `num_threads` option.
//!
//! `num_threads == 0` runs on the ambient pool, which is rayon's global pool
//! unless the caller is already inside another one. Any other count runs on a
//! dedicated pool of that size, built on first use and shared by every later
//! call with the same count.

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::{Error, Result};

/// Thread count of the configured global pool, or why configuring it failed.
static GLOBAL_POOL: OnceLock<std::result::Result<usize, String>> = OnceLock::new();

static DEDICATED_POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();

/// Thread count for the global pool when none is passed explicitly.
pub const CPU_THREADS_ENV: &str = "CLOUDREG_CPU_THREADS";

/// Size rayon's global pool, which serves every `num_threads == 0` call.
///
/// An explicit count takes precedence over [`CPU_THREADS_ENV`]. With neither,
/// rayon sizes the pool from the available cores. Only the first call has an
/// effect and later calls get its outcome back. Fails if the global pool was
/// already started by earlier parallel work.
///
/// Returns the number of threads in the global pool.
pub fn init_global_thread_pool(num_threads: Option<usize>) -> Result<usize> {
    let outcome = GLOBAL_POOL.get_or_init(|| {
        let requested = match num_threads {
            Some(n) => Some(n),
            None => threads_from_env()?,
        };
        let builder = match requested {
            Some(0) => return Err("the global pool needs at least one thread".to_string()),
            Some(n) => ThreadPoolBuilder::new().num_threads(n),
            None => ThreadPoolBuilder::new(),
        };
        builder
            .thread_name(|i| format!("cloudreg-global-{i}"))
            .build_global()
            .map_err(|e| e.to_string())?;
        tracing::debug!(threads = rayon::current_num_threads(), "configured global thread pool");
        Ok(rayon::current_num_threads())
    });
    outcome.clone().map_err(Error::ThreadPool)
}

fn threads_from_env() -> std::result::Result<Option<usize>, String> {
    match env::var(CPU_THREADS_ENV) {
        Ok(raw) => parse_thread_count(&raw).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(format!("{CPU_THREADS_ENV}: {e}")),
    }
}

fn parse_thread_count(raw: &str) -> std::result::Result<usize, String> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(format!("{CPU_THREADS_ENV}={raw:?} asks for zero threads")),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("{CPU_THREADS_ENV}={raw:?} is not a thread count")),
    }
}

/// The shared pool of exactly `num_threads` workers.
fn dedicated_pool(num_threads: usize) -> std::result::Result<Arc<ThreadPool>, ThreadPoolBuildError> {
    let mut pools = DEDICATED_POOLS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(pool) = pools.get(&num_threads) {
        return Ok(Arc::clone(pool));
    }
    let pool = Arc::new(
        ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |i| format!("cloudreg-{num_threads}x-{i}"))
            .build()?,
    );
    pools.insert(num_threads, Arc::clone(&pool));
    Ok(pool)
}

/// Run `op` on the pool selected by `num_threads`.
///
/// If a dedicated pool cannot be built the work still runs, on the ambient
/// pool.
pub fn install<R, F>(num_threads: usize, op: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    if num_threads == 0 {
        return op();
    }

    match dedicated_pool(num_threads) {
        Ok(pool) => pool.install(op),
        Err(e) => {
            tracing::warn!(num_threads, error = %e, "falling back to the ambient thread pool");
            op()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_uses_requested_threads() {
        let n = install(3, rayon::current_num_threads);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_install_zero_runs_inline() {
        let value = install(0, || 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_pools_are_reused_per_thread_count() {
        let first = dedicated_pool(2).unwrap();
        let second = dedicated_pool(2).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = dedicated_pool(5).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(other.current_num_threads(), 5);
    }

    #[test]
    fn test_repeated_install_stays_on_one_pool() {
        let names: Vec<Option<String>> = (0..20)
            .map(|_| install(4, || std::thread::current().name().map(str::to_owned)))
            .collect();
        for name in names {
            let name = name.unwrap();
            assert!(name.starts_with("cloudreg-4x-"), "ran on {name}");
        }
    }

    #[test]
    fn test_parse_thread_count() {
        assert_eq!(parse_thread_count("8"), Ok(8));
        assert_eq!(parse_thread_count(" 2\n"), Ok(2));
        assert!(parse_thread_count("0").unwrap_err().contains("zero threads"));
        assert!(parse_thread_count("many").is_err());
        assert!(parse_thread_count("-1").is_err());
    }
}
