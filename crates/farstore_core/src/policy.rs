//! Cache policy execution.
//!
//! A read consults the local cache, the network, or both, depending on its
//! policy. The cache-then-network policy is the one shape that can deliver
//! twice: the cached result first (never final), then the network result
//! (always final). The two deliveries are never reordered or coalesced.

use crate::cache::{QueryCache, QueryKey};
use crate::dispatch::{CancelHandle, Dispatcher};
use crate::error::{CoreResult, Error};
use crate::transport::{WireRequest, WireResponse};
use std::sync::Arc;
use tracing::debug;

/// How a read balances the local cache against the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Always execute the network call; never read or write the cache.
    #[default]
    IgnoreCache,
    /// Answer from the cache only; a miss fails with `NoCachedResult`.
    CacheOnly,
    /// Always execute the network call, with no cache fallback on failure.
    NetworkOnly,
    /// Answer from the cache on a hit; fall through to the network on a
    /// miss and remember the result.
    CacheElseNetwork,
    /// Execute the network call; fall back to the cache when it fails.
    NetworkElseCache,
    /// Deliver the cached result immediately (when present), then deliver
    /// the fresh network result and overwrite the cache.
    CacheThenNetwork,
}

/// Where a delivered result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// The local query cache.
    Cache,
    /// The remote service.
    Network,
}

/// One staged result of a read.
///
/// Under cache-then-network a non-blocking caller is invoked up to twice for
/// one logical request; `is_final` is false only for the intermediate cached
/// delivery and consumers must not mistake that first delivery for the last.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    /// The delivered result.
    pub value: T,
    /// Where the result came from.
    pub source: ResultSource,
    /// False only for the intermediate cached delivery.
    pub is_final: bool,
}

impl<T> Delivery<T> {
    /// Maps the delivered value, keeping source and finality.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Delivery<U> {
        Delivery {
            value: f(self.value),
            source: self.source,
            is_final: self.is_final,
        }
    }
}

/// Completion for a non-blocking read; may be invoked twice under
/// cache-then-network.
pub(crate) type ReadCompletion = Box<dyn FnMut(CoreResult<Delivery<WireResponse>>) + Send + 'static>;

/// Runs a read to completion on the caller thread.
///
/// Cache legs run inline; the network leg is submitted through the
/// dispatcher and awaited. A blocking caller can only receive one result, so
/// cache-then-network returns the final network result here (the cache is
/// still overwritten).
pub(crate) fn fetch_blocking(
    dispatcher: &Dispatcher,
    cache: &Arc<dyn QueryCache>,
    request: WireRequest,
    key: QueryKey,
    policy: CachePolicy,
) -> CoreResult<WireResponse> {
    match policy {
        CachePolicy::IgnoreCache | CachePolicy::NetworkOnly => dispatcher.execute_blocking(request),
        CachePolicy::CacheOnly => match cache.get(&key) {
            Some(result) => {
                debug!(?key, "cache-only hit");
                Ok(result)
            }
            None => Err(Error::NoCachedResult),
        },
        CachePolicy::CacheElseNetwork => match cache.get(&key) {
            Some(result) => {
                debug!(?key, "cache hit, skipping network");
                Ok(result)
            }
            None => {
                let result = dispatcher.execute_blocking(request)?;
                cache.put(&key, result.clone());
                Ok(result)
            }
        },
        CachePolicy::NetworkElseCache => match dispatcher.execute_blocking(request) {
            Ok(result) => {
                cache.put(&key, result.clone());
                Ok(result)
            }
            Err(network_error) => match cache.get(&key) {
                Some(result) => {
                    debug!(?key, "network failed, answering from cache");
                    Ok(result)
                }
                None => Err(network_error),
            },
        },
        CachePolicy::CacheThenNetwork => {
            let result = dispatcher.execute_blocking(request)?;
            cache.put(&key, result.clone());
            Ok(result)
        }
    }
}

/// Queues a read and delivers its result(s) through the completion.
///
/// The whole policy sequence runs as one dispatcher job, so the cached
/// delivery of cache-then-network is always observed strictly before the
/// network delivery, and reads stay single-flight with every other
/// operation. The cache write on network success is the last effect of the
/// sequence. Cancellation suppresses deliveries that have not yet fired.
pub(crate) fn fetch_in_background(
    dispatcher: &Dispatcher,
    cache: Arc<dyn QueryCache>,
    request: WireRequest,
    key: QueryKey,
    policy: CachePolicy,
    mut completion: ReadCompletion,
) -> CoreResult<CancelHandle> {
    let handle = CancelHandle::new();
    let token = handle.clone();

    dispatcher.submit(Box::new(move |transport| {
        let mut deliver = |outcome: CoreResult<Delivery<WireResponse>>| {
            if !token.is_cancelled() {
                completion(outcome);
            }
        };

        match policy {
            CachePolicy::IgnoreCache | CachePolicy::NetworkOnly => {
                if token.is_cancelled() {
                    return;
                }
                let outcome = transport.execute(&request).map_err(Error::from);
                deliver(outcome.map(final_network));
            }
            CachePolicy::CacheOnly => {
                let outcome = cache.get(&key).ok_or(Error::NoCachedResult);
                deliver(outcome.map(final_cached));
            }
            CachePolicy::CacheElseNetwork => match cache.get(&key) {
                Some(result) => deliver(Ok(final_cached(result))),
                None => {
                    if token.is_cancelled() {
                        return;
                    }
                    match transport.execute(&request) {
                        Ok(result) => {
                            cache.put(&key, result.clone());
                            deliver(Ok(final_network(result)));
                        }
                        Err(err) => deliver(Err(err.into())),
                    }
                }
            },
            CachePolicy::NetworkElseCache => {
                if token.is_cancelled() {
                    return;
                }
                match transport.execute(&request) {
                    Ok(result) => {
                        cache.put(&key, result.clone());
                        deliver(Ok(final_network(result)));
                    }
                    Err(network_error) => match cache.get(&key) {
                        Some(result) => deliver(Ok(final_cached(result))),
                        None => deliver(Err(network_error.into())),
                    },
                }
            }
            CachePolicy::CacheThenNetwork => {
                if let Some(cached) = cache.get(&key) {
                    debug!(?key, "delivering cached result ahead of network");
                    deliver(Ok(Delivery {
                        value: cached,
                        source: ResultSource::Cache,
                        is_final: false,
                    }));
                }
                if token.is_cancelled() {
                    return;
                }
                match transport.execute(&request) {
                    Ok(result) => {
                        deliver(Ok(final_network(result.clone())));
                        cache.put(&key, result);
                    }
                    Err(err) => deliver(Err(err.into())),
                }
            }
        }
    }))?;

    Ok(handle)
}

fn final_network(value: WireResponse) -> Delivery<WireResponse> {
    Delivery {
        value,
        source: ResultSource::Network,
        is_final: true,
    }
}

fn final_cached(value: WireResponse) -> Delivery<WireResponse> {
    Delivery {
        value,
        source: ResultSource::Cache,
        is_final: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::query::condition::ConditionSet;
    use crate::transport::{MockTransport, TransportError};
    use crate::value::Value;
    use parking_lot::Mutex;

    struct Rig {
        mock: Arc<MockTransport>,
        dispatcher: Dispatcher,
        cache: Arc<dyn QueryCache>,
        request: WireRequest,
        key: QueryKey,
    }

    fn rig() -> Rig {
        let mock = Arc::new(MockTransport::new());
        let dispatcher = Dispatcher::new(mock.clone());
        let cache: Arc<dyn QueryCache> = Arc::new(MemoryCache::new());
        let read = ConditionSet::new("users").compile_read();
        let key = QueryKey::for_read(&read);
        let request = WireRequest::Find { read, one: false };
        Rig {
            mock,
            dispatcher,
            cache,
            request,
            key,
        }
    }

    fn raw(n: i64) -> WireResponse {
        WireResponse::Raw(Value::from(n))
    }

    fn collect_deliveries(
        rig: &Rig,
        policy: CachePolicy,
    ) -> Arc<Mutex<Vec<CoreResult<Delivery<WireResponse>>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fetch_in_background(
            &rig.dispatcher,
            Arc::clone(&rig.cache),
            rig.request.clone(),
            rig.key,
            policy,
            Box::new(move |outcome| sink.lock().push(outcome)),
        )
        .unwrap();
        seen
    }

    #[test]
    fn ignore_cache_never_touches_the_cache() {
        let rig = rig();
        rig.cache.put(&rig.key, raw(1));
        rig.mock.push_response(raw(2));

        let result = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::IgnoreCache,
        )
        .unwrap();
        assert_eq!(result, raw(2));
        // The stale entry was neither consulted nor replaced.
        assert_eq!(rig.cache.get(&rig.key), Some(raw(1)));
    }

    #[test]
    fn cache_only_miss_fails_without_network() {
        let rig = rig();
        let err = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::CacheOnly,
        )
        .unwrap_err();
        assert_eq!(err, Error::NoCachedResult);
        assert_eq!(rig.mock.request_count(), 0);
    }

    #[test]
    fn cache_only_hit_answers_without_network() {
        let rig = rig();
        rig.cache.put(&rig.key, raw(5));
        let result = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::CacheOnly,
        )
        .unwrap();
        assert_eq!(result, raw(5));
        assert_eq!(rig.mock.request_count(), 0);
    }

    #[test]
    fn cache_else_network_hit_short_circuits() {
        let rig = rig();
        rig.cache.put(&rig.key, raw(5));
        let result = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::CacheElseNetwork,
        )
        .unwrap();
        assert_eq!(result, raw(5));
        assert_eq!(rig.mock.request_count(), 0);
    }

    #[test]
    fn cache_else_network_miss_stores_the_result() {
        let rig = rig();
        rig.mock.push_response(raw(9));
        let result = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::CacheElseNetwork,
        )
        .unwrap();
        assert_eq!(result, raw(9));
        assert_eq!(rig.cache.get(&rig.key), Some(raw(9)));
    }

    #[test]
    fn network_else_cache_falls_back_on_failure() {
        let rig = rig();
        rig.cache.put(&rig.key, raw(4));
        rig.mock
            .push_error(TransportError::Connection("offline".into()));

        let result = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::NetworkElseCache,
        )
        .unwrap();
        assert_eq!(result, raw(4));
    }

    #[test]
    fn network_else_cache_surfaces_network_error_on_double_miss() {
        let rig = rig();
        rig.mock
            .push_error(TransportError::Connection("offline".into()));

        let err = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::NetworkElseCache,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn network_else_cache_success_updates_cache() {
        let rig = rig();
        rig.mock.push_response(raw(6));
        let result = fetch_blocking(
            &rig.dispatcher,
            &rig.cache,
            rig.request.clone(),
            rig.key,
            CachePolicy::NetworkElseCache,
        )
        .unwrap();
        assert_eq!(result, raw(6));
        assert_eq!(rig.cache.get(&rig.key), Some(raw(6)));
    }

    #[test]
    fn cache_then_network_delivers_twice_in_order() {
        let rig = rig();
        rig.cache.put(&rig.key, raw(1));
        rig.mock.push_response(raw(2));

        let seen = collect_deliveries(&rig, CachePolicy::CacheThenNetwork);
        rig.dispatcher.shutdown();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);

        let first = seen[0].as_ref().unwrap();
        assert_eq!(first.value, raw(1));
        assert_eq!(first.source, ResultSource::Cache);
        assert!(!first.is_final);

        let second = seen[1].as_ref().unwrap();
        assert_eq!(second.value, raw(2));
        assert_eq!(second.source, ResultSource::Network);
        assert!(second.is_final);

        // The network result is the new cached value.
        assert_eq!(rig.cache.get(&rig.key), Some(raw(2)));
    }

    #[test]
    fn cache_then_network_on_empty_cache_delivers_once() {
        let rig = rig();
        rig.mock.push_response(raw(2));

        let seen = collect_deliveries(&rig, CachePolicy::CacheThenNetwork);
        rig.dispatcher.shutdown();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let only = seen[0].as_ref().unwrap();
        assert_eq!(only.source, ResultSource::Network);
        assert!(only.is_final);
    }

    #[test]
    fn cache_then_network_network_failure_is_terminal() {
        let rig = rig();
        rig.cache.put(&rig.key, raw(1));
        rig.mock
            .push_error(TransportError::Connection("offline".into()));

        let seen = collect_deliveries(&rig, CachePolicy::CacheThenNetwork);
        rig.dispatcher.shutdown();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_ok());
        assert!(seen[1].is_err());
        // The failed refresh does not clobber the cached value.
        assert_eq!(rig.cache.get(&rig.key), Some(raw(1)));
    }

    #[test]
    fn cancellation_suppresses_delivery() {
        let rig = rig();
        rig.mock.push_response(raw(2));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        // Cancel before the dispatch thread picks the job up: queue a
        // blocker first so the job cannot start until we cancelled.
        let (block_tx, block_rx) = std::sync::mpsc::channel::<()>();
        rig.dispatcher
            .submit(Box::new(move |_| {
                let _ = block_rx.recv();
            }))
            .unwrap();

        let handle = fetch_in_background(
            &rig.dispatcher,
            Arc::clone(&rig.cache),
            rig.request.clone(),
            rig.key,
            CachePolicy::IgnoreCache,
            Box::new(move |outcome| sink.lock().push(outcome)),
        )
        .unwrap();

        handle.cancel();
        block_tx.send(()).unwrap();
        rig.dispatcher.shutdown();

        assert!(seen.lock().is_empty());
        // The job was skipped before it reached the transport.
        assert_eq!(rig.mock.request_count(), 0);
    }

    #[test]
    fn delivery_map_keeps_metadata() {
        let delivery = final_cached(raw(3)).map(|_| 42u64);
        assert_eq!(delivery.value, 42);
        assert_eq!(delivery.source, ResultSource::Cache);
        assert!(delivery.is_final);
    }
}
