/// A macro to simplify read-through caching with the tiered cache.
///
/// Checks the cache for a fresh entry. If found, it evaluates to `Ok(entry)`.
/// Otherwise it awaits the provided block, writes a successful result back to
/// the cache (the cache itself skips empty or non-2xx entries) and evaluates
/// to the block's result. Errors from the block are never cached.
///
/// # Arguments
/// * `$cache`: A `TieredCache` (or anything with matching `read`/`write` methods).
/// * `$collection`: The `Collection` namespace for the key.
/// * `$parts`: The key parts, anything that derefs to `&[KeyPart]`.
/// * `$ttl`: Freshness window for reads, in seconds.
/// * `$block`: A future producing `AppResult<CacheEntry>` on a miss.
///
/// # Example
/// ```rust,ignore
/// let entry = cached!(self.cache, Collection::Upstream, parts, TTL, async {
///     self.fetch_entry("/discover/movie", &params).await
/// })?;
/// ```
#[macro_export]
macro_rules! cached {
    ($cache:expr, $collection:expr, $parts:expr, $ttl:expr, $block:expr) => {{
        let parts = &$parts;
        if let Some(entry) = $cache.read($collection, parts, $ttl).await {
            Ok(entry)
        } else {
            match $block.await {
                Ok(entry) => {
                    $cache.write($collection, parts, ::std::clone::Clone::clone(&entry)).await;
                    Ok(entry)
                }
                Err(e) => Err(e),
            }
        }
    }};
}
