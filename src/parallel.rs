//! Bulk property resolution.
//!
//! [`resolve_properties`] decodes the properties of many items at once.
//! With the `parallel` feature the work is spread over Rayon's global
//! pool; without it the items are resolved in order on the calling thread.
//! Either way each item caches its own result, so later calls to
//! [`Item::properties`] are free.
//!
//! Items only share the container's block cache and page memo, both of
//! which are behind mutexes, so the output is the same in both builds.

use crate::error::Result;
use crate::item::Item;
use crate::record::Properties;

/// Resolve `items`' properties; one result per item, in input order.
pub fn resolve_properties<'a>(items: &'a [Item<'_>]) -> Vec<Result<&'a Properties>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        items.par_iter().map(Item::properties).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        items.iter().map(Item::properties).collect()
    }
}

/// Resolve every item and count the failures.
pub fn warm(items: &[Item<'_>]) -> usize {
    resolve_properties(items).iter().filter(|r| r.is_err()).count()
}
