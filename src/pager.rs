/// Slice one zero-based page out of `items`.
///
/// Pages past the end are empty rather than an error.
pub fn page<T>(items: &[T], page_number: usize, page_size: usize) -> &[T] {
    let start = page_number
        .checked_mul(page_size)
        .map_or(items.len(), |s| s.min(items.len()));
    let end = start.saturating_add(page_size).min(items.len());
    &items[start..end]
}

/// Number of pages needed for `total` items.
pub fn total_pages(total: usize, page_size: usize) -> usize {
    if page_size == 0 {
        0
    } else {
        total.div_ceil(page_size)
    }
}
