//! Pagination utilities

/// Default page size for task and result listings
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Pagination metadata calculated from total results
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// Current page number (1-indexed)
    pub page: i64,
    /// Page size used for the calculation
    pub page_size: i64,
    /// Total number of pages (at least 1)
    pub total_pages: i64,
    /// Offset for SQL LIMIT/OFFSET query
    pub offset: i64,
}

/// Calculate pagination metadata from total results and requested page
///
/// Ensures page is within valid bounds [1, total_pages]. A non-positive
/// page size falls back to [`DEFAULT_PAGE_SIZE`].
pub fn calculate_pagination(total_results: i64, requested_page: i64, page_size: i64) -> Pagination {
    let page_size = if page_size > 0 { page_size } else { DEFAULT_PAGE_SIZE };
    let total_pages = ((total_results + page_size - 1) / page_size).max(1);
    let page = requested_page.max(1).min(total_pages);
    let offset = (page - 1) * page_size;

    Pagination {
        page,
        page_size,
        total_pages,
        offset,
    }
}
