use tracing::trace;

// Trace-based counters; a recorder can be attached through the subscriber.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "altered.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn transfer_outcome(success: bool, elapsed_ms: u128) {
    trace!(
        target = "altered.metrics",
        success = success,
        elapsed_ms = elapsed_ms as u64,
        "transfer_operation"
    );
}

pub fn crawl_page(card_set: &str, page: u32, matched: usize) {
    trace!(
        target = "altered.metrics",
        card_set = card_set,
        page = page,
        matched = matched as u64,
        "crawl_page"
    );
}
