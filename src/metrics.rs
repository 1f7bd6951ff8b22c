use metrics::counter;
use tracing::trace;

pub fn inc_requests(route: &'static str) {
    counter!("mautic_sync_requests_total", "route" => route).increment(1);
    trace!(target = "mautic_sync.metrics", route = route, "requests_total_inc");
}

pub fn lead_result(source: &'static str, result: &'static str) {
    counter!("mautic_sync_leads_total", "source" => source, "result" => result).increment(1);
}

pub fn order_outcome(outcome: &'static str) {
    counter!("mautic_sync_order_tagging_total", "outcome" => outcome).increment(1);
}

pub fn backfill_batch(orders: usize) {
    counter!("mautic_sync_backfill_batches_total").increment(1);
    counter!("mautic_sync_backfill_orders_total").increment(orders as u64);
    trace!(target = "mautic_sync.metrics", orders = orders as u64, "backfill_batch");
}
