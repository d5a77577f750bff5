use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus counters for the admission path and the background workers.
pub struct Metrics {
    pub registry: Registry,
    pub holds_acquired: IntCounter,
    pub hold_rejections: IntCounterVec,
    pub rate_limit_hits: IntCounterVec,
    pub holds_swept: IntCounter,
    pub queue_joins: IntCounter,
    pub capacity_syncs: IntCounter,
    pub holds_finalized: IntCounter,
    pub orders_expired: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let holds_acquired = IntCounter::new("turnstile_holds_acquired_total", "Holds granted")?;
        let hold_rejections = IntCounterVec::new(
            Opts::new("turnstile_hold_rejections_total", "Hold requests turned away"),
            &["reason"],
        )?;
        let rate_limit_hits = IntCounterVec::new(
            Opts::new("turnstile_rate_limit_hits_total", "Requests denied by the rate limiter"),
            &["action"],
        )?;
        let holds_swept = IntCounter::new("turnstile_holds_swept_total", "Expired holds reclaimed by the sweeper")?;
        let queue_joins = IntCounter::new("turnstile_queue_joins_total", "Admission queue entries created")?;
        let capacity_syncs = IntCounter::new("turnstile_capacity_syncs_total", "Capacity sync messages applied")?;
        let holds_finalized = IntCounter::new("turnstile_holds_finalized_total", "Holds converted into sold inventory")?;
        let orders_expired = IntCounter::new("turnstile_orders_expired_total", "Unpaid orders expired by the reaper")?;

        registry.register(Box::new(holds_acquired.clone()))?;
        registry.register(Box::new(hold_rejections.clone()))?;
        registry.register(Box::new(rate_limit_hits.clone()))?;
        registry.register(Box::new(holds_swept.clone()))?;
        registry.register(Box::new(queue_joins.clone()))?;
        registry.register(Box::new(capacity_syncs.clone()))?;
        registry.register(Box::new(holds_finalized.clone()))?;
        registry.register(Box::new(orders_expired.clone()))?;

        Ok(Self {
            registry,
            holds_acquired,
            hold_rejections,
            rate_limit_hits,
            holds_swept,
            queue_joins,
            capacity_syncs,
            holds_finalized,
            orders_expired,
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_labelled_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.holds_acquired.inc();
        metrics.hold_rejections.with_label_values(&["INSUFFICIENT_STOCK"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("turnstile_holds_acquired_total 1"));
        assert!(text.contains(r#"turnstile_hold_rejections_total{reason="INSUFFICIENT_STOCK"} 1"#));
    }
}
