use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics shared between the front door and the drain loop.
#[derive(Clone, Default)]
pub(super) struct Metrics {
    pub inserted: Counter,
    pub wakes: Counter,
    pub drained: Counter,
    pub flushes: Counter,
    pub syncs: Counter,
    pub pending: Gauge,
}

impl Metrics {
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("index");
        registry.register(
            "inserted",
            "Number of locators accepted by insert",
            self.inserted.clone(),
        );
        registry.register(
            "wakes",
            "Number of wake tokens delivered to the drain loop",
            self.wakes.clone(),
        );
        registry.register(
            "drained",
            "Number of locators written by the drain loop",
            self.drained.clone(),
        );
        registry.register("flushes", "Number of write buffer flushes", self.flushes.clone());
        registry.register("syncs", "Number of durability barriers", self.syncs.clone());
        registry.register(
            "pending",
            "Number of locators waiting in the handoff buffer",
            self.pending.clone(),
        );
    }
}
