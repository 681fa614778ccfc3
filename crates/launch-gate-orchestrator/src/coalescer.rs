use std::time::Duration;

use launch_gate_core::{merge_records, AttributionRecord, MergedRecord, RoutingRecord};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalescerEmission {
    /// Routing delivered for the first time; consumers persist it right away.
    Routing(RoutingRecord),
    Merged(MergedRecord),
}

/// Merges attribution and routing deliveries that arrive in any order.
///
/// The coalescer owns no timer of its own: it exposes the instant at which
/// the pending window closes and the owner calls [`Self::on_timer`] then.
/// That keeps every transition on the owner's single execution context.
#[derive(Debug)]
pub struct AttributionCoalescer {
    window: Duration,
    routing_finalized: bool,
    attribution: Option<AttributionRecord>,
    routing: Option<RoutingRecord>,
    deadline: Option<Instant>,
}

impl AttributionCoalescer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            routing_finalized: false,
            attribution: None,
            routing: None,
            deadline: None,
        }
    }

    /// Coalescer for a warm start: routing was already consumed in an
    /// earlier session, so later routing callbacks are ignored and the
    /// restored record (if any) merges with the next attribution at once.
    #[must_use]
    pub fn restored(window: Duration, routing: Option<RoutingRecord>) -> Self {
        Self {
            routing_finalized: true,
            routing,
            ..Self::new(window)
        }
    }

    pub fn on_attribution(&mut self, record: AttributionRecord, now: Instant) -> Vec<CoalescerEmission> {
        self.attribution = Some(record);
        if self.routing.is_some() {
            self.deadline = None;
            return self.merge_now().into_iter().collect();
        }
        self.deadline = Some(now + self.window);
        Vec::new()
    }

    pub fn on_routing(&mut self, record: RoutingRecord) -> Vec<CoalescerEmission> {
        if self.routing_finalized {
            tracing::debug!(keys = record.len(), "routing already finalized; ignoring duplicate");
            return Vec::new();
        }
        self.routing_finalized = true;
        self.routing = Some(record.clone());
        self.deadline = None;

        let mut emissions = vec![CoalescerEmission::Routing(record)];
        emissions.extend(self.merge_now());
        emissions
    }

    /// Closes the window: emits attribution alone.
    pub fn on_timer(&mut self) -> Vec<CoalescerEmission> {
        self.deadline = None;
        self.attribution
            .as_ref()
            .map(|attribution| CoalescerEmission::Merged(merge_records(attribution, None)))
            .into_iter()
            .collect()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn routing(&self) -> Option<&RoutingRecord> {
        self.routing.as_ref()
    }

    #[cfg(test)]
    fn is_routing_finalized(&self) -> bool {
        self.routing_finalized
    }

    fn merge_now(&self) -> Option<CoalescerEmission> {
        let attribution = self.attribution.as_ref()?;
        Some(CoalescerEmission::Merged(merge_records(
            attribution,
            self.routing.as_ref(),
        )))
    }
}
