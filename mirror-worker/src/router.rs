use mirror_common::bloom::BloomFilter;
use mirror_common::event::AccountChangeEvent;
use mirror_common::metrics_consts::{EVENTS_IRRELEVANT, EVENTS_RECEIVED};
use mirror_common::pipeline::{AccountProcessor, PipelineError, ProcessOutcome};

/// Routes a source's events by owning program and applies the relevant ones
/// in a single transaction.
pub struct EventRouter {
    processor: AccountProcessor,
    irrelevant: BloomFilter,
    service: &'static str,
}

impl EventRouter {
    pub fn new(processor: AccountProcessor, irrelevant: BloomFilter, service: &'static str) -> Self {
        Self {
            processor,
            irrelevant,
            service,
        }
    }

    pub fn processor(&self) -> &AccountProcessor {
        &self.processor
    }

    /// Drops events for untracked programs, remembering their addresses so
    /// repeats skip the registry, and commits the rest together.
    pub async fn apply(
        &mut self,
        events: Vec<AccountChangeEvent>,
    ) -> Result<Vec<ProcessOutcome>, PipelineError> {
        metrics::counter!(EVENTS_RECEIVED, "source" => self.service).increment(events.len() as u64);

        let registry = self.processor.registry().current();
        let mut relevant = Vec::with_capacity(events.len());
        for event in events {
            if event.is_delete {
                relevant.push(event);
                continue;
            }
            if self.irrelevant.contains(&event.address) {
                metrics::counter!(EVENTS_IRRELEVANT, "source" => self.service).increment(1);
                continue;
            }
            if !registry.is_tracked(&event.program_id) {
                metrics::counter!(EVENTS_IRRELEVANT, "source" => self.service).increment(1);
                self.irrelevant.insert(&event.address);
                continue;
            }
            relevant.push(event);
        }

        if relevant.is_empty() {
            return Ok(Vec::new());
        }
        self.processor.process_batch(&relevant).await
    }
}
