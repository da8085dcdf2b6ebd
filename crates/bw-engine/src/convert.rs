//! Declarative rule conversion service
//!
//! Every conversion request gets its own id and runs through a
//! [`SingleFlight`], so a request that is awaited from several places is
//! converted once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bw_core::{convert_filters, materialize, Category, Conversion, ExceptionRecord, Filter};
use log::debug;

use crate::single_flight::SingleFlight;

pub struct DnrConverter {
    next_request: AtomicU64,
    first_rule_id: u32,
    flight: SingleFlight<u64, Arc<Conversion>>,
}

impl Default for DnrConverter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DnrConverter {
    /// Rules of every conversion are numbered from `first_rule_id`.
    pub fn new(first_rule_id: u32) -> Self {
        Self {
            next_request: AtomicU64::new(0),
            first_rule_id,
            flight: SingleFlight::new(),
        }
    }

    pub async fn convert(&self, lines: Vec<String>) -> Arc<Conversion> {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let first_rule_id = self.first_rule_id;

        self.flight
            .run(request, move || async move {
                let conversion = convert_filters(lines.iter().map(String::as_str), first_rule_id);
                debug!(
                    "Conversion #{}: {} rules, {} errors",
                    request,
                    conversion.rules.len(),
                    conversion.errors.len()
                );
                Arc::new(conversion)
            })
            .await
    }

    /// Declarative rules enforcing `record` for a tracker blocked by `filters`.
    pub async fn convert_exception(
        &self,
        record: &ExceptionRecord,
        category: Category,
        filters: &[Filter],
    ) -> Arc<Conversion> {
        let lines = materialize(record, category, filters)
            .iter()
            .map(ToString::to_string)
            .collect();
        self.convert(lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bw_core::dnr::DnrActionType;
    use bw_core::FilterError;

    #[tokio::test]
    async fn test_convert_reports_errors_next_to_rules() {
        let converter = DnrConverter::new(100);
        let conversion = converter
            .convert(vec![
                "||ads.com^".into(),
                "! comment".into(),
                "example.com##.banner".into(),
                "@@||ads.com/ok^".into(),
            ])
            .await;

        assert_eq!(conversion.rules.len(), 2);
        assert_eq!(conversion.rules[0].id, 100);
        assert_eq!(conversion.rules[1].action.kind, DnrActionType::Allow);
        assert_eq!(conversion.errors.len(), 1);
        assert_eq!(conversion.errors[0].filter, "example.com##.banner");
        assert_eq!(conversion.errors[0].error, FilterError::CosmeticNotConvertible);
    }

    #[tokio::test]
    async fn test_convert_exception_allows_trusted_sites() {
        let converter = DnrConverter::default();
        let record = ExceptionRecord::new("tracker").with_trusted(["a.com"]);
        let filters: Vec<Filter> = vec!["||tracker.com^".parse().unwrap()];

        let conversion = converter
            .convert_exception(&record, Category::Advertising, &filters)
            .await;

        assert!(conversion.errors.is_empty());
        assert_eq!(conversion.rules.len(), 2);
        assert_eq!(conversion.rules[0].action.kind, DnrActionType::Block);
        let allow = &conversion.rules[1];
        assert_eq!(allow.action.kind, DnrActionType::Allow);
        assert_eq!(allow.condition.initiator_domains, Some(vec!["a.com".to_string()]));
    }

    #[tokio::test]
    async fn test_convert_exception_blocks_only_listed_sites_when_trusted() {
        let converter = DnrConverter::default();
        let record = ExceptionRecord::new("cdn").with_blocked(["b.com"]);
        let filters: Vec<Filter> = vec!["||cdn.test^".parse().unwrap()];

        let conversion = converter
            .convert_exception(&record, Category::Cdn, &filters)
            .await;
        assert_eq!(conversion.rules.len(), 1);
        assert_eq!(conversion.rules[0].action.kind, DnrActionType::Block);
        assert_eq!(conversion.rules[0].condition.initiator_domains, Some(vec!["b.com".to_string()]));
    }
}
