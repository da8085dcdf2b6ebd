//! Filter rewriting for user exceptions
//!
//! `restrict_filter` narrows a filter to one more site, `negate_filter` flips
//! its polarity, and `materialize` combines both to turn an exception record
//! into the engine-shaped filters that express it.

use crate::filter::{CosmeticFilter, Filter, NetworkFilter, NetworkOption};
use crate::types::{normalize_hostname, Category, ExceptionRecord};

/// Scope `filter` to `domain` in addition to any scope it already has.
///
/// Hide/unhide markers, the `@@` exception marker and every other network
/// option are preserved. An existing scope is extended, never replaced, and a
/// domain already present is not added twice.
pub fn restrict_filter(filter: &Filter, domain: &str) -> Filter {
    let domain = normalize_hostname(domain);
    match filter {
        Filter::Network(network) => Filter::Network(restrict_network(network, domain)),
        Filter::Cosmetic(cosmetic) => Filter::Cosmetic(restrict_cosmetic(cosmetic, domain)),
    }
}

/// Fold [`restrict_filter`] over several domains.
pub fn restrict_to_domains<I, S>(filter: &Filter, domains: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    domains
        .into_iter()
        .fold(filter.clone(), |acc, domain| restrict_filter(&acc, domain.as_ref()))
}

fn restrict_network(filter: &NetworkFilter, domain: String) -> NetworkFilter {
    let mut filter = filter.clone();

    let existing = filter.options.iter_mut().find_map(|option| match option {
        NetworkOption::Domain(domains) => Some(domains),
        NetworkOption::Flag(_) => None,
    });

    match existing {
        Some(domains) => push_unique(domains, domain),
        None => filter.options.push(NetworkOption::Domain(vec![domain])),
    }

    filter
}

fn restrict_cosmetic(filter: &CosmeticFilter, domain: String) -> CosmeticFilter {
    let mut filter = filter.clone();
    push_unique(&mut filter.hostnames, domain);
    filter
}

fn push_unique(domains: &mut Vec<String>, domain: String) {
    if !domains.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
        domains.push(domain);
    }
}

/// Polarity-inverted filter: toggles `@@` on network filters and swaps
/// `##`/`#@#` on cosmetic filters. Scope and options are untouched.
pub fn negate_filter(filter: &Filter) -> Filter {
    match filter {
        Filter::Network(network) => Filter::Network(NetworkFilter {
            exception: !network.exception,
            ..network.clone()
        }),
        Filter::Cosmetic(cosmetic) => Filter::Cosmetic(CosmeticFilter {
            unhide: !cosmetic.unhide,
            ..cosmetic.clone()
        }),
    }
}

/// Filters expressing `record` for a tracker whose blocking filters are `filters`.
///
/// When the effective default is "blocked" the blocking filters are kept and an
/// inverted copy scoped to the trusted sites is added. When the effective
/// default is "trusted" only copies scoped to the blocked sites are emitted.
pub fn materialize(record: &ExceptionRecord, category: Category, filters: &[Filter]) -> Vec<Filter> {
    let effective_blocked = category.blocked_by_default() ^ record.overwrite_status;
    let mut out = Vec::with_capacity(filters.len() * 2);

    for filter in filters {
        if effective_blocked {
            out.push(filter.clone());
            if !record.trusted_domains.is_empty() {
                out.push(restrict_to_domains(&negate_filter(filter), &record.trusted_domains));
            }
        } else if !record.blocked_domains.is_empty() {
            out.push(restrict_to_domains(filter, &record.blocked_domains));
        }
    }

    out
}
