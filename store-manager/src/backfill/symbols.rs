//! Symbol selection against the data source's ticker list

use std::collections::HashSet;

use tracing::info;

use super::{BackfillError, BackfillResult};
use crate::glob::GlobPattern;
use crate::provider::DataSource;

/// Compile the `--symbols` flag
pub fn compile_pattern(pattern: &str) -> BackfillResult<GlobPattern> {
    GlobPattern::compile(pattern).map_err(|e| BackfillError::InvalidPattern {
        pattern: e.pattern,
        reason: e.reason.to_string(),
    })
}

/// Keep tickers matching `pattern`, first occurrence wins, empties dropped
pub fn resolve_symbols<I, S>(pattern: &GlobPattern, tickers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    tickers
        .into_iter()
        .filter_map(|ticker| {
            let ticker = ticker.as_ref().trim();
            (!ticker.is_empty() && pattern.matches(ticker) && seen.insert(ticker.to_string()))
                .then(|| ticker.to_string())
        })
        .collect()
}

/// List tickers from the source and select those matching `pattern`
pub async fn select_symbols(
    source: &dyn DataSource,
    pattern: &GlobPattern,
) -> BackfillResult<Vec<String>> {
    info!(pattern = %pattern, "Listing symbols");
    let tickers = source
        .list_tickers()
        .await
        .map_err(BackfillError::TickerListing)?;
    info!(available = tickers.len(), "Symbols available");

    let selected = resolve_symbols(pattern, &tickers);
    info!(selected = selected.len(), "Symbols selected");
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_star_selects_all_distinct() {
        let pattern = compile_pattern("*").unwrap();
        let got = resolve_symbols(&pattern, ["AAPL", "MSFT", "AAPL", "", "SPY"]);
        assert_eq!(got, vec!["AAPL", "MSFT", "SPY"]);
    }

    #[test]
    fn test_prefix_pattern() {
        let pattern = compile_pattern("AA*").unwrap();
        let got = resolve_symbols(&pattern, ["AAPL", "AAL", "MSFT"]);
        assert_eq!(got, vec!["AAPL", "AAL"]);
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        assert!(matches!(
            compile_pattern("[A-"),
            Err(BackfillError::InvalidPattern { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_resolution_is_duplicate_free(tickers in proptest::collection::vec("[A-D]{0,3}", 0..40)) {
            let pattern = compile_pattern("[AB]*").unwrap();
            let got = resolve_symbols(&pattern, &tickers);
            let unique: HashSet<_> = got.iter().collect();
            prop_assert_eq!(unique.len(), got.len());
            for symbol in &got {
                prop_assert!(!symbol.is_empty());
                prop_assert!(pattern.matches(symbol));
            }
            for ticker in &tickers {
                if !ticker.is_empty() && pattern.matches(ticker) {
                    prop_assert!(got.contains(ticker));
                }
            }
        }
    }
}
