//! Market data sources
//!
//! A [`DataSource`] fetches one window of one kind of data for one symbol and
//! writes it into the store, returning the number of rows ingested.

#[cfg(any(test, feature = "testing"))]
pub mod mock;
mod polygon;
mod traits;

pub use polygon::{build_minute_bars, PolygonClient, PolygonConfig};
pub use traits::{DataSource, ProviderError, ProviderResult};
