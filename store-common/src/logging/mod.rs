//! Subscriber setup shared by `store-manager start` and `store-manager backfill`.
//!
//! | variable         | values                          | default  |
//! |------------------|---------------------------------|----------|
//! | `RUST_LOG`       | any `EnvFilter` directive       | unset    |
//! | `LOG_LEVEL`      | filter used without `RUST_LOG`  | `info`   |
//! | `LOG_FORMAT`     | `pretty`, `compact`, `json`     | `pretty` |
//! | `LOG_TIMESTAMPS` | `local`, `utc`, `none`          | `local`  |
//! | `LOG_LOCATION`   | `1` / `true` adds file:line     | off      |

mod config;
mod json_layer;

pub use config::{init_logging, LogConfig, LogFormat, TimestampFormat};
pub use json_layer::LogRecord;
