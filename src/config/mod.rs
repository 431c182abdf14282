//! Configuration: schema, loading, and route-table shape checking.
//!
//! Everything here is fatal at startup on failure; there is no partial or
//! degraded configuration state.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::RouteSpec;
pub use schema::{
    Config, ConfigAuth, ConfigGzip, ConfigHttp, ConfigPassThroughAuth, ConfigTarget,
    PassThroughKind,
};
