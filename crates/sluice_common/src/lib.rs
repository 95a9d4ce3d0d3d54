//! Shared types for the sluice router: values and rows, bind variables,
//! shard targets, the error taxonomy, configuration and cancellation.

pub mod cancel;
pub mod config;
pub mod datum;
pub mod error;
pub mod request_context;
pub mod types;

pub use cancel::CancelToken;
pub use config::RouterConfig;
pub use datum::{Datum, DataType, Field, OwnedRow, QueryResult};
pub use error::{ErrorContext, ErrorKind, SluiceError, SluiceResult};
pub use types::{BindValue, BindVars, ShardTarget, StatementKind, TabletType, TransactionId};
