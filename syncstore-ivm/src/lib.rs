//! Incrementally maintained queries.
//!
//! A query is a pipeline of operators over a [`source`]. The pipeline is
//! hydrated once with a fetch; from then on changes to the source are pushed
//! through it, and every operator turns the changes it receives into the
//! changes to its own output, without recomputing it.
//!
//! ```
//! use serde_json::json;
//! use syncstore_ivm::{
//!     catch::Catch,
//!     change::{Change, SourceChange},
//!     data::Row,
//!     operator::FetchRequest,
//!     source::MemorySource,
//!     storage::MemoryStorage,
//!     take::Take,
//! };
//!
//! let row = |id: i64| Row::from([("id".to_string(), json!(id))]);
//! let source = MemorySource::new("issue", ["id"]).with_rows([row(2), row(3)])?;
//! let mut query = Catch::new(Take::new(source, MemoryStorage::new(), 2, None)?);
//! assert_eq!(query.fetch(FetchRequest::default())?.len(), 2);
//!
//! query.push(SourceChange::Add { row: row(1) })?;
//! assert_eq!(
//!     query.take_pushes(),
//!     vec![Change::remove(row(3)), Change::add(row(1))]
//! );
//! # Ok::<(), syncstore_ivm::operator::OperatorError>(())
//! ```
#![deny(missing_docs)]
#![cfg_attr(syncstore_docsrs, feature(doc_auto_cfg))]

pub mod catch;
pub mod change;
pub mod data;
pub mod filter;
pub mod operator;
pub mod schema;
pub mod source;
pub mod storage;
pub mod stream;
pub mod take;

pub use self::operator::{Operator, OperatorError};
