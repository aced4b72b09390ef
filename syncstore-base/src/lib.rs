//! Base types and utilities for syncstore
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(syncstore_docsrs, feature(doc_auto_cfg))]

pub mod hash;

pub use self::hash::{Hash, HashParseError, InvalidHashError, assert_not_temp_hash};
