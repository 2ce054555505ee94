// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Each stage's only coupling to durable storage.

mod dedup_store;
mod enrichment_repository;
mod filter_repository;

pub use dedup_store::{DedupConfigProvider, InMemoryDedupConfigStore};
pub use enrichment_repository::{EnrichmentRuleRepository, MongoEnrichmentRuleRepository};
pub use filter_repository::{FilterRuleRepository, PostgresFilterRuleRepository};
