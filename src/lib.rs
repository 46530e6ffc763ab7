#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::cmp_null,
    clippy::op_ref
)]

//! Reconciles a periodically refreshed external road dataset (DLM) with a
//! persistent, topologically connected road network whose edges carry
//! linearly referenced attributes.

pub mod attributes;
pub mod config;
pub mod edge_creator;
pub mod error;
pub mod feature_source;
pub mod geometry_utils;
pub mod graph_types;
pub mod linear_projection;
pub mod network;
pub mod reimport;
pub mod sink;
pub mod spatial_index;
pub mod split;
pub mod statistics;
pub mod topology_correction;
pub mod update_classifier;

#[cfg(test)]
mod test_reimport_scenarios;

pub use config::ReimportConfig;
pub use error::ReimportError;
pub use feature_source::{DlmFeature, FeatureSource, GeoJsonFeatureSource, InMemoryFeatureSource};
pub use network::{Mutation, RoadNetwork};
pub use reimport::Reimporter;
pub use sink::{PartitionSink, RecordingSink};
pub use statistics::{ReimportStatistics, TopologyCorrectionStatistics};
pub use topology_correction::TopologyCorrectionPass;
