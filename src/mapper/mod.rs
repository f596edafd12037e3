//! Mapper - receives features and groups that leave the estimator.
//!
//! Hand-offs travel over a bounded channel to a worker thread, which files
//! them into a `MapStore` shared behind `parking_lot` locks. The estimator
//! never blocks on the mapper: a full queue drops the hand-off.

pub mod messages;
pub mod store;
pub mod worker;

pub use messages::MapperMsg;
pub use store::{MapStore, MappedFeature, MappedGroup};
pub use worker::{spawn_mapper, MapperHandle, MapperWorker};
