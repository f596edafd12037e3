pub mod estimator;
pub mod geometry;
pub mod graph;
pub mod mapper;
pub mod sim;
