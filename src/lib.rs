pub mod cache;
pub mod calibration;
pub mod calibration_rows;
pub mod config;
pub mod diagnostics;
pub mod elastic_net;
pub mod error;
pub mod feature_set;
pub mod features;
pub mod gates;
pub mod hygiene;
pub mod model_select;
pub mod opponent_adjust;
pub mod persist;
pub mod predictor;
pub mod recency;
pub mod records;
pub mod stats_loader;
pub mod stats_store;
pub mod synthetic;
