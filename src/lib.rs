pub mod commands {
    pub mod analyze;
    pub mod export_features;
}
pub mod config;
pub mod correlation;
pub mod error;
pub mod evaluation;
pub mod explainer;
pub mod features;
pub mod indicators;
pub mod market_data;
pub mod model;
pub mod models;
pub mod pipeline;
pub mod selection;
pub mod split;
