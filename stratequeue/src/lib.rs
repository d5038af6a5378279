#![allow(ambiguous_glob_reexports)]

//! StrateQueue aggregate crate that re-exports the main components for
//! downstream users.

pub use stratequeue_broker as broker;
pub use stratequeue_config as config;
pub use stratequeue_core as core;
pub use stratequeue_data as data;
pub use stratequeue_demo as demo;
pub use stratequeue_engine as engine;
pub use stratequeue_gateway as gateway;
pub use stratequeue_paper as paper;
pub use stratequeue_portfolio as portfolio;
pub use stratequeue_rpc as rpc;
pub use stratequeue_runtime as runtime;
pub use stratequeue_stats as stats;

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use stratequeue_broker::*;
    pub use stratequeue_config::*;
    pub use stratequeue_core::*;
    pub use stratequeue_data::*;
    pub use stratequeue_engine::*;
    pub use stratequeue_gateway::*;
    pub use stratequeue_paper::*;
    pub use stratequeue_portfolio::*;
    pub use stratequeue_runtime::*;
    pub use stratequeue_stats::*;
}
