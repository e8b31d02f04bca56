pub mod attachments;
pub mod audit;
pub mod config;
pub mod export;
pub mod http;
pub mod ledger;
pub mod links;
pub mod mapping;
pub mod migrate;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod publish;
pub mod rewrite;
pub mod runtime;
pub mod source;
pub mod target;
pub mod tickets;
pub mod tree;
