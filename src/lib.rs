pub mod aggregate;
pub mod cache;
pub mod classify;
pub mod config;
pub mod cost;
pub mod derive;
pub mod documents;
pub mod domain;
pub mod error;
pub mod geo;
pub mod http;
pub mod llm;
pub mod output;
pub mod pipeline;
pub mod problems;
pub mod pubmed;
pub mod record;
pub mod snippets;
pub mod sra;
pub mod text;
