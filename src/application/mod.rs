//! Application layer: gateway contract, queries, mutations and the engine.

pub mod auth;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod mutations;
pub mod queries;
pub mod selection;
