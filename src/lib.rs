//! Library crate for ap-tracker-back: room polling, event deduplication and push fan-out.

pub mod config;
pub mod dao;
mod dto;
pub mod error;
pub mod push;
pub mod remote;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
mod test_support;
