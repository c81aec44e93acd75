//! KhanaSathi realtime relay server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod chat;
pub mod complaints;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod orders;
pub mod routes;
pub mod state;
pub mod ws;
