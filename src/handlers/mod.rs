//! HTTP request/response types and handlers, one module per surface area.

pub mod agents;
pub mod auth;
pub mod chat;
pub mod init;
pub mod mail;
pub mod reservations;
