//! Standalone player around the widget engine: a library directory on disk, the local
//! audio backend and an HTTP control surface.

pub mod cli;
pub mod config;
pub mod http_api;
pub mod library;
pub mod player;
pub mod runtime;
pub mod state;
pub mod traversal;
