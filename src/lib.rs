#![allow(non_snake_case)]

pub mod cli;
pub mod clients;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod logging;
pub mod models;
pub mod runtime;
pub mod service;
pub mod store;
pub mod tasks;
