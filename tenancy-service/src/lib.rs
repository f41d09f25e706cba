//! Tenancy Service - tenant admission and per-checkout session binding for
//! multi-tenant Postgres services.

pub mod config;
pub mod db;
pub mod middleware;
pub mod services;
pub mod startup;
pub mod tenant;
