// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod expression;
pub mod postgres_repository;
