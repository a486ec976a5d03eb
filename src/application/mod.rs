// Application layer - Use cases and collaborator seams
pub mod deadline;
pub mod evaluator;
pub mod formula_repository;
pub mod formula_service;
pub mod meter_repository;
pub mod series_service;
