// Domain layer - Core models
pub mod formula;
pub mod series;
