// Application state for HTTP handlers
use crate::application::formula_service::FormulaService;
use crate::application::series_service::SeriesService;

#[derive(Clone)]
pub struct AppState {
    pub series_service: SeriesService,
    pub formula_service: FormulaService,
}
