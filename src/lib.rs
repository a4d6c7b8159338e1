pub mod chart;
pub mod commands;
pub mod db;
pub mod error;
pub mod state;

pub use chart::ChartEvent;
pub use error::AppError;
pub use state::AppState;
