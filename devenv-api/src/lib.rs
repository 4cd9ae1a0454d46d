pub mod background;
pub mod error;
pub mod routes;
pub mod state;

pub use background::{start_health_task, start_reaper_task};
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
