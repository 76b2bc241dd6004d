//! Request lifecycle: settings, admission, prepared statements, and the
//! engine that ties statement to response.

mod engine;
mod prepared;
mod request;
pub mod settings;

pub use engine::QueryEngine;
pub use prepared::{Prepared, PreparedCache};
pub use request::{Request, Response, Status};
pub use settings::Settings;
