//! HTTP surface over transfer admission, record queries, structure inspection and
//! the live event stream.

mod app;

pub use app::{build_router, AppState};
