pub mod router;

pub use router::{pattern_matches, Route, Router};
