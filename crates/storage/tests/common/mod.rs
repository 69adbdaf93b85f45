pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{chunked_body, collect_body, seeded_bytes};
