//! Pipelined application of mutations to one page
//!
//! A page is split into chunks; each chunk is one round trip. Per-key
//! failures are recorded and never stop the page. A failing round trip is
//! retried once for the chunks that have not yet gone through.

mod pipeline;

pub use pipeline::{ActionExecutor, PageResult};
