//! Progress relay for one run
//!
//! ```text
//!   BulkActionRunner ──publish──▶ ProgressChannel (broadcast)
//!                                   │      │      │
//!                                   ▼      ▼      ▼
//!                           subscription  ...  subscription
//! ```
//!
//! Every subscription starts with a [`ProgressEvent::Snapshot`] of the
//! current state, so late subscribers never replay history. A subscription
//! that falls behind the buffer is resynchronised with a fresh snapshot.

mod channel;

pub use channel::{ProgressChannel, ProgressEvent, ProgressSubscription};
