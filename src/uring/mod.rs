//! Direct binding to the Linux io_uring submission/completion rings.
//!
//! The ring is set up with `io_uring_setup(2)` and driven through three
//! shared memory mappings: the SQ ring (indices and flags), the SQE array
//! (submission records), and the CQ ring (completion records). Submissions
//! are serialized by a single atomic lock held for the duration of one SQE
//! write; completion consumption advances the CQ head with a CAS and is
//! safe from multiple threads.
//!
//! Every submission carries a slab key in `user_data`; the in-flight table
//! resolves it back to the caller's [`Context`](crate::Context) when the
//! completion is observed, with no allocation per completion after steady
//! state.

pub mod types;
pub use types::{Cqe, CqeFlags, EnterFlags, Opcode, SetupFlags, SqFlags, SqeFlags};

mod inflight;

mod ring;
pub use ring::{Completion, Ring, RingConfig};

mod ops;
