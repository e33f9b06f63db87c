//! NAR (deterministic filesystem archive) handling.
//!
//! The dispatch core never materialises archives: output NARs stream from
//! the wire straight into the destination store, and [`NarExtractor`]
//! shadows that stream to pull out per-member metadata. The parser is
//! push-based so a single reader can feed both consumers and knows exactly
//! where the archive ends inside a longer protocol stream.

pub mod extract;
pub mod member;
pub mod writer;

pub use extract::{NarExtractor, NarFormatError};
pub use member::{NarMember, NarMemberMap, NarMemberType};
pub use writer::NarEntry;
