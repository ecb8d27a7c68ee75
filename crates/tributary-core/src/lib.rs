//! Tributary core types
//!
//! The value model shared by every stage of the streaming engine: runtime
//! [`Value`]s, [`TupleValues`] moved between operators, [`FieldAccessor`]
//! paths, source [`Schema`]s, [`Period`]s and the [`Clock`] operators read
//! time through.

pub mod clock;
pub mod field;
pub mod period;
pub mod schema;
pub mod tuple;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use field::{FieldAccessor, Subscript, CONTEXT_FIELD, WILDCARD};
pub use period::{Period, PeriodError};
pub use schema::Schema;
pub use tuple::{GroupKey, Tuple, TupleValues};
pub use value::Value;
