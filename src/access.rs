pub mod tuple;
pub mod value;

pub use tuple::{RecordId, Tuple};
pub use value::{FieldType, Value, TEXT_MAX_LEN};
