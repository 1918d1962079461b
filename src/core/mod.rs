pub mod error;
pub mod ids;
pub mod operation;

pub use error::{BatchError, Result};
pub use ids::parse_object_id;
pub use operation::{
    BatchItem, ConsistencyLevel, ObjectInput, ObjectWrite, Operation, ReferenceInput,
    ReferenceTarget, ReferenceWrite,
};
