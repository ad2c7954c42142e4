pub mod envelope;
pub mod error;


pub use envelope::{
    attr, current_millis, AttributeMap, Envelope, MessageId, MessageType, NodeId,
};
pub use error::{ClusterError, Result};
