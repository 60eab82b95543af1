//! PostgreSQL v3 wire protocol pieces needed to follow a conversation from the outside.
//!
//! Only framing and the handful of message bodies the tracer reads are decoded;
//! startup, authentication and row data pass through untouched.

pub mod messages;
pub mod params;

pub use messages::{
    read_envelope, statement_text, Direction, Envelope, Message, ProtocolError, Tag,
    TransactionStatus, ENVELOPE_LEN, MAX_MESSAGE_SIZE, READY_FOR_QUERY_LEN,
};
pub use params::{decode_parameters, ParamValue};
