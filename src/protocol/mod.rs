//! Postgres wire protocol (v3) messages and codec
//!
//! Only the subset needed for startup, authentication, simple queries and
//! termination is implemented.

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;

pub use decode::{decode_message, is_incomplete};
pub use encode::encode_message;
pub use message::{
    AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription, FrontendMessage,
};
