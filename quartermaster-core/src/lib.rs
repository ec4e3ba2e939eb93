//! Quartermaster Core - Entity Types and Type Registry
//!
//! Tokens, request states, the request entity, the persistence document and
//! the tagged factory registry. Every other quartermaster crate depends on
//! this one. Resolution behavior lives in `quartermaster-manager`.

pub mod config;
pub mod document;
pub mod entities;
pub mod error;
pub mod identity;
pub mod registry;
pub mod request;
pub mod state;

pub use config::ManagerConfig;
pub use document::{compound, Document, DocumentExt};
pub use entities::{Location, Requestable};
pub use error::{
    ConfigError, QuartermasterError, QuartermasterResult, RegistryError, RequestError,
    ResolverFault,
};
pub use identity::{Timestamp, Token};
pub use registry::{
    Factory, RegistryResult, SerdeFactory, Tagged, TokenFactory, TypeRegistry, TypeTag,
    DATA_FIELD, TOKEN_TAG, TYPE_FIELD,
};
pub use request::{Request, RequestFactory, RequestSeed, REQUEST_TAG};
pub use state::{RequestState, RequestStateParseError};
