//! Quartermaster Resolvers - Capability Traits
//!
//! The interfaces the request manager talks to: requesters that declare
//! needs, resolvers that satisfy them, and providers that bring resolvers in
//! and out of the world as a unit. Concrete implementations are supplied by
//! the embedding application.
//!
//! [`RequestManager`] is the view of the manager handed to resolvers. It is
//! re-entrant: a resolver may create child requests from inside
//! `attempt_resolve` or `resolve`.

pub mod registry;

pub use registry::ResolverRegistry;

use quartermaster_core::{
    Location, ManagerConfig, QuartermasterResult, Request, RequestState, Requestable,
    ResolverFault, Tagged, Token, TypeRegistry, TypeTag,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

// ============================================================================
// REQUESTER TRAIT
// ============================================================================

/// Something that declares needs and hears about their outcome.
///
/// A requester only ever observes completion or cancellation. Resolver faults
/// and overrule churn stay inside the manager.
///
/// Callbacks take `&self`; implementations keep any state they update behind
/// interior mutability.
pub trait Requester: Tagged + Send + Sync + Any {
    fn requester_id(&self) -> Token;

    fn location(&self) -> Location;

    /// Called once when a request of this requester is completed or received.
    fn on_request_complete(&self, manager: &dyn RequestManager, token: Token);

    /// Called once when a request of this requester is cancelled.
    fn on_request_cancelled(&self, manager: &dyn RequestManager, token: Token);

    /// Human-readable name of this requester in the context of one request.
    fn display_name(&self, manager: &dyn RequestManager, token: Token) -> String {
        let _ = (manager, token);
        format!("{}", self.type_tag())
    }

    fn as_any(&self) -> &dyn Any;
}

/// View any requester as `&dyn Requester`. Implemented for every sized
/// requester, which lets `dyn Resolver` hand itself out as a requester.
pub trait AsRequester {
    fn as_requester(&self) -> &dyn Requester;
}

impl<T: Requester> AsRequester for T {
    fn as_requester(&self) -> &dyn Requester {
        self
    }
}

// ============================================================================
// RESOLVER TRAIT
// ============================================================================

/// A pluggable strategy that can satisfy one type of requestable.
///
/// Resolvers are requesters too: children a resolver spawns while resolving
/// are requested in its own name, and it hears about their outcome through
/// the [`Requester`] callbacks.
///
/// # Example
/// ```ignore
/// impl Resolver for Warehouse {
///     fn request_type(&self) -> TypeTag { PLANKS_TAG }
///
///     fn attempt_resolve(&self, manager: &mut dyn RequestManager, request: &Request)
///         -> Result<Vec<Token>, ResolverFault>
///     {
///         if self.has_stock(request) {
///             Ok(Vec::new())
///         } else {
///             let logs = manager.create_request(self.token(), Box::new(Logs::for_planks(request)))?;
///             Ok(vec![logs])
///         }
///     }
///     // ...
/// }
/// ```
pub trait Resolver: Requester + AsRequester {
    /// Token of this resolver. Equal to its requester id.
    fn token(&self) -> Token {
        self.requester_id()
    }

    /// Tag of the requestable payload type this resolver accepts.
    fn request_type(&self) -> TypeTag;

    /// Higher priorities are tried first.
    fn priority(&self) -> i32 {
        0
    }

    /// Persistent resolvers are written into the manager's document. They
    /// need a factory in the type registry.
    fn is_persistent(&self) -> bool {
        false
    }

    fn can_resolve(&self, manager: &dyn RequestManager, request: &Request) -> bool;

    /// Decide whether to take the request.
    ///
    /// `Ok(vec![])` accepts it outright. A non-empty list names prerequisite
    /// requests; the request waits until all of them are terminal. `Err` means
    /// this resolver cannot take it after all.
    fn attempt_resolve(
        &self,
        manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Result<Vec<Token>, ResolverFault>;

    /// Work an assigned request. Synchronous resolvers may mark it completed
    /// before returning.
    fn resolve(&self, manager: &mut dyn RequestManager, request: &Request)
        -> Result<(), ResolverFault>;

    /// The request was cancelled or taken away from this resolver.
    fn on_request_cancelled_or_overruled(&self, manager: &dyn RequestManager, request: &Request) {
        let _ = (manager, request);
    }

    /// Optionally enqueue one more request after `request` completed.
    fn followup_for_completion(
        &self,
        manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Option<Token> {
        let _ = (manager, request);
        None
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// A bundle of resolvers added to and removed from the world together.
pub trait ResolverProvider: Send + Sync {
    fn provider_token(&self) -> Token;

    /// The resolvers this provider exposes, in registration order.
    fn resolvers(&self) -> Vec<Arc<dyn Resolver>>;
}

// ============================================================================
// REQUEST MANAGER TRAIT
// ============================================================================

/// The request manager as seen by resolvers and requesters.
pub trait RequestManager {
    fn type_registry(&self) -> &TypeRegistry;

    fn config(&self) -> &ManagerConfig;

    /// Register a new request in `Created` without resolving it.
    fn create_request(
        &mut self,
        requester: Token,
        payload: Box<dyn Requestable>,
    ) -> QuartermasterResult<Token>;

    /// Create a request and run a resolution pass on it immediately.
    fn create_and_assign_request(
        &mut self,
        requester: Token,
        payload: Box<dyn Requestable>,
    ) -> QuartermasterResult<Token>;

    /// Look up a live request. Terminal requests are gone.
    fn get_request(&self, token: Token) -> QuartermasterResult<&Request>;

    /// The sole external mutator of request state.
    fn update_request_state(&mut self, token: Token, state: RequestState)
        -> QuartermasterResult<()>;

    /// Run a resolution pass for a request still in `Created`.
    fn resolve_request(&mut self, token: Token) -> QuartermasterResult<()>;

    /// Move a request to a different resolver, skipping the blacklisted ones.
    fn reassign_request(
        &mut self,
        token: Token,
        blacklist: &[Token],
    ) -> QuartermasterResult<Option<Token>>;

    fn resolver_for_request(&self, token: Token) -> Option<Token>;

    fn requests_for_requester(&self, requester: Token) -> Vec<Token>;
}

// ============================================================================
// TYPE REGISTRY EXTENSIONS
// ============================================================================

/// Registration helpers for requester and resolver families.
pub trait RegistryExt {
    /// Register a serde-backed requester type loadable as `dyn Requester`.
    fn register_requester_type<T>(&mut self, tag: TypeTag) -> QuartermasterResult<()>
    where
        T: Requester + Serialize + DeserializeOwned;

    /// Register a serde-backed resolver type loadable as `dyn Resolver`.
    fn register_resolver_type<T>(&mut self, tag: TypeTag) -> QuartermasterResult<()>
    where
        T: Resolver + Serialize + DeserializeOwned;
}

impl RegistryExt for TypeRegistry {
    fn register_requester_type<T>(&mut self, tag: TypeTag) -> QuartermasterResult<()>
    where
        T: Requester + Serialize + DeserializeOwned,
    {
        self.register(quartermaster_core::SerdeFactory::<T>::new(tag))?;
        self.register_upcast::<T, dyn Requester>(|value| Box::new(value));
        Ok(())
    }

    fn register_resolver_type<T>(&mut self, tag: TypeTag) -> QuartermasterResult<()>
    where
        T: Resolver + Serialize + DeserializeOwned,
    {
        self.register(quartermaster_core::SerdeFactory::<T>::new(tag))?;
        self.register_upcast::<T, dyn Resolver>(|value| Box::new(value));
        Ok(())
    }
}
