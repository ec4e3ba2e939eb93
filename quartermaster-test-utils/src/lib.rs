//! Quartermaster Test Utilities
//!
//! Shared test infrastructure for the quartermaster workspace:
//! - Fixture requestables, requesters, resolvers and providers
//! - An event log the fixtures record their callbacks into
//! - Proptest generators
//! - Custom assertions for quartermaster errors

pub use quartermaster_core::{
    Location, QuartermasterError, QuartermasterResult, RegistryError, Request, RequestError,
    RequestState, ResolverFault, Tagged, Token, TypeRegistry, TypeTag,
};
pub use quartermaster_resolvers::{
    RegistryExt, RequestManager, Requester, Resolver, ResolverProvider,
};

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

pub const TEXT_TAG: TypeTag = TypeTag::new("quartermaster:test/text");
pub const RECORDING_REQUESTER_TAG: TypeTag = TypeTag::new("quartermaster:test/recording_requester");
pub const TEXT_RESOLVER_TAG: TypeTag = TypeTag::new("quartermaster:test/text_resolver");
pub const FAULTY_RESOLVER_TAG: TypeTag = TypeTag::new("quartermaster:test/faulty_resolver");
pub const CYCLIC_RESOLVER_TAG: TypeTag = TypeTag::new("quartermaster:test/cyclic_resolver");

fn spawn_location() -> Location {
    Location::new("overworld", 0, 64, 0)
}

// ============================================================================
// TEXT REQUESTABLE
// ============================================================================

/// A request for a piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRequestable {
    pub content: String,
}

impl TextRequestable {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn boxed(content: impl Into<String>) -> Box<Self> {
        Box::new(Self::new(content))
    }
}

impl Tagged for TextRequestable {
    fn type_tag(&self) -> TypeTag {
        TEXT_TAG
    }
}

// ============================================================================
// EVENT LOG
// ============================================================================

/// One callback observed by a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Completed { requester: Token, request: Token },
    Cancelled { requester: Token, request: Token },
    /// A resolver lost a request through cancellation or overrule.
    Released {
        resolver: Token,
        request: Token,
        state: RequestState,
    },
    Resolved { resolver: Token, request: Token },
}

/// Callback log shared between fixtures, in call order.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Requests reported complete to `requester`, in order.
    pub fn completed_for(&self, requester: Token) -> Vec<Token> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Completed {
                    requester: r,
                    request,
                } if r == requester => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Every cancellation callback, whoever received it, in order.
    pub fn cancelled(&self) -> Vec<Token> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Cancelled { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|event| matches!(event, Event::Completed { .. }))
            .count()
    }

    /// Release callbacks received by `resolver`, with the state the request was in.
    pub fn released_by(&self, resolver: Token) -> Vec<(Token, RequestState)> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Released {
                    resolver: r,
                    request,
                    state,
                } if r == resolver => Some((request, state)),
                _ => None,
            })
            .collect()
    }

    pub fn resolved_by(&self, resolver: Token) -> Vec<Token> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Resolved {
                    resolver: r,
                    request,
                } if r == resolver => Some(request),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// RECORDING REQUESTER
// ============================================================================

/// A requester that writes every callback into an [`EventLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingRequester {
    id: Token,
    location: Location,
    #[serde(skip)]
    log: EventLog,
}

impl RecordingRequester {
    pub fn new(log: &EventLog) -> Self {
        Self {
            id: Token::new(),
            location: spawn_location(),
            log: log.clone(),
        }
    }

    pub fn shared(log: &EventLog) -> Arc<Self> {
        Arc::new(Self::new(log))
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }
}

impl Tagged for RecordingRequester {
    fn type_tag(&self) -> TypeTag {
        RECORDING_REQUESTER_TAG
    }
}

impl Requester for RecordingRequester {
    fn requester_id(&self) -> Token {
        self.id
    }

    fn location(&self) -> Location {
        self.location.clone()
    }

    fn on_request_complete(&self, _manager: &dyn RequestManager, token: Token) {
        self.log.record(Event::Completed {
            requester: self.id,
            request: token,
        });
    }

    fn on_request_cancelled(&self, _manager: &dyn RequestManager, token: Token) {
        self.log.record(Event::Cancelled {
            requester: self.id,
            request: token,
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// TEXT RESOLVER
// ============================================================================

/// Resolves text one character at a time.
///
/// Single-character content is accepted outright. Longer content is
/// accepted with one prerequisite: a request for the content minus its first
/// character, raised in the resolver's own name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResolver {
    token: Token,
    priority: i32,
    auto_complete: bool,
    persistent: bool,
    followup: Option<String>,
    #[serde(skip)]
    log: EventLog,
}

impl TextResolver {
    /// A resolver that completes every request it is asked to resolve.
    pub fn new(log: &EventLog) -> Self {
        Self {
            token: Token::new(),
            priority: 0,
            auto_complete: true,
            persistent: false,
            followup: None,
            log: log.clone(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Leave resolved requests `Assigned` instead of completing them.
    pub fn deferred(mut self) -> Self {
        self.auto_complete = false;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// After completing a request for someone else, ask for `content` on
    /// that requester's behalf.
    pub fn with_followup(mut self, content: impl Into<String>) -> Self {
        self.followup = Some(content.into());
        self
    }

    pub fn into_arc(self) -> Arc<dyn Resolver> {
        Arc::new(self)
    }
}

impl Tagged for TextResolver {
    fn type_tag(&self) -> TypeTag {
        TEXT_RESOLVER_TAG
    }
}

impl Requester for TextResolver {
    fn requester_id(&self) -> Token {
        self.token
    }

    fn location(&self) -> Location {
        spawn_location()
    }

    fn on_request_complete(&self, _manager: &dyn RequestManager, token: Token) {
        self.log.record(Event::Completed {
            requester: self.token,
            request: token,
        });
    }

    fn on_request_cancelled(&self, _manager: &dyn RequestManager, token: Token) {
        self.log.record(Event::Cancelled {
            requester: self.token,
            request: token,
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Resolver for TextResolver {
    fn request_type(&self) -> TypeTag {
        TEXT_TAG
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn can_resolve(&self, _manager: &dyn RequestManager, request: &Request) -> bool {
        request.payload_as::<TextRequestable>().is_some()
    }

    fn attempt_resolve(
        &self,
        manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Result<Vec<Token>, ResolverFault> {
        let text = request
            .payload_as::<TextRequestable>()
            .ok_or_else(|| ResolverFault::new("payload is not text"))?;

        let mut chars = text.content.chars();
        chars.next();
        let rest = chars.as_str();
        if rest.is_empty() {
            return Ok(Vec::new());
        }

        let child = manager.create_request(self.token, TextRequestable::boxed(rest))?;
        Ok(vec![child])
    }

    fn resolve(
        &self,
        manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Result<(), ResolverFault> {
        self.log.record(Event::Resolved {
            resolver: self.token,
            request: request.token(),
        });
        if self.auto_complete {
            manager.update_request_state(request.token(), RequestState::Completed)?;
        }
        Ok(())
    }

    fn on_request_cancelled_or_overruled(&self, _manager: &dyn RequestManager, request: &Request) {
        self.log.record(Event::Released {
            resolver: self.token,
            request: request.token(),
            state: request.state(),
        });
    }

    fn followup_for_completion(
        &self,
        manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Option<Token> {
        let followup = self.followup.as_ref()?;
        if request.requester() == self.token {
            return None;
        }
        let done = request.payload_as::<TextRequestable>()?;
        if &done.content == followup {
            return None;
        }
        manager
            .create_request(request.requester(), TextRequestable::boxed(followup.clone()))
            .ok()
    }
}

// ============================================================================
// FAULTY RESOLVER
// ============================================================================

/// Where a [`FaultyResolver`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStage {
    Attempt,
    Resolve,
}

/// Claims every text request, then faults.
#[derive(Debug, Clone)]
pub struct FaultyResolver {
    token: Token,
    priority: i32,
    stage: FaultStage,
    log: EventLog,
}

impl FaultyResolver {
    pub fn new(stage: FaultStage, priority: i32, log: &EventLog) -> Self {
        Self {
            token: Token::new(),
            priority,
            stage,
            log: log.clone(),
        }
    }

    pub fn into_arc(self) -> Arc<dyn Resolver> {
        Arc::new(self)
    }
}

impl Tagged for FaultyResolver {
    fn type_tag(&self) -> TypeTag {
        FAULTY_RESOLVER_TAG
    }
}

impl Requester for FaultyResolver {
    fn requester_id(&self) -> Token {
        self.token
    }

    fn location(&self) -> Location {
        spawn_location()
    }

    fn on_request_complete(&self, _manager: &dyn RequestManager, _token: Token) {}

    fn on_request_cancelled(&self, _manager: &dyn RequestManager, _token: Token) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Resolver for FaultyResolver {
    fn request_type(&self) -> TypeTag {
        TEXT_TAG
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_resolve(&self, _manager: &dyn RequestManager, _request: &Request) -> bool {
        true
    }

    fn attempt_resolve(
        &self,
        _manager: &mut dyn RequestManager,
        _request: &Request,
    ) -> Result<Vec<Token>, ResolverFault> {
        match self.stage {
            FaultStage::Attempt => Err(ResolverFault::new("storage rack collapsed")),
            FaultStage::Resolve => Ok(Vec::new()),
        }
    }

    fn resolve(
        &self,
        _manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Result<(), ResolverFault> {
        self.log.record(Event::Resolved {
            resolver: self.token,
            request: request.token(),
        });
        Err(ResolverFault::new("courier lost the delivery"))
    }
}

// ============================================================================
// CYCLIC RESOLVER
// ============================================================================

/// Answers every attempt with a fresh prerequisite plus a back edge to the
/// request's parent (or the request itself), which the manager must reject.
#[derive(Debug, Clone)]
pub struct CyclicResolver {
    token: Token,
    priority: i32,
}

impl CyclicResolver {
    pub fn new(priority: i32) -> Self {
        Self {
            token: Token::new(),
            priority,
        }
    }

    pub fn into_arc(self) -> Arc<dyn Resolver> {
        Arc::new(self)
    }
}

impl Tagged for CyclicResolver {
    fn type_tag(&self) -> TypeTag {
        CYCLIC_RESOLVER_TAG
    }
}

impl Requester for CyclicResolver {
    fn requester_id(&self) -> Token {
        self.token
    }

    fn location(&self) -> Location {
        spawn_location()
    }

    fn on_request_complete(&self, _manager: &dyn RequestManager, _token: Token) {}

    fn on_request_cancelled(&self, _manager: &dyn RequestManager, _token: Token) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Resolver for CyclicResolver {
    fn request_type(&self) -> TypeTag {
        TEXT_TAG
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn can_resolve(&self, _manager: &dyn RequestManager, _request: &Request) -> bool {
        true
    }

    fn attempt_resolve(
        &self,
        manager: &mut dyn RequestManager,
        request: &Request,
    ) -> Result<Vec<Token>, ResolverFault> {
        let fresh = manager.create_request(self.token, TextRequestable::boxed("loop"))?;
        let back_edge = request.parent().unwrap_or(request.token());
        Ok(vec![fresh, back_edge])
    }

    fn resolve(
        &self,
        _manager: &mut dyn RequestManager,
        _request: &Request,
    ) -> Result<(), ResolverFault> {
        Ok(())
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

/// A provider exposing a fixed set of resolvers.
#[derive(Clone)]
pub struct TestProvider {
    token: Token,
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl TestProvider {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self {
            token: Token::new(),
            resolvers,
        }
    }

    pub fn single(resolver: impl Resolver) -> Self {
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);
        Self::new(vec![resolver])
    }

    /// Reuse a provider token, as a host does when it rebuilds a provider
    /// after loading.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Token of the first resolver, for single-resolver providers.
    pub fn first_resolver(&self) -> Option<Token> {
        self.resolvers.first().map(|resolver| resolver.token())
    }
}

impl ResolverProvider for TestProvider {
    fn provider_token(&self) -> Token {
        self.token
    }

    fn resolvers(&self) -> Vec<Arc<dyn Resolver>> {
        self.resolvers.clone()
    }
}

impl std::fmt::Debug for TestProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestProvider")
            .field("token", &self.token)
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made registries and logging setup.

    use super::*;

    /// Standard registry plus every persistable fixture type.
    pub fn fixture_registry() -> QuartermasterResult<TypeRegistry> {
        let mut registry = TypeRegistry::standard();
        registry.register_requestable::<TextRequestable>(TEXT_TAG)?;
        registry.register_requester_type::<RecordingRequester>(RECORDING_REQUESTER_TAG)?;
        registry.register_resolver_type::<TextResolver>(TEXT_RESOLVER_TAG)?;
        Ok(registry)
    }

    /// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from
    /// every test.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for quartermaster types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a fresh v7 token.
    pub fn arb_token() -> impl Strategy<Value = Token> {
        Just(()).prop_map(|_| Token::new())
    }

    pub fn arb_request_state() -> impl Strategy<Value = RequestState> {
        proptest::sample::select(RequestState::ALL.to_vec())
    }

    pub fn arb_location() -> impl Strategy<Value = Location> {
        (
            prop_oneof![Just("overworld"), Just("nether"), Just("end")],
            -30_000_000i64..30_000_000,
            -64i64..320,
            -30_000_000i64..30_000_000,
        )
            .prop_map(|(dimension, x, y, z)| Location::new(dimension, x, y, z))
    }

    /// Text content between one and `max_len` lowercase letters.
    pub fn arb_text_content(max_len: usize) -> impl Strategy<Value = String> {
        proptest::collection::vec(proptest::char::range('a', 'z'), 1..=max_len.max(1))
            .prop_map(|chars| chars.into_iter().collect())
    }

    pub fn arb_text() -> impl Strategy<Value = TextRequestable> {
        arb_text_content(8).prop_map(TextRequestable::new)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for quartermaster error variants.

    use super::*;

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &QuartermasterResult<T>, token: Token) {
        match result {
            Err(QuartermasterError::Request(RequestError::NotFound { token: t })) => {
                assert_eq!(*t, token, "Wrong token in NotFound error");
            }
            other => panic!("Expected NotFound for {}, got: {:?}", token, other),
        }
    }

    #[track_caller]
    pub fn assert_illegal_transition<T: std::fmt::Debug>(
        result: &QuartermasterResult<T>,
        from: RequestState,
        to: RequestState,
    ) {
        match result {
            Err(QuartermasterError::Request(RequestError::IllegalStateTransition {
                from: f,
                to: t,
                ..
            })) => {
                assert_eq!(*f, from, "Wrong source state");
                assert_eq!(*t, to, "Wrong target state");
            }
            other => panic!(
                "Expected IllegalStateTransition({} -> {}), got: {:?}",
                from, to, other
            ),
        }
    }

    #[track_caller]
    pub fn assert_unknown_type<T: std::fmt::Debug>(result: &QuartermasterResult<T>, tag: &str) {
        match result {
            Err(QuartermasterError::Registry(RegistryError::UnknownType { tag: t })) => {
                assert_eq!(t, tag, "Wrong tag in UnknownType error");
            }
            other => panic!("Expected UnknownType for {}, got: {:?}", tag, other),
        }
    }

    #[track_caller]
    pub fn assert_unknown_requester<T: std::fmt::Debug>(
        result: &QuartermasterResult<T>,
        requester: Token,
    ) {
        match result {
            Err(QuartermasterError::Request(RequestError::UnknownRequester { requester: r })) => {
                assert_eq!(*r, requester, "Wrong requester in UnknownRequester error");
            }
            other => panic!("Expected UnknownRequester for {}, got: {:?}", requester, other),
        }
    }
}

// ============================================================================
// SELF-TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixture_registry_knows_fixture_types() {
        let registry = fixtures::fixture_registry().expect("fixture registry");
        assert!(registry.is_registered(TEXT_TAG.as_str()));
        assert!(registry.is_registered(RECORDING_REQUESTER_TAG.as_str()));
        assert!(registry.is_registered(TEXT_RESOLVER_TAG.as_str()));
        assert!(!registry.is_registered(FAULTY_RESOLVER_TAG.as_str()));
    }

    #[test]
    fn test_event_log_filters() {
        let log = EventLog::new();
        let requester = Token::new();
        let request = Token::new();
        log.record(Event::Completed { requester, request });
        log.record(Event::Cancelled {
            requester,
            request: Token::new(),
        });

        assert_eq!(log.len(), 2);
        assert_eq!(log.completed_for(requester), vec![request]);
        assert_eq!(log.cancelled().len(), 1);
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_text_resolver_round_trips_through_registry() {
        let registry = fixtures::fixture_registry().expect("fixture registry");
        let log = EventLog::new();
        let resolver = TextResolver::new(&log).with_priority(3).persistent();

        let doc = registry
            .serialize_dyn(resolver.type_tag(), resolver.as_any())
            .expect("serialize");
        let loaded = registry
            .deserialize_as::<dyn Resolver>(&doc)
            .expect("deserialize");
        assert_eq!(loaded.token(), resolver.token());
        assert_eq!(loaded.priority(), 3);
        assert!(loaded.is_persistent());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_generated_text_is_never_empty(text in generators::arb_text()) {
            prop_assert!(!text.content.is_empty());
            prop_assert!(text.content.chars().count() <= 8);
        }

        #[test]
        fn prop_generated_states_parse_back(state in generators::arb_request_state()) {
            prop_assert_eq!(state.as_db_str().parse::<RequestState>().ok(), Some(state));
        }
    }
}
