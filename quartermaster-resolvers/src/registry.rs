//! Resolver registry: providers, resolvers and candidate ordering

use crate::{RequestManager, Resolver, ResolverProvider};
use quartermaster_core::{Request, RequestError, Token, TypeTag};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

struct RegisteredResolver {
    resolver: Arc<dyn Resolver>,
    provider: Token,
    seq: u64,
}

/// Index of every resolver currently in the world.
///
/// Resolvers are indexed by the payload type they accept. Candidate order is
/// priority descending, then registration order, so repeated passes over the
/// same registry always try resolvers in the same sequence.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<Token, RegisteredResolver>,
    by_type: HashMap<TypeTag, Vec<Token>>,
    providers: BTreeMap<Token, Vec<Token>>,
    next_seq: u64,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every resolver of `provider`.
    ///
    /// Nothing is registered if the provider is already known or any of its
    /// resolver tokens is taken.
    pub fn add_provider(&mut self, provider: &dyn ResolverProvider) -> Result<Vec<Token>, RequestError> {
        let provider_token = provider.provider_token();
        if self.providers.contains_key(&provider_token) {
            return Err(RequestError::ProviderAlreadyRegistered {
                provider: provider_token,
            });
        }

        let resolvers = provider.resolvers();
        let mut seen = Vec::with_capacity(resolvers.len());
        for resolver in &resolvers {
            let token = resolver.token();
            if self.resolvers.contains_key(&token) || seen.contains(&token) {
                return Err(RequestError::DuplicateResolver { resolver: token });
            }
            seen.push(token);
        }

        self.providers.insert(provider_token, Vec::new());
        for resolver in resolvers {
            self.insert(provider_token, resolver);
        }
        Ok(seen)
    }

    /// Remove a provider and all its resolvers from every index.
    pub fn remove_provider(&mut self, provider: Token) -> Result<Vec<Arc<dyn Resolver>>, RequestError> {
        let tokens = self
            .providers
            .remove(&provider)
            .ok_or(RequestError::ProviderNotRegistered { provider })?;
        Ok(tokens
            .into_iter()
            .filter_map(|token| self.remove_resolver(token))
            .collect())
    }

    /// Attach a single resolver to a provider, creating the provider entry if
    /// needed. Used when restoring persisted resolvers.
    pub fn add_resolver(&mut self, provider: Token, resolver: Arc<dyn Resolver>) -> Result<(), RequestError> {
        let token = resolver.token();
        if self.resolvers.contains_key(&token) {
            return Err(RequestError::DuplicateResolver { resolver: token });
        }
        self.providers.entry(provider).or_default();
        self.insert(provider, resolver);
        Ok(())
    }

    fn insert(&mut self, provider: Token, resolver: Arc<dyn Resolver>) {
        let token = resolver.token();
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::trace!(
            resolver = %token,
            provider = %provider,
            request_type = %resolver.request_type(),
            priority = resolver.priority(),
            "Resolver indexed"
        );

        self.by_type
            .entry(resolver.request_type())
            .or_default()
            .push(token);
        if let Some(owned) = self.providers.get_mut(&provider) {
            owned.push(token);
        }
        self.resolvers.insert(
            token,
            RegisteredResolver {
                resolver,
                provider,
                seq,
            },
        );
    }

    fn remove_resolver(&mut self, token: Token) -> Option<Arc<dyn Resolver>> {
        let entry = self.resolvers.remove(&token)?;
        let tag = entry.resolver.request_type();
        if let Some(indexed) = self.by_type.get_mut(&tag) {
            indexed.retain(|t| *t != token);
            if indexed.is_empty() {
                self.by_type.remove(&tag);
            }
        }
        Some(entry.resolver)
    }

    pub fn get(&self, token: Token) -> Option<Arc<dyn Resolver>> {
        self.resolvers.get(&token).map(|entry| entry.resolver.clone())
    }

    pub fn contains(&self, token: Token) -> bool {
        self.resolvers.contains_key(&token)
    }

    pub fn provider_of(&self, resolver: Token) -> Option<Token> {
        self.resolvers.get(&resolver).map(|entry| entry.provider)
    }

    pub fn has_provider(&self, provider: Token) -> bool {
        self.providers.contains_key(&provider)
    }

    /// Registered provider tokens, sorted.
    pub fn providers(&self) -> Vec<Token> {
        self.providers.keys().copied().collect()
    }

    /// Resolver tokens of one provider, in registration order.
    pub fn resolvers_of(&self, provider: Token) -> Vec<Token> {
        self.providers.get(&provider).cloned().unwrap_or_default()
    }

    /// All resolvers accepting `tag`, in candidate order.
    pub fn ordered_for_type(&self, tag: TypeTag) -> Vec<Arc<dyn Resolver>> {
        let Some(tokens) = self.by_type.get(&tag) else {
            return Vec::new();
        };
        let mut entries: Vec<&RegisteredResolver> = tokens
            .iter()
            .filter_map(|token| self.resolvers.get(token))
            .collect();
        entries.sort_by_key(|entry| (Reverse(entry.resolver.priority()), entry.seq));
        entries
            .into_iter()
            .map(|entry| entry.resolver.clone())
            .collect()
    }

    /// Resolvers willing to take `request`, in candidate order, minus the
    /// blacklisted ones.
    pub fn candidates_for(
        &self,
        manager: &dyn RequestManager,
        request: &Request,
        blacklist: &[Token],
    ) -> Vec<Arc<dyn Resolver>> {
        self.ordered_for_type(request.payload_tag())
            .into_iter()
            .filter(|resolver| !blacklist.contains(&resolver.token()))
            .filter(|resolver| resolver.can_resolve(manager, request))
            .collect()
    }

    /// Persistent resolvers grouped under their provider, in registration order.
    pub fn persistent(&self) -> Vec<(Token, Arc<dyn Resolver>)> {
        let mut entries: Vec<&RegisteredResolver> = self
            .resolvers
            .values()
            .filter(|entry| entry.resolver.is_persistent())
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| (entry.provider, entry.resolver.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &self.resolvers.len())
            .field("providers", &self.providers.len())
            .field("types", &self.by_type.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Requester;
    use quartermaster_core::{
        Location, ManagerConfig, QuartermasterResult, RequestState, Requestable, ResolverFault,
        Tagged, TypeRegistry,
    };
    use std::any::Any;

    const WOOD: TypeTag = TypeTag::new("test:wood");
    const STONE: TypeTag = TypeTag::new("test:stone");

    #[derive(Debug, Clone, PartialEq)]
    struct Wood;

    impl Tagged for Wood {
        fn type_tag(&self) -> TypeTag {
            WOOD
        }
    }

    struct Stub {
        token: Token,
        accepts: TypeTag,
        priority: i32,
        willing: bool,
    }

    impl Stub {
        fn new(accepts: TypeTag, priority: i32) -> Arc<Self> {
            Arc::new(Self {
                token: Token::new(),
                accepts,
                priority,
                willing: true,
            })
        }
    }

    impl Tagged for Stub {
        fn type_tag(&self) -> TypeTag {
            TypeTag::new("test:stub")
        }
    }

    impl Requester for Stub {
        fn requester_id(&self) -> Token {
            self.token
        }
        fn location(&self) -> Location {
            Location::new("overworld", 0, 0, 0)
        }
        fn on_request_complete(&self, _manager: &dyn RequestManager, _token: Token) {}
        fn on_request_cancelled(&self, _manager: &dyn RequestManager, _token: Token) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Resolver for Stub {
        fn request_type(&self) -> TypeTag {
            self.accepts
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_resolve(&self, _manager: &dyn RequestManager, _request: &Request) -> bool {
            self.willing
        }
        fn attempt_resolve(
            &self,
            _manager: &mut dyn RequestManager,
            _request: &Request,
        ) -> Result<Vec<Token>, ResolverFault> {
            Ok(Vec::new())
        }
        fn resolve(
            &self,
            _manager: &mut dyn RequestManager,
            _request: &Request,
        ) -> Result<(), ResolverFault> {
            Ok(())
        }
    }

    struct Bundle {
        token: Token,
        resolvers: Vec<Arc<dyn Resolver>>,
    }

    impl Bundle {
        fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
            Self {
                token: Token::new(),
                resolvers,
            }
        }
    }

    impl ResolverProvider for Bundle {
        fn provider_token(&self) -> Token {
            self.token
        }
        fn resolvers(&self) -> Vec<Arc<dyn Resolver>> {
            self.resolvers.clone()
        }
    }

    /// A manager view with no requests, enough for `can_resolve` probing.
    struct NullManager {
        registry: TypeRegistry,
        config: ManagerConfig,
    }

    impl NullManager {
        fn new() -> Self {
            Self {
                registry: TypeRegistry::standard(),
                config: ManagerConfig::default(),
            }
        }
    }

    impl RequestManager for NullManager {
        fn type_registry(&self) -> &TypeRegistry {
            &self.registry
        }
        fn config(&self) -> &ManagerConfig {
            &self.config
        }
        fn create_request(&mut self, _: Token, _: Box<dyn Requestable>) -> QuartermasterResult<Token> {
            Ok(Token::new())
        }
        fn create_and_assign_request(
            &mut self,
            _: Token,
            _: Box<dyn Requestable>,
        ) -> QuartermasterResult<Token> {
            Ok(Token::new())
        }
        fn get_request(&self, token: Token) -> QuartermasterResult<&Request> {
            Err(RequestError::NotFound { token }.into())
        }
        fn update_request_state(&mut self, token: Token, _: RequestState) -> QuartermasterResult<()> {
            Err(RequestError::NotFound { token }.into())
        }
        fn resolve_request(&mut self, token: Token) -> QuartermasterResult<()> {
            Err(RequestError::NotFound { token }.into())
        }
        fn reassign_request(&mut self, token: Token, _: &[Token]) -> QuartermasterResult<Option<Token>> {
            Err(RequestError::NotFound { token }.into())
        }
        fn resolver_for_request(&self, _: Token) -> Option<Token> {
            None
        }
        fn requests_for_requester(&self, _: Token) -> Vec<Token> {
            Vec::new()
        }
    }

    fn wood_request() -> Request {
        Request::new(Token::new(), Token::new(), Box::new(Wood))
    }

    fn tokens(resolvers: &[Arc<dyn Resolver>]) -> Vec<Token> {
        resolvers.iter().map(|r| r.token()).collect()
    }

    #[test]
    fn test_add_provider_indexes_by_type() {
        let mut registry = ResolverRegistry::new();
        let wood = Stub::new(WOOD, 0);
        let stone = Stub::new(STONE, 0);
        let bundle = Bundle::new(vec![wood.clone(), stone.clone()]);

        let added = registry.add_provider(&bundle).unwrap();
        assert_eq!(added, vec![wood.token, stone.token]);
        assert_eq!(registry.len(), 2);
        assert_eq!(tokens(&registry.ordered_for_type(WOOD)), vec![wood.token]);
        assert_eq!(registry.provider_of(stone.token), Some(bundle.token));
    }

    #[test]
    fn test_add_provider_twice_rejected() {
        let mut registry = ResolverRegistry::new();
        let bundle = Bundle::new(vec![Stub::new(WOOD, 0)]);
        registry.add_provider(&bundle).unwrap();
        let err = registry.add_provider(&bundle).unwrap_err();
        assert_eq!(
            err,
            RequestError::ProviderAlreadyRegistered {
                provider: bundle.token
            }
        );
    }

    #[test]
    fn test_shared_resolver_rejected_atomically() {
        let mut registry = ResolverRegistry::new();
        let shared = Stub::new(WOOD, 0);
        registry
            .add_provider(&Bundle::new(vec![shared.clone()]))
            .unwrap();

        let fresh = Stub::new(STONE, 0);
        let second = Bundle::new(vec![fresh.clone(), shared.clone()]);
        let err = registry.add_provider(&second).unwrap_err();
        assert_eq!(err, RequestError::DuplicateResolver { resolver: shared.token });
        assert!(!registry.contains(fresh.token));
        assert!(!registry.has_provider(second.token));
    }

    #[test]
    fn test_remove_provider_clears_indexes() {
        let mut registry = ResolverRegistry::new();
        let bundle = Bundle::new(vec![Stub::new(WOOD, 0), Stub::new(WOOD, 1)]);
        registry.add_provider(&bundle).unwrap();

        let removed = registry.remove_provider(bundle.token).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.ordered_for_type(WOOD).is_empty());
        assert!(registry.providers().is_empty());
    }

    #[test]
    fn test_remove_unknown_provider() {
        let mut registry = ResolverRegistry::new();
        let token = Token::new();
        assert!(matches!(
            registry.remove_provider(token),
            Err(RequestError::ProviderNotRegistered { provider }) if provider == token
        ));
    }

    #[test]
    fn test_candidates_priority_then_registration_order() {
        let mut registry = ResolverRegistry::new();
        let low = Stub::new(WOOD, 1);
        let high = Stub::new(WOOD, 10);
        let tie_first = Stub::new(WOOD, 5);
        let tie_second = Stub::new(WOOD, 5);
        registry
            .add_provider(&Bundle::new(vec![low.clone(), tie_first.clone()]))
            .unwrap();
        registry
            .add_provider(&Bundle::new(vec![high.clone(), tie_second.clone()]))
            .unwrap();

        let manager = NullManager::new();
        let request = wood_request();
        let order = tokens(&registry.candidates_for(&manager, &request, &[]));
        assert_eq!(
            order,
            vec![high.token, tie_first.token, tie_second.token, low.token]
        );
    }

    #[test]
    fn test_candidates_skip_blacklist_and_unwilling() {
        let mut registry = ResolverRegistry::new();
        let banned = Stub::new(WOOD, 3);
        let unwilling = Arc::new(Stub {
            token: Token::new(),
            accepts: WOOD,
            priority: 2,
            willing: false,
        });
        let ok = Stub::new(WOOD, 1);
        registry
            .add_provider(&Bundle::new(vec![banned.clone(), unwilling, ok.clone()]))
            .unwrap();

        let manager = NullManager::new();
        let request = wood_request();
        let order = tokens(&registry.candidates_for(&manager, &request, &[banned.token]));
        assert_eq!(order, vec![ok.token]);
    }

    #[test]
    fn test_add_resolver_creates_provider_entry() {
        let mut registry = ResolverRegistry::new();
        let provider = Token::new();
        let stub = Stub::new(STONE, 0);
        registry.add_resolver(provider, stub.clone()).unwrap();
        assert!(registry.has_provider(provider));
        assert_eq!(registry.resolvers_of(provider), vec![stub.token]);
        assert!(registry.add_resolver(provider, stub).is_err());
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::Requester;
    use proptest::prelude::*;
    use quartermaster_core::{Location, ResolverFault, Tagged};
    use std::any::Any;

    const ANY_TAG: TypeTag = TypeTag::new("test:any");

    struct Ranked {
        token: Token,
        priority: i32,
    }

    impl Tagged for Ranked {
        fn type_tag(&self) -> TypeTag {
            TypeTag::new("test:ranked")
        }
    }

    impl Requester for Ranked {
        fn requester_id(&self) -> Token {
            self.token
        }
        fn location(&self) -> Location {
            Location::new("overworld", 0, 0, 0)
        }
        fn on_request_complete(&self, _: &dyn RequestManager, _: Token) {}
        fn on_request_cancelled(&self, _: &dyn RequestManager, _: Token) {}
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Resolver for Ranked {
        fn request_type(&self) -> TypeTag {
            ANY_TAG
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_resolve(&self, _: &dyn RequestManager, _: &Request) -> bool {
            true
        }
        fn attempt_resolve(
            &self,
            _: &mut dyn RequestManager,
            _: &Request,
        ) -> Result<Vec<Token>, ResolverFault> {
            Ok(Vec::new())
        }
        fn resolve(&self, _: &mut dyn RequestManager, _: &Request) -> Result<(), ResolverFault> {
            Ok(())
        }
    }

    struct Single(Arc<dyn Resolver>, Token);

    impl ResolverProvider for Single {
        fn provider_token(&self) -> Token {
            self.1
        }
        fn resolvers(&self) -> Vec<Arc<dyn Resolver>> {
            vec![self.0.clone()]
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: candidate order is priority descending, ties in
        /// registration order, and identical on every call.
        #[test]
        fn prop_candidate_order_deterministic(priorities in prop::collection::vec(-5i32..5, 1..12)) {
            let mut registry = ResolverRegistry::new();
            let mut registered = Vec::new();
            for (index, priority) in priorities.iter().enumerate() {
                let resolver = Arc::new(Ranked { token: Token::new(), priority: *priority });
                registered.push((index, *priority, resolver.token));
                registry.add_provider(&Single(resolver, Token::new())).unwrap();
            }

            let first: Vec<Token> = registry.ordered_for_type(ANY_TAG).iter().map(|r| r.token()).collect();
            let second: Vec<Token> = registry.ordered_for_type(ANY_TAG).iter().map(|r| r.token()).collect();
            prop_assert_eq!(&first, &second);

            registered.sort_by_key(|(index, priority, _)| (Reverse(*priority), *index));
            let expected: Vec<Token> = registered.into_iter().map(|(_, _, token)| token).collect();
            prop_assert_eq!(first, expected);
        }
    }
}
