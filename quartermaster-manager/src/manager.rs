//! Standard request manager: request index, requesters and provider events

use quartermaster_core::registry::{self, TOKEN_TAG};
use quartermaster_core::{
    ManagerConfig, QuartermasterResult, Request, RequestError, RequestSeed, RequestState,
    Requestable, Tagged, Token, TypeRegistry, REQUEST_TAG,
};
use quartermaster_resolvers::{
    AsRequester, RequestManager, Requester, Resolver, ResolverProvider, ResolverRegistry,
};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// A requester found by token: either registered directly, or a resolver
/// acting as the requester of the children it spawned.
pub(crate) enum RequesterHandle {
    Registered(Arc<dyn Requester>),
    Resolver(Arc<dyn Resolver>),
}

impl RequesterHandle {
    pub(crate) fn get(&self) -> &dyn Requester {
        match self {
            RequesterHandle::Registered(requester) => requester.as_ref(),
            RequesterHandle::Resolver(resolver) => resolver.as_requester(),
        }
    }
}

/// Owns every live request and drives its lifecycle.
///
/// The manager is the single writer of all request and resolver-registry
/// state. It is not shared across threads; resolvers re-enter it through
/// the [`RequestManager`] trait while a resolution pass is running.
///
/// # Example
/// ```ignore
/// let mut manager = StandardRequestManager::new(ManagerConfig::default())?;
/// manager.register_requester(citizen.clone());
/// manager.on_provider_added(&warehouse)?;
///
/// let token = manager.create_and_assign_request(citizen.requester_id(), Box::new(planks))?;
/// ```
pub struct StandardRequestManager {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) config: ManagerConfig,
    pub(crate) requests: BTreeMap<Token, Request>,
    pub(crate) requesters: BTreeMap<Token, Arc<dyn Requester>>,
    pub(crate) resolvers: ResolverRegistry,
    pub(crate) resolution_depth: Arc<AtomicU32>,
}

impl StandardRequestManager {
    /// Create a manager backed by the process-wide type registry.
    pub fn new(config: ManagerConfig) -> QuartermasterResult<Self> {
        Self::with_registry(registry::global(), config)
    }

    /// Create a manager with an explicit type registry.
    pub fn with_registry(
        registry: Arc<TypeRegistry>,
        config: ManagerConfig,
    ) -> QuartermasterResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            config,
            requests: BTreeMap::new(),
            requesters: BTreeMap::new(),
            resolvers: ResolverRegistry::new(),
            resolution_depth: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Shared handle to the type registry this manager persists through.
    pub fn registry_handle(&self) -> Arc<TypeRegistry> {
        self.registry.clone()
    }

    pub fn resolver_registry(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    // ========================================================================
    // REQUESTERS
    // ========================================================================

    /// Register a requester. Returns the requester previously registered
    /// under the same token, if any.
    pub fn register_requester(&mut self, requester: Arc<dyn Requester>) -> Option<Arc<dyn Requester>> {
        let token = requester.requester_id();
        if self.config.debug_logging {
            tracing::debug!(requester = %token, "Requester registered");
        }
        self.requesters.insert(token, requester)
    }

    pub fn is_requester_known(&self, token: Token) -> bool {
        self.requester_handle(token).is_some()
    }

    /// Cancel every live request of `requester`, then forget it.
    ///
    /// Returns how many requests were cancelled directly (descendants
    /// cancelled by cascade are not counted).
    pub fn on_requester_removed(&mut self, requester: Token) -> QuartermasterResult<usize> {
        if !self.requesters.contains_key(&requester) {
            return Err(RequestError::UnknownRequester { requester }.into());
        }

        let mut cancelled = 0;
        for token in self.requests_for_requester(requester) {
            if self.requests.contains_key(&token) {
                self.cancel_request(token, true);
                cancelled += 1;
            }
        }
        self.requesters.remove(&requester);

        tracing::info!(requester = %requester, cancelled, "Requester removed");
        Ok(cancelled)
    }

    pub(crate) fn requester_handle(&self, token: Token) -> Option<RequesterHandle> {
        if let Some(requester) = self.requesters.get(&token) {
            return Some(RequesterHandle::Registered(requester.clone()));
        }
        self.resolvers.get(token).map(RequesterHandle::Resolver)
    }

    pub(crate) fn notify_complete(&self, request: &Request) {
        match self.requester_handle(request.requester()) {
            Some(handle) => handle.get().on_request_complete(self, request.token()),
            None => tracing::debug!(
                request = %request.token(),
                requester = %request.requester(),
                "Requester gone, completion not delivered"
            ),
        }
    }

    pub(crate) fn notify_cancelled(&self, request: &Request) {
        match self.requester_handle(request.requester()) {
            Some(handle) => handle.get().on_request_cancelled(self, request.token()),
            None => tracing::debug!(
                request = %request.token(),
                requester = %request.requester(),
                "Requester gone, cancellation not delivered"
            ),
        }
    }

    // ========================================================================
    // PROVIDERS
    // ========================================================================

    /// Register every resolver of `provider`, then retry unresolved requests.
    pub fn on_provider_added(&mut self, provider: &dyn ResolverProvider) -> QuartermasterResult<()> {
        let added = self.resolvers.add_provider(provider)?;
        tracing::debug!(
            provider = %provider.provider_token(),
            resolvers = added.len(),
            "Provider added"
        );
        self.resolve_pending();
        Ok(())
    }

    /// Unregister every resolver of `provider` and overrule the requests
    /// bound to them.
    pub fn on_provider_removed(&mut self, provider: &dyn ResolverProvider) -> QuartermasterResult<()> {
        self.remove_provider(provider.provider_token())
    }

    /// Token-only variant of [`StandardRequestManager::on_provider_removed`].
    pub fn remove_provider(&mut self, provider: Token) -> QuartermasterResult<()> {
        let removed = self.resolvers.remove_provider(provider)?;
        let removed_tokens: Vec<Token> = removed.iter().map(|resolver| resolver.token()).collect();

        let affected: Vec<Token> = self
            .requests
            .values()
            .filter(|request| request.state().has_resolver())
            .filter(|request| {
                request
                    .resolver()
                    .is_some_and(|resolver| removed_tokens.contains(&resolver))
            })
            .map(Request::token)
            .collect();

        tracing::info!(
            provider = %provider,
            resolvers = removed_tokens.len(),
            affected = affected.len(),
            "Provider removed"
        );

        for token in affected {
            let bound = self
                .requests
                .get(&token)
                .and_then(Request::resolver)
                .filter(|resolver| removed_tokens.contains(resolver));
            let Some(bound) = bound else { continue };
            let old = removed.iter().find(|r| r.token() == bound).cloned();
            self.overrule_for_removal(token, old);
        }

        // Requests the removed resolvers raised in their own name have lost
        // their requester.
        let orphaned: Vec<Token> = self
            .requests
            .values()
            .filter(|request| removed_tokens.contains(&request.requester()))
            .map(Request::token)
            .collect();
        for token in orphaned {
            if self.requests.contains_key(&token) {
                self.cancel_request(token, true);
            }
        }

        Ok(())
    }

    /// Registered provider tokens, sorted.
    pub fn providers(&self) -> Vec<Token> {
        self.resolvers.providers()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn live_request_count(&self) -> usize {
        self.requests.len()
    }

    /// Live requests in token order.
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }

    pub(crate) fn state_of(&self, token: Token) -> Option<RequestState> {
        self.requests.get(&token).map(Request::state)
    }

    // ========================================================================
    // LIFECYCLE SIDE EFFECTS
    // ========================================================================

    pub(crate) fn complete_request(&mut self, token: Token) {
        let Some(request) = self.requests.get_mut(&token) else {
            return;
        };
        request.set_state(RequestState::Completed);
        let snapshot = request.clone();

        self.notify_complete(&snapshot);

        let resolver = snapshot.resolver().and_then(|rt| self.resolvers.get(rt));
        if let Some(resolver) = resolver {
            if let Some(followup) = resolver.followup_for_completion(self, &snapshot) {
                if self.state_of(followup) == Some(RequestState::Created) {
                    self.run_resolution(followup, &[]);
                }
            }
        }

        self.retire(token, true);
    }

    pub(crate) fn receive_request(&mut self, token: Token) {
        self.cancel_children(token);
        let Some(request) = self.requests.get_mut(&token) else {
            return;
        };
        request.set_state(RequestState::Received);
        let snapshot = request.clone();

        self.notify_complete(&snapshot);
        self.retire(token, true);
    }

    /// Cancel a request and its whole subtree, children first.
    ///
    /// `retry_parent` is false inside a cascade, where the parent is about to
    /// be cancelled or re-planned itself.
    pub(crate) fn cancel_request(&mut self, token: Token, retry_parent: bool) {
        self.cancel_children(token);
        let Some(request) = self.requests.get_mut(&token) else {
            return;
        };
        request.set_state(RequestState::Cancelled);
        let snapshot = request.clone();

        self.notify_cancelled(&snapshot);
        let resolver = snapshot.resolver().and_then(|rt| self.resolvers.get(rt));
        if let Some(resolver) = resolver {
            resolver.on_request_cancelled_or_overruled(&*self, &snapshot);
        }

        if self.config.debug_logging {
            tracing::debug!(request = %token, "Request cancelled");
        }
        self.retire(token, retry_parent);
    }

    pub(crate) fn cancel_children(&mut self, token: Token) {
        let children = match self.requests.get(&token) {
            Some(request) => request.children().to_vec(),
            None => return,
        };
        for child in children {
            self.cancel_request(child, false);
        }
    }

    /// Remove a terminal request from the index and unlink it from its parent.
    pub(crate) fn retire(&mut self, token: Token, retry_parent: bool) {
        let Some(request) = self.requests.remove(&token) else {
            return;
        };
        let Some(parent) = request.parent() else {
            return;
        };
        if retry_parent {
            self.on_child_terminal(parent, token);
        } else if let Some(parent) = self.requests.get_mut(&parent) {
            parent.remove_child(token);
        }
    }

    /// Take a request away from its resolver and put it back in `Created`.
    ///
    /// The request passes through `Overruled`, its outstanding children are
    /// cancelled, and the old resolver is told. Returns the old resolver token.
    pub(crate) fn detach_resolver(
        &mut self,
        token: Token,
        old: Option<Arc<dyn Resolver>>,
    ) -> Option<Token> {
        self.requests.get_mut(&token)?.set_state(RequestState::Overruled);
        self.cancel_children(token);

        let snapshot = self.requests.get(&token)?.clone();
        let previous = snapshot.resolver();
        let old = old.or_else(|| previous.and_then(|rt| self.resolvers.get(rt)));
        if let Some(resolver) = old {
            resolver.on_request_cancelled_or_overruled(&*self, &snapshot);
        }

        if let Some(request) = self.requests.get_mut(&token) {
            request.clear_children();
            request.set_resolver(None);
            request.set_state(RequestState::Created);
        }
        previous
    }

    /// Explicit overrule: reassign away from the current resolver, cancel if
    /// nobody else takes it.
    pub(crate) fn overrule_request(&mut self, token: Token) {
        let previous = self.detach_resolver(token, None);
        tracing::info!(
            request = %token,
            resolver = ?previous,
            "Request overruled, reassigning"
        );

        let blacklist: Vec<Token> = previous.into_iter().collect();
        let assigned = self.run_resolution(token, &blacklist);
        if assigned.is_none() && self.state_of(token) == Some(RequestState::Created) {
            tracing::info!(
                request = %token,
                "No other resolver accepts overruled request, cancelling"
            );
            self.cancel_request(token, true);
        }
    }

    /// Overrule because the bound resolver no longer exists. The request
    /// re-enters resolution and may stay `Created`.
    pub(crate) fn overrule_for_removal(&mut self, token: Token, old: Option<Arc<dyn Resolver>>) {
        let previous = self.detach_resolver(token, old);
        tracing::info!(
            request = %token,
            resolver = ?previous,
            "Resolver gone, request re-entering resolution"
        );
        self.run_resolution(token, &[]);
    }
}

impl std::fmt::Debug for StandardRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardRequestManager")
            .field("requests", &self.requests.len())
            .field("requesters", &self.requesters.len())
            .field("resolvers", &self.resolvers)
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// REQUEST MANAGER TRAIT
// ============================================================================

impl RequestManager for StandardRequestManager {
    fn type_registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn create_request(
        &mut self,
        requester: Token,
        payload: Box<dyn Requestable>,
    ) -> QuartermasterResult<Token> {
        if self.requester_handle(requester).is_none() {
            return Err(RequestError::UnknownRequester { requester }.into());
        }

        let token: Token = self.registry.new_instance(TOKEN_TAG, (), &[])?;
        let payload_tag = payload.type_tag();
        let request: Request = self.registry.new_instance(
            REQUEST_TAG,
            RequestSeed {
                token,
                requester,
                payload,
            },
            &[],
        )?;
        self.requests.insert(token, request);

        if self.config.debug_logging {
            tracing::debug!(
                request = %token,
                requester = %requester,
                payload = %payload_tag,
                "Request created"
            );
        }
        Ok(token)
    }

    fn create_and_assign_request(
        &mut self,
        requester: Token,
        payload: Box<dyn Requestable>,
    ) -> QuartermasterResult<Token> {
        let token = self.create_request(requester, payload)?;
        self.run_resolution(token, &[]);
        Ok(token)
    }

    fn get_request(&self, token: Token) -> QuartermasterResult<&Request> {
        self.requests
            .get(&token)
            .ok_or_else(|| RequestError::NotFound { token }.into())
    }

    fn update_request_state(
        &mut self,
        token: Token,
        state: RequestState,
    ) -> QuartermasterResult<()> {
        let from = self.state_of(token).ok_or(RequestError::NotFound { token })?;
        if !state.is_externally_drivable() || !from.can_transition_to(state) {
            return Err(RequestError::IllegalStateTransition {
                token,
                from,
                to: state,
            }
            .into());
        }

        if self.config.debug_logging {
            tracing::debug!(request = %token, from = %from, to = %state, "Request state update");
        }

        match state {
            RequestState::InProgress => {
                if let Some(request) = self.requests.get_mut(&token) {
                    request.set_state(RequestState::InProgress);
                }
            }
            RequestState::Completed => self.complete_request(token),
            RequestState::Received => self.receive_request(token),
            RequestState::Cancelled => self.cancel_request(token, true),
            RequestState::Overruled => self.overrule_request(token),
            // Entered only by the resolution algorithm, rejected above.
            RequestState::Created | RequestState::Reported | RequestState::Assigned => {}
        }
        Ok(())
    }

    fn resolve_request(&mut self, token: Token) -> QuartermasterResult<()> {
        let state = self.state_of(token).ok_or(RequestError::NotFound { token })?;
        if state == RequestState::Created {
            self.run_resolution(token, &[]);
        }
        Ok(())
    }

    fn reassign_request(
        &mut self,
        token: Token,
        blacklist: &[Token],
    ) -> QuartermasterResult<Option<Token>> {
        let state = self.state_of(token).ok_or(RequestError::NotFound { token })?;
        if state.has_resolver() {
            self.detach_resolver(token, None);
        }
        Ok(self.run_resolution(token, blacklist))
    }

    fn resolver_for_request(&self, token: Token) -> Option<Token> {
        self.requests.get(&token).and_then(Request::resolver)
    }

    fn requests_for_requester(&self, requester: Token) -> Vec<Token> {
        self.requests
            .values()
            .filter(|request| request.requester() == requester)
            .map(Request::token)
            .collect()
    }
}
