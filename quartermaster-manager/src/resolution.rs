//! Resolution passes: candidate arbitration, child linking and retries
//!
//! A pass walks the candidates for a `Created` request in priority order:
//!
//! 1. `attempt_resolve` fails: log the fault, try the next candidate.
//! 2. It returns no prerequisites: the request becomes `Assigned` and
//!    `resolve` is called right away.
//! 3. It returns prerequisites: they are linked as children, the request
//!    becomes `Reported`, and children still in `Created` get their own pass.
//!    Once every child is terminal, the same resolver's `resolve` is called.
//! 4. Nobody accepts: the request stays `Created` until a later pass.

use crate::StandardRequestManager;
use quartermaster_core::{Request, RequestError, RequestState, Token};
use quartermaster_resolvers::Resolver;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Holds one level of resolution nesting until dropped, unwinding included.
struct DepthGuard(Arc<AtomicU32>);

impl DepthGuard {
    fn enter(depth: &Arc<AtomicU32>) -> Self {
        depth.fetch_add(1, Ordering::Relaxed);
        Self(depth.clone())
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl StandardRequestManager {
    /// Run one resolution pass for `token`, skipping blacklisted resolvers.
    ///
    /// Returns the resolver now bound to the request, if any.
    pub(crate) fn run_resolution(&mut self, token: Token, blacklist: &[Token]) -> Option<Token> {
        let depth = self.resolution_depth.load(Ordering::Relaxed);
        if depth >= self.config.max_resolution_depth {
            tracing::warn!(
                request = %token,
                depth,
                "Resolution nested too deep, deferring pass"
            );
            return None;
        }

        let _guard = DepthGuard::enter(&self.resolution_depth);
        self.try_candidates(token, blacklist)
    }

    fn try_candidates(&mut self, token: Token, blacklist: &[Token]) -> Option<Token> {
        let request = self.requests.get(&token)?.clone();
        if request.state() != RequestState::Created {
            return request.resolver();
        }

        let candidates = self.resolvers.candidates_for(&*self, &request, blacklist);
        for resolver in candidates {
            let snapshot = match self.requests.get(&token) {
                Some(current) if current.state() == RequestState::Created => current.clone(),
                Some(current) => return current.resolver(),
                None => return None,
            };
            let resolver_token = resolver.token();

            let children = match resolver.attempt_resolve(self, &snapshot) {
                Ok(children) => children,
                Err(fault) => {
                    tracing::warn!(
                        request = %token,
                        resolver = %resolver_token,
                        error = %fault,
                        "Resolver fault during attempt, trying next candidate"
                    );
                    continue;
                }
            };

            // The attempt may have re-entered the manager and settled the request.
            match self.state_of(token) {
                Some(RequestState::Created) => {}
                Some(_) => return self.requests.get(&token).and_then(Request::resolver),
                None => return None,
            }

            match self.accept(token, &resolver, children) {
                Ok(true) => return Some(resolver_token),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        request = %token,
                        resolver = %resolver_token,
                        error = %err,
                        "Rejected prerequisites, trying next candidate"
                    );
                }
            }
        }

        tracing::debug!(
            request = %token,
            payload = %request.payload_tag(),
            "No resolver accepted request, leaving it unresolved"
        );
        None
    }

    /// Bind `resolver` to the request with the prerequisites it reported.
    ///
    /// `Ok(false)` means `resolve` faulted and the request went back to
    /// `Created`.
    fn accept(
        &mut self,
        token: Token,
        resolver: &Arc<dyn Resolver>,
        children: Vec<Token>,
    ) -> Result<bool, RequestError> {
        let mut live: Vec<Token> = Vec::with_capacity(children.len());
        for child in children {
            // Children that already finished count as satisfied.
            if self.requests.contains_key(&child) && !live.contains(&child) {
                live.push(child);
            }
        }

        if live.is_empty() {
            return Ok(self.assign_and_resolve(token, resolver));
        }

        if let Err(err) = self.check_links(token, &live) {
            self.discard_fresh_children(token, resolver.token(), &live);
            return Err(err);
        }

        for child in &live {
            if let Some(request) = self.requests.get_mut(child) {
                request.set_parent(Some(token));
            }
        }
        if let Some(request) = self.requests.get_mut(&token) {
            for child in &live {
                request.add_child(*child);
            }
            request.set_state(RequestState::Reported);
            request.set_resolver(Some(resolver.token()));
        }

        if self.config.debug_logging {
            tracing::debug!(
                request = %token,
                resolver = %resolver.token(),
                children = live.len(),
                "Request reported with prerequisites"
            );
        }

        for child in live {
            if self.state_of(child) == Some(RequestState::Created) {
                self.run_resolution(child, &[]);
            }
        }
        Ok(true)
    }

    /// Mark the request `Assigned` to `resolver` and call `resolve`.
    ///
    /// Returns false if `resolve` faulted while the request was still bound to
    /// this resolver; the request is then back in `Created`.
    pub(crate) fn assign_and_resolve(&mut self, token: Token, resolver: &Arc<dyn Resolver>) -> bool {
        let resolver_token = resolver.token();
        let snapshot = {
            let Some(request) = self.requests.get_mut(&token) else {
                return true;
            };
            request.set_state(RequestState::Assigned);
            request.set_resolver(Some(resolver_token));
            request.clone()
        };

        if self.config.debug_logging {
            tracing::debug!(request = %token, resolver = %resolver_token, "Request assigned");
        }

        let Err(fault) = resolver.resolve(self, &snapshot) else {
            return true;
        };
        tracing::warn!(
            request = %token,
            resolver = %resolver_token,
            error = %fault,
            "Resolver fault during resolve, trying next candidate"
        );

        match self.requests.get_mut(&token) {
            Some(request)
                if request.resolver() == Some(resolver_token)
                    && matches!(
                        request.state(),
                        RequestState::Assigned | RequestState::InProgress
                    ) =>
            {
                request.set_resolver(None);
                request.set_state(RequestState::Created);
                false
            }
            _ => true,
        }
    }

    /// A child of `parent` reached a terminal state.
    ///
    /// When the last child is gone, the resolver that reported the parent is
    /// asked to `resolve` it. If that resolver no longer exists, the parent is
    /// overruled.
    pub(crate) fn on_child_terminal(&mut self, parent: Token, child: Token) {
        let Some(request) = self.requests.get_mut(&parent) else {
            return;
        };
        request.remove_child(child);
        self.retry_if_ready(parent);
    }

    pub(crate) fn retry_if_ready(&mut self, parent: Token) {
        let Some(request) = self.requests.get(&parent) else {
            return;
        };
        if request.has_children() || request.state() != RequestState::Reported {
            return;
        }

        match request.resolver().and_then(|rt| self.resolvers.get(rt)) {
            Some(resolver) => {
                if !self.assign_and_resolve(parent, &resolver) {
                    self.run_resolution(parent, &[resolver.token()]);
                }
            }
            None => self.overrule_for_removal(parent, None),
        }
    }

    /// Reject links that would close a cycle or re-parent a request.
    fn check_links(&self, parent: Token, children: &[Token]) -> Result<(), RequestError> {
        for &child in children {
            let already_parented = self
                .requests
                .get(&child)
                .is_some_and(|request| request.parent().is_some());
            if child == parent || already_parented || self.is_ancestor(child, parent) {
                return Err(RequestError::CycleDetected { parent, child });
            }
        }
        Ok(())
    }

    /// Whether `candidate` appears on the parent chain of `of`.
    pub(crate) fn is_ancestor(&self, candidate: Token, of: Token) -> bool {
        let mut cursor = self.requests.get(&of).and_then(Request::parent);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == candidate {
                return true;
            }
            steps += 1;
            if steps > self.requests.len() {
                return false;
            }
            cursor = self.requests.get(&current).and_then(Request::parent);
        }
        false
    }

    /// Cancel the unlinked requests a rejected resolver spawned during its attempt.
    fn discard_fresh_children(&mut self, parent: Token, resolver: Token, children: &[Token]) {
        let fresh: Vec<Token> = children
            .iter()
            .copied()
            .filter(|child| *child != parent && !self.is_ancestor(*child, parent))
            .filter(|child| {
                self.requests.get(child).is_some_and(|request| {
                    request.requester() == resolver && request.parent().is_none()
                })
            })
            .collect();
        for child in fresh {
            self.cancel_request(child, false);
        }
    }

    /// Retry every request still in `Created`. Returns how many left it.
    pub fn resolve_pending(&mut self) -> usize {
        let pending: Vec<Token> = self
            .requests
            .values()
            .filter(|request| request.state() == RequestState::Created)
            .map(Request::token)
            .collect();

        let mut resolved = 0;
        for token in pending {
            if self.state_of(token) != Some(RequestState::Created) {
                continue;
            }
            self.run_resolution(token, &[]);
            if self.state_of(token) != Some(RequestState::Created) {
                resolved += 1;
            }
        }
        resolved
    }
}
