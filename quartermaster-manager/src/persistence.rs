//! Persistence bridge: the manager as one structured document
//!
//! Layout:
//!
//! ```text
//! {
//!   "version": 1,
//!   "requesters": [ <tagged requester>, ... ],
//!   "providers": [
//!     { "token": <token>, "resolvers": [ { "token": <token>, "request_type": "<tag>" }, ... ] },
//!     ...
//!   ],
//!   "persistent_resolvers": [ { "provider": <token>, "resolver": <tagged resolver> }, ... ],
//!   "requests": [ <tagged request>, ... ]
//! }
//! ```
//!
//! Every nested value goes through the type registry, so each carries its own
//! tag. Requesters whose type has no factory are skipped on save; the host
//! registers them again before loading. Providers must also be re-added
//! before [`StandardRequestManager::deserialize`] runs. A provider rebuilt
//! under its old token may hand out fresh resolver instances; requests bound
//! to a vanished resolver are rebound to that provider's resolver of the same
//! request type.

use crate::StandardRequestManager;
use quartermaster_core::{
    compound, Document, DocumentExt, QuartermasterResult, RegistryError, RegistryResult, Request,
    RequestError, RequestState, Tagged, Token,
};
use quartermaster_resolvers::{Requester, Resolver};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Current document layout version.
pub const DOCUMENT_VERSION: i64 = 1;

const FIELD_VERSION: &str = "version";
const FIELD_REQUESTERS: &str = "requesters";
const FIELD_PROVIDERS: &str = "providers";
const FIELD_PERSISTENT_RESOLVERS: &str = "persistent_resolvers";
const FIELD_REQUESTS: &str = "requests";
const FIELD_TOKEN: &str = "token";
const FIELD_RESOLVERS: &str = "resolvers";
const FIELD_PROVIDER: &str = "provider";
const FIELD_RESOLVER: &str = "resolver";
const FIELD_REQUEST_TYPE: &str = "request_type";

/// A resolver as it was listed under its provider when saved.
struct RecordedResolver {
    token: Token,
    request_type: String,
}

struct RecordedProvider {
    token: Token,
    resolvers: Vec<RecordedResolver>,
}

impl StandardRequestManager {
    /// Write requesters, providers, persistent resolvers and every live
    /// request into one document.
    pub fn serialize(&self) -> QuartermasterResult<Document> {
        let registry = &self.registry;

        let mut requesters = Vec::new();
        for (token, requester) in &self.requesters {
            let tag = requester.type_tag();
            if !registry.is_registered(tag.as_str()) {
                tracing::debug!(
                    requester = %token,
                    tag = %tag,
                    "Requester type has no factory, not persisted"
                );
                continue;
            }
            requesters.push(registry.serialize_dyn(tag, requester.as_any())?);
        }

        let providers = self
            .resolvers
            .providers()
            .into_iter()
            .map(|provider| -> RegistryResult<Document> {
                let resolvers = self
                    .resolvers
                    .resolvers_of(provider)
                    .into_iter()
                    .filter_map(|token| self.resolvers.get(token))
                    .map(|resolver| -> RegistryResult<Document> {
                        let mut entry = compound();
                        entry.put(FIELD_TOKEN, registry.serialize(&resolver.token())?);
                        entry.put(FIELD_REQUEST_TYPE, resolver.request_type().as_str());
                        Ok(entry)
                    })
                    .collect::<RegistryResult<Vec<_>>>()?;
                let mut entry = compound();
                entry.put(FIELD_TOKEN, registry.serialize(&provider)?);
                entry.put(FIELD_RESOLVERS, resolvers);
                Ok(entry)
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        let persistent = self
            .resolvers
            .persistent()
            .into_iter()
            .map(|(provider, resolver)| -> RegistryResult<Document> {
                let mut entry = compound();
                entry.put(FIELD_PROVIDER, registry.serialize(&provider)?);
                entry.put(
                    FIELD_RESOLVER,
                    registry.serialize_dyn(resolver.type_tag(), resolver.as_any())?,
                );
                Ok(entry)
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        let requests = self
            .requests
            .values()
            .map(|request| registry.serialize(request))
            .collect::<RegistryResult<Vec<_>>>()?;

        let mut doc = compound();
        doc.put(FIELD_VERSION, DOCUMENT_VERSION);
        doc.put(FIELD_REQUESTERS, requesters);
        doc.put(FIELD_PROVIDERS, providers);
        doc.put(FIELD_PERSISTENT_RESOLVERS, persistent);
        doc.put(FIELD_REQUESTS, requests);
        Ok(doc)
    }

    /// Restore the state written by [`StandardRequestManager::serialize`].
    ///
    /// Only a manager without live requests can load. The whole document is
    /// decoded before anything is applied, so a rejected or malformed
    /// document leaves the manager untouched.
    ///
    /// Loaded requests keep their states and resolvers. A request whose
    /// resolver is missing is rebound to the resolver of the same request
    /// type under the recorded provider; only when there is none is it
    /// overruled and re-resolved.
    pub fn deserialize(&mut self, doc: &Document) -> QuartermasterResult<()> {
        if !self.requests.is_empty() {
            return Err(RequestError::LoadIntoLiveManager {
                live: self.requests.len(),
            }
            .into());
        }

        let version = doc.get_i64(FIELD_VERSION)?;
        if version > DOCUMENT_VERSION {
            return Err(RegistryError::MalformedDocument {
                field: FIELD_VERSION.to_string(),
                reason: format!("unsupported document version {}", version),
            }
            .into());
        }

        let registry = self.registry.clone();

        let requesters = doc
            .get_list(FIELD_REQUESTERS)?
            .iter()
            .map(|entry| registry.deserialize_as::<dyn Requester>(entry))
            .collect::<RegistryResult<Vec<_>>>()?;

        let recorded_providers = doc
            .get_list(FIELD_PROVIDERS)?
            .iter()
            .map(|entry| -> RegistryResult<RecordedProvider> {
                let resolvers = entry
                    .get_list(FIELD_RESOLVERS)?
                    .iter()
                    .map(|resolver| -> RegistryResult<RecordedResolver> {
                        Ok(RecordedResolver {
                            token: registry.deserialize(resolver.field(FIELD_TOKEN)?)?,
                            request_type: resolver.get_str(FIELD_REQUEST_TYPE)?.to_string(),
                        })
                    })
                    .collect::<RegistryResult<Vec<_>>>()?;
                Ok(RecordedProvider {
                    token: registry.deserialize(entry.field(FIELD_TOKEN)?)?,
                    resolvers,
                })
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        let persistent = doc
            .get_list(FIELD_PERSISTENT_RESOLVERS)?
            .iter()
            .map(|entry| -> RegistryResult<(Token, Box<dyn Resolver>)> {
                let provider: Token = registry.deserialize(entry.field(FIELD_PROVIDER)?)?;
                let resolver = registry.deserialize_as::<dyn Resolver>(entry.field(FIELD_RESOLVER)?)?;
                Ok((provider, resolver))
            })
            .collect::<RegistryResult<Vec<_>>>()?;

        let requests = doc
            .get_list(FIELD_REQUESTS)?
            .iter()
            .map(|entry| registry.deserialize::<Request>(entry))
            .collect::<RegistryResult<Vec<_>>>()?;

        // Live requester objects registered by the host win over loaded copies.
        for requester in requesters {
            let requester: Arc<dyn Requester> = Arc::from(requester);
            self.requesters
                .entry(requester.requester_id())
                .or_insert(requester);
        }

        for (provider, resolver) in persistent {
            if self.resolvers.contains(resolver.token()) {
                continue;
            }
            self.resolvers.add_resolver(provider, Arc::from(resolver))?;
        }

        let targets = self.rebind_targets(&recorded_providers);

        self.requests = requests
            .into_iter()
            .map(|request| (request.token(), request))
            .collect();
        self.rebind(&targets);
        self.drop_dangling_edges();

        let stale: Vec<Token> = self
            .requests
            .values()
            .filter(|request| {
                request.state() == RequestState::Overruled
                    || (request.state().has_resolver()
                        && !request
                            .resolver()
                            .is_some_and(|resolver| self.resolvers.contains(resolver)))
            })
            .map(Request::token)
            .collect();
        for token in stale {
            if self.requests.contains_key(&token) {
                self.overrule_for_removal(token, None);
            }
        }

        tracing::info!(
            requests = self.requests.len(),
            requesters = self.requesters.len(),
            resolvers = self.resolvers.len(),
            "Request manager state loaded"
        );
        Ok(())
    }

    /// Map each recorded resolver that no longer exists to the live resolver
    /// of its provider accepting the same request type.
    ///
    /// Among several resolvers of one type, the n-th recorded maps to the n-th
    /// live one, falling back to the first.
    fn rebind_targets(&self, recorded: &[RecordedProvider]) -> BTreeMap<Token, Token> {
        let mut targets = BTreeMap::new();
        for provider in recorded {
            if !self.resolvers.has_provider(provider.token) {
                tracing::warn!(
                    provider = %provider.token,
                    "Provider recorded in document is not registered"
                );
                continue;
            }

            let live = self.resolvers.resolvers_of(provider.token);
            let mut ordinals: HashMap<&str, usize> = HashMap::new();
            for resolver in &provider.resolvers {
                let ordinal = ordinals.entry(resolver.request_type.as_str()).or_insert(0);
                let nth = *ordinal;
                *ordinal += 1;
                if self.resolvers.contains(resolver.token) {
                    continue;
                }

                let same_type: Vec<Token> = live
                    .iter()
                    .copied()
                    .filter(|token| {
                        self.resolvers.get(*token).is_some_and(|candidate| {
                            candidate.request_type().as_str() == resolver.request_type
                        })
                    })
                    .collect();
                if let Some(target) = same_type.get(nth).or_else(|| same_type.first()) {
                    targets.insert(resolver.token, *target);
                }
            }
        }
        targets
    }

    /// Point requests bound to, or raised by, a replaced resolver at its
    /// replacement. States are left as loaded.
    fn rebind(&mut self, targets: &BTreeMap<Token, Token>) {
        if targets.is_empty() {
            return;
        }
        for request in self.requests.values_mut() {
            if let Some(target) = request.resolver().and_then(|old| targets.get(&old)) {
                tracing::debug!(
                    request = %request.token(),
                    resolver = %target,
                    "Rebinding request to replacement resolver"
                );
                request.set_resolver(Some(*target));
            }
            if let Some(target) = targets.get(&request.requester()) {
                request.set_requester(*target);
            }
        }
    }

    /// Drop parent and child edges pointing at requests absent from the
    /// document, then retry parents left waiting on nothing.
    fn drop_dangling_edges(&mut self) {
        let live: BTreeSet<Token> = self.requests.keys().copied().collect();
        let mut waiting = Vec::new();

        for request in self.requests.values_mut() {
            let dangling: Vec<Token> = request
                .children()
                .iter()
                .copied()
                .filter(|child| !live.contains(child))
                .collect();
            for child in &dangling {
                request.remove_child(*child);
            }
            if request.parent().is_some_and(|parent| !live.contains(&parent)) {
                tracing::warn!(request = %request.token(), "Dropping dangling parent edge");
                request.set_parent(None);
            }
            if !dangling.is_empty() {
                tracing::warn!(
                    request = %request.token(),
                    dropped = dangling.len(),
                    "Dropping dangling child edges"
                );
                waiting.push(request.token());
            }
        }

        for token in waiting {
            self.retry_if_ready(token);
        }
    }
}
