//! The request entity and its persistence factory

use crate::document::{compound, Document, DocumentExt};
use crate::registry::{Factory, RegistryResult, TypeRegistry, TypeTag};
use crate::{RegistryError, RequestState, Requestable, Tagged, Timestamp, Token};
use chrono::Utc;
use serde_json::Value;
use std::any::Any;
use std::fmt;

/// Tag of [`Request`] in the standard registry.
pub const REQUEST_TAG: TypeTag = TypeTag::new("quartermaster:request");

/// A need declared by a requester, owned by the request manager.
///
/// Relations to other entities are tokens only. The requester, the parent,
/// the children and the assigned resolver are all looked up through the
/// manager's maps.
pub struct Request {
    token: Token,
    requester: Token,
    payload: Box<dyn Requestable>,
    state: RequestState,
    parent: Option<Token>,
    children: Vec<Token>,
    resolver: Option<Token>,
    created_at: Timestamp,
}

impl Request {
    pub fn new(token: Token, requester: Token, payload: Box<dyn Requestable>) -> Self {
        Self {
            token,
            requester,
            payload,
            state: RequestState::Created,
            parent: None,
            children: Vec::new(),
            resolver: None,
            created_at: Utc::now(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn requester(&self) -> Token {
        self.requester
    }

    pub fn payload(&self) -> &dyn Requestable {
        self.payload.as_ref()
    }

    /// The payload as a concrete type, if it is one.
    pub fn payload_as<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    pub fn payload_tag(&self) -> TypeTag {
        self.payload.type_tag()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn parent(&self) -> Option<Token> {
        self.parent
    }

    pub fn children(&self) -> &[Token] {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// The resolver currently bound to this request.
    pub fn resolver(&self) -> Option<Token> {
        self.resolver
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    // The mutators below are driven by the request manager. Resolvers only
    // ever see `&Request`.

    pub fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    pub fn set_parent(&mut self, parent: Option<Token>) {
        self.parent = parent;
    }

    pub fn set_resolver(&mut self, resolver: Option<Token>) {
        self.resolver = resolver;
    }

    pub fn set_requester(&mut self, requester: Token) {
        self.requester = requester;
    }

    /// Append a child edge. Duplicates are ignored.
    pub fn add_child(&mut self, child: Token) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Drop a child edge. Returns whether it was present.
    pub fn remove_child(&mut self, child: Token) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        self.children.len() != before
    }

    pub fn clear_children(&mut self) -> Vec<Token> {
        std::mem::take(&mut self.children)
    }
}

impl Clone for Request {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            requester: self.requester,
            payload: self.payload.clone_boxed(),
            state: self.state,
            parent: self.parent,
            children: self.children.clone(),
            resolver: self.resolver,
            created_at: self.created_at,
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
            && self.requester == other.requester
            && self.state == other.state
            && self.parent == other.parent
            && self.children == other.children
            && self.resolver == other.resolver
            && self.created_at == other.created_at
            && self.payload.eq_dyn(other.payload.as_ref())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("token", &self.token)
            .field("requester", &self.requester)
            .field("payload", &self.payload)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl Tagged for Request {
    fn type_tag(&self) -> TypeTag {
        REQUEST_TAG
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Everything needed to construct a fresh request.
#[derive(Debug)]
pub struct RequestSeed {
    pub token: Token,
    pub requester: Token,
    pub payload: Box<dyn Requestable>,
}

/// Builds and persists [`Request`]s. Nested tokens and the payload are
/// encoded through the registry so they carry their own tags.
pub struct RequestFactory;

const FIELD_TOKEN: &str = "token";
const FIELD_REQUESTER: &str = "requester";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_STATE: &str = "state";
const FIELD_PARENT: &str = "parent";
const FIELD_CHILDREN: &str = "children";
const FIELD_RESOLVER: &str = "resolver";
const FIELD_CREATED_AT: &str = "created_at";

impl Factory for RequestFactory {
    type Input = RequestSeed;
    type Output = Request;

    fn tag(&self) -> TypeTag {
        REQUEST_TAG
    }

    fn new_instance(
        &self,
        _registry: &TypeRegistry,
        input: RequestSeed,
        context: &[&dyn Any],
    ) -> RegistryResult<Request> {
        let mut request = Request::new(input.token, input.requester, input.payload);
        // An optional parent token may be supplied through the context.
        if let Some(parent) = context.iter().find_map(|c| c.downcast_ref::<Token>()) {
            request.set_parent(Some(*parent));
        }
        Ok(request)
    }

    fn serialize(&self, registry: &TypeRegistry, request: &Request) -> RegistryResult<Document> {
        let mut doc = compound();
        doc.put(FIELD_TOKEN, registry.serialize(&request.token)?);
        doc.put(FIELD_REQUESTER, registry.serialize(&request.requester)?);
        doc.put(
            FIELD_PAYLOAD,
            registry.serialize_dyn(request.payload.type_tag(), request.payload.as_any())?,
        );
        doc.put(FIELD_STATE, request.state.as_db_str());
        if let Some(parent) = &request.parent {
            doc.put(FIELD_PARENT, registry.serialize(parent)?);
        }
        let children = request
            .children
            .iter()
            .map(|child| registry.serialize(child))
            .collect::<RegistryResult<Vec<_>>>()?;
        doc.put(FIELD_CHILDREN, children);
        if let Some(resolver) = &request.resolver {
            doc.put(FIELD_RESOLVER, registry.serialize(resolver)?);
        }
        doc.put(FIELD_CREATED_AT, request.created_at.to_rfc3339());
        Ok(doc)
    }

    fn deserialize(&self, registry: &TypeRegistry, doc: &Document) -> RegistryResult<Request> {
        let token: Token = registry.deserialize(doc.field(FIELD_TOKEN)?)?;
        let requester: Token = registry.deserialize(doc.field(FIELD_REQUESTER)?)?;
        let payload: Box<dyn Requestable> = registry.deserialize_as(doc.field(FIELD_PAYLOAD)?)?;

        let state_str = doc.get_str(FIELD_STATE)?;
        let state = RequestState::from_db_str(state_str).map_err(|e| {
            RegistryError::MalformedDocument {
                field: FIELD_STATE.to_string(),
                reason: e.to_string(),
            }
        })?;

        let parent = doc
            .opt_field(FIELD_PARENT)
            .map(|p| registry.deserialize::<Token>(p))
            .transpose()?;
        let resolver = doc
            .opt_field(FIELD_RESOLVER)
            .map(|r| registry.deserialize::<Token>(r))
            .transpose()?;
        let children = doc
            .get_list(FIELD_CHILDREN)?
            .iter()
            .map(|child| registry.deserialize::<Token>(child))
            .collect::<RegistryResult<Vec<_>>>()?;

        let created_at = match doc.opt_field(FIELD_CREATED_AT) {
            Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| RegistryError::MalformedDocument {
                    field: FIELD_CREATED_AT.to_string(),
                    reason: e.to_string(),
                })?,
            Some(_) => {
                return Err(RegistryError::MalformedDocument {
                    field: FIELD_CREATED_AT.to_string(),
                    reason: "expected timestamp string".to_string(),
                })
            }
            None => Utc::now(),
        };

        Ok(Request {
            token,
            requester,
            payload,
            state,
            parent,
            children,
            resolver,
            created_at,
        })
    }
}
