//! Type registry: tagged factories for polymorphic persistence.
//!
//! Every persistable type carries a static [`TypeTag`]. The registry maps
//! tags to factories that construct, serialize and deserialize instances.
//! Serialized values are wrapped in an envelope that records the tag first,
//! so loading can dispatch without static type information at the call site:
//!
//! ```text
//! { "type": "quartermaster:token", "data": "01890a5d-ac96-774b-bcce-b302099a8057" }
//! ```
//!
//! Trait-object families (requestables, requesters, resolvers) are loaded
//! through upcasts registered next to the concrete factory, see
//! [`TypeRegistry::register_upcast`] and [`TypeRegistry::deserialize_as`].
//!
//! A process-wide instance is available through [`global`]. It is meant to be
//! populated once during startup; [`reset_global`] exists for test isolation.

use crate::document::{Document, DocumentExt};
use crate::{RegistryError, Requestable, Token};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::any::{type_name, Any, TypeId};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Envelope field holding the type tag.
pub const TYPE_FIELD: &str = "type";
/// Envelope field holding the factory-encoded payload.
pub const DATA_FIELD: &str = "data";

/// Tag of [`Token`] in the standard registry.
pub const TOKEN_TAG: TypeTag = TypeTag::new("quartermaster:token");

static NULL_DATA: Value = Value::Null;

// ============================================================================
// TYPE TAGS
// ============================================================================

/// Stable name of a persistable concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(&'static str);

impl TypeTag {
    pub const fn new(name: &'static str) -> Self {
        TypeTag(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Borrow<str> for TypeTag {
    fn borrow(&self) -> &str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Runtime type descriptor of a value.
pub trait Tagged {
    fn type_tag(&self) -> TypeTag;
}

impl<T: Tagged + ?Sized> Tagged for Box<T> {
    fn type_tag(&self) -> TypeTag {
        (**self).type_tag()
    }
}

impl<T: Tagged + ?Sized> Tagged for Arc<T> {
    fn type_tag(&self) -> TypeTag {
        (**self).type_tag()
    }
}

impl Tagged for Token {
    fn type_tag(&self) -> TypeTag {
        TOKEN_TAG
    }
}

// ============================================================================
// FACTORY TRAIT
// ============================================================================

/// Constructs, serializes and deserializes one concrete type.
///
/// `serialize` produces only the payload; the registry adds the envelope.
/// Factories receive the registry so nested values can be encoded through it.
pub trait Factory: Send + Sync + 'static {
    /// Input accepted by [`Factory::new_instance`].
    type Input: 'static;
    /// The concrete type this factory produces.
    type Output: 'static;

    fn tag(&self) -> TypeTag;

    fn new_instance(
        &self,
        registry: &TypeRegistry,
        input: Self::Input,
        context: &[&dyn Any],
    ) -> RegistryResult<Self::Output>;

    fn serialize(&self, registry: &TypeRegistry, value: &Self::Output) -> RegistryResult<Document>;

    fn deserialize(&self, registry: &TypeRegistry, data: &Document)
        -> RegistryResult<Self::Output>;
}

trait ErasedFactory: Send + Sync {
    fn tag(&self) -> TypeTag;
    fn output_type(&self) -> TypeId;
    fn output_type_name(&self) -> &'static str;
    fn new_instance_any(
        &self,
        registry: &TypeRegistry,
        input: Box<dyn Any>,
        context: &[&dyn Any],
    ) -> RegistryResult<Box<dyn Any>>;
    fn serialize_any(&self, registry: &TypeRegistry, value: &dyn Any) -> RegistryResult<Document>;
    fn deserialize_any(&self, registry: &TypeRegistry, data: &Document)
        -> RegistryResult<Box<dyn Any>>;
}

struct FactoryAdapter<F>(F);

impl<F: Factory> ErasedFactory for FactoryAdapter<F> {
    fn tag(&self) -> TypeTag {
        self.0.tag()
    }

    fn output_type(&self) -> TypeId {
        TypeId::of::<F::Output>()
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<F::Output>()
    }

    fn new_instance_any(
        &self,
        registry: &TypeRegistry,
        input: Box<dyn Any>,
        context: &[&dyn Any],
    ) -> RegistryResult<Box<dyn Any>> {
        let input = input
            .downcast::<F::Input>()
            .map_err(|_| RegistryError::InvalidFactoryInput {
                tag: self.0.tag(),
                expected: type_name::<F::Input>(),
            })?;
        let output = self.0.new_instance(registry, *input, context)?;
        Ok(Box::new(output))
    }

    fn serialize_any(&self, registry: &TypeRegistry, value: &dyn Any) -> RegistryResult<Document> {
        let value = value
            .downcast_ref::<F::Output>()
            .ok_or_else(|| RegistryError::TypeMismatch {
                tag: self.0.tag().to_string(),
                expected: type_name::<F::Output>(),
            })?;
        self.0.serialize(registry, value)
    }

    fn deserialize_any(
        &self,
        registry: &TypeRegistry,
        data: &Document,
    ) -> RegistryResult<Box<dyn Any>> {
        let output = self.0.deserialize(registry, data)?;
        Ok(Box::new(output))
    }
}

type Upcast = Box<dyn Fn(Box<dyn Any>) -> Option<Box<dyn Any>> + Send + Sync>;

// ============================================================================
// TYPE REGISTRY
// ============================================================================

/// Registry of tagged factories.
///
/// # Example
/// ```ignore
/// let mut registry = TypeRegistry::standard();
/// registry.register_requestable::<Planks>(PLANKS_TAG)?;
///
/// let document = registry.serialize_dyn(planks.type_tag(), planks.as_any())?;
/// let loaded: Box<dyn Requestable> = registry.deserialize_as(&document)?;
/// ```
pub struct TypeRegistry {
    factories: HashMap<TypeTag, Arc<dyn ErasedFactory>>,
    tags_by_type: HashMap<TypeId, TypeTag>,
    upcasts: HashMap<(TypeId, TypeId), Upcast>,
}

impl TypeRegistry {
    /// Create an empty registry with no factories bound.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            tags_by_type: HashMap::new(),
            upcasts: HashMap::new(),
        }
    }

    /// Create a registry with the factories the request system itself needs
    /// (tokens and requests).
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            TOKEN_TAG,
            Arc::new(FactoryAdapter(TokenFactory)) as Arc<dyn ErasedFactory>,
        );
        registry
            .tags_by_type
            .insert(TypeId::of::<Token>(), TOKEN_TAG);
        registry.factories.insert(
            crate::request::REQUEST_TAG,
            Arc::new(FactoryAdapter(crate::request::RequestFactory)) as Arc<dyn ErasedFactory>,
        );
        registry
            .tags_by_type
            .insert(TypeId::of::<crate::Request>(), crate::request::REQUEST_TAG);
        registry
    }

    /// Bind a factory to its tag.
    ///
    /// # Errors
    /// `DuplicateRegistration` if the tag or the output type already has a factory.
    pub fn register<F: Factory>(&mut self, factory: F) -> RegistryResult<()> {
        let tag = factory.tag();
        let output = TypeId::of::<F::Output>();
        if self.factories.contains_key(&tag) {
            return Err(RegistryError::DuplicateRegistration { tag });
        }
        if let Some(existing) = self.tags_by_type.get(&output) {
            return Err(RegistryError::DuplicateRegistration { tag: *existing });
        }
        self.factories.insert(tag, Arc::new(FactoryAdapter(factory)));
        self.tags_by_type.insert(output, tag);
        Ok(())
    }

    /// Register a conversion from concrete type `T` into the trait-object
    /// family `D`, used by [`TypeRegistry::deserialize_as`].
    pub fn register_upcast<T: 'static, D: ?Sized + 'static>(&mut self, upcast: fn(T) -> Box<D>) {
        let convert: Upcast = Box::new(move |value: Box<dyn Any>| {
            value
                .downcast::<T>()
                .ok()
                .map(|concrete| Box::new(upcast(*concrete)) as Box<dyn Any>)
        });
        self.upcasts
            .insert((TypeId::of::<T>(), TypeId::of::<Box<D>>()), convert);
    }

    /// Register a serde-backed requestable payload type and its upcast.
    pub fn register_requestable<T>(&mut self, tag: TypeTag) -> RegistryResult<()>
    where
        T: Requestable + Serialize + DeserializeOwned,
    {
        self.register(SerdeFactory::<T>::new(tag))?;
        self.register_upcast::<T, dyn Requestable>(|value| Box::new(value));
        Ok(())
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Tag bound to the concrete type `T`, if any.
    pub fn tag_of<T: 'static>(&self) -> Option<TypeTag> {
        self.tags_by_type.get(&TypeId::of::<T>()).copied()
    }

    /// All bound tags, sorted.
    pub fn tags(&self) -> Vec<TypeTag> {
        let mut tags: Vec<TypeTag> = self.factories.keys().copied().collect();
        tags.sort();
        tags
    }

    fn factory(&self, tag: &str) -> RegistryResult<&Arc<dyn ErasedFactory>> {
        self.factories
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownType {
                tag: tag.to_string(),
            })
    }

    /// Construct a new instance through the factory bound to `tag`.
    pub fn new_instance<I: 'static, O: 'static>(
        &self,
        tag: TypeTag,
        input: I,
        context: &[&dyn Any],
    ) -> RegistryResult<O> {
        let factory = self.factory(tag.as_str())?;
        let output = factory.new_instance_any(self, Box::new(input), context)?;
        output
            .downcast::<O>()
            .map(|value| *value)
            .map_err(|_| RegistryError::TypeMismatch {
                tag: tag.to_string(),
                expected: type_name::<O>(),
            })
    }

    /// Serialize a concrete value, using its runtime tag.
    pub fn serialize<T: Tagged + Any>(&self, value: &T) -> RegistryResult<Document> {
        self.serialize_dyn(value.type_tag(), value)
    }

    /// Serialize a type-erased value whose runtime tag is known.
    pub fn serialize_dyn(&self, tag: TypeTag, value: &dyn Any) -> RegistryResult<Document> {
        let factory = self.factory(tag.as_str())?;
        if Any::type_id(value) != factory.output_type() {
            return Err(RegistryError::TypeMismatch {
                tag: tag.to_string(),
                expected: factory.output_type_name(),
            });
        }
        let data = factory.serialize_any(self, value)?;
        Ok(json!({ TYPE_FIELD: tag.as_str(), DATA_FIELD: data }))
    }

    fn deserialize_any(&self, document: &Document) -> RegistryResult<(TypeTag, Box<dyn Any>)> {
        let tag = document.get_str(TYPE_FIELD)?;
        let factory = self.factory(tag)?;
        let data = document.opt_field(DATA_FIELD).unwrap_or(&NULL_DATA);
        let value = factory.deserialize_any(self, data)?;
        Ok((factory.tag(), value))
    }

    /// Deserialize into a statically known concrete type.
    pub fn deserialize<T: 'static>(&self, document: &Document) -> RegistryResult<T> {
        let (tag, value) = self.deserialize_any(document)?;
        value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| RegistryError::TypeMismatch {
                tag: tag.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Deserialize into a trait-object family, dispatching on the recorded tag.
    pub fn deserialize_as<D: ?Sized + 'static>(&self, document: &Document) -> RegistryResult<Box<D>> {
        let (tag, value) = self.deserialize_any(document)?;
        let mismatch = || RegistryError::TypeMismatch {
            tag: tag.to_string(),
            expected: type_name::<D>(),
        };

        let value = if value.is::<Box<D>>() {
            value
        } else {
            let concrete = Any::type_id(&*value);
            let upcast = self
                .upcasts
                .get(&(concrete, TypeId::of::<Box<D>>()))
                .ok_or_else(mismatch)?;
            upcast(value).ok_or_else(mismatch)?
        };

        value
            .downcast::<Box<D>>()
            .map(|boxed| *boxed)
            .map_err(|_| mismatch())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("tags", &self.tags())
            .field("upcasts", &self.upcasts.len())
            .finish()
    }
}

// ============================================================================
// STANDARD FACTORIES
// ============================================================================

/// Factory for any serde type whose instances are built from themselves.
pub struct SerdeFactory<T> {
    tag: TypeTag,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeFactory<T> {
    pub const fn new(tag: TypeTag) -> Self {
        Self {
            tag,
            _marker: PhantomData,
        }
    }
}

impl<T> Factory for SerdeFactory<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    type Input = T;
    type Output = T;

    fn tag(&self) -> TypeTag {
        self.tag
    }

    fn new_instance(
        &self,
        _registry: &TypeRegistry,
        input: T,
        _context: &[&dyn Any],
    ) -> RegistryResult<T> {
        Ok(input)
    }

    fn serialize(&self, _registry: &TypeRegistry, value: &T) -> RegistryResult<Document> {
        serde_json::to_value(value).map_err(|e| RegistryError::MalformedDocument {
            field: DATA_FIELD.to_string(),
            reason: e.to_string(),
        })
    }

    fn deserialize(&self, _registry: &TypeRegistry, data: &Document) -> RegistryResult<T> {
        T::deserialize(data).map_err(|e| RegistryError::MalformedDocument {
            field: DATA_FIELD.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Issues and persists [`Token`]s.
pub struct TokenFactory;

impl Factory for TokenFactory {
    type Input = ();
    type Output = Token;

    fn tag(&self) -> TypeTag {
        TOKEN_TAG
    }

    fn new_instance(
        &self,
        _registry: &TypeRegistry,
        _input: (),
        _context: &[&dyn Any],
    ) -> RegistryResult<Token> {
        Ok(Token::new())
    }

    fn serialize(&self, _registry: &TypeRegistry, value: &Token) -> RegistryResult<Document> {
        Ok(Value::String(value.to_string()))
    }

    fn deserialize(&self, _registry: &TypeRegistry, data: &Document) -> RegistryResult<Token> {
        data.as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RegistryError::MalformedDocument {
                field: DATA_FIELD.to_string(),
                reason: "expected token string".to_string(),
            })
    }
}

// ============================================================================
// GLOBAL REGISTRY
// ============================================================================

static GLOBAL: Lazy<RwLock<Arc<TypeRegistry>>> =
    Lazy::new(|| RwLock::new(Arc::new(TypeRegistry::standard())));

/// The process-wide registry. Starts out as [`TypeRegistry::standard`].
pub fn global() -> Arc<TypeRegistry> {
    match GLOBAL.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => {
            tracing::warn!("Global type registry lock was poisoned, recovering");
            poisoned.into_inner().clone()
        }
    }
}

/// Replace the process-wide registry. Call once during initialization.
pub fn install_global(registry: TypeRegistry) -> Arc<TypeRegistry> {
    let registry = Arc::new(registry);
    match GLOBAL.write() {
        Ok(mut guard) => *guard = registry.clone(),
        Err(poisoned) => {
            tracing::warn!("Global type registry lock was poisoned, recovering");
            *poisoned.into_inner() = registry.clone();
        }
    }
    registry
}

/// Restore the process-wide registry to the standard factories (test isolation).
pub fn reset_global() {
    install_global(TypeRegistry::standard());
}

// =============================================================================
// TESTS
// =============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
