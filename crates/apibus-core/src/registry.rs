//! Adapter interfaces for the external object registry.
//!
//! The dispatcher walks a tree of named classes it does not own. This
//! module defines the interface it consumes: [`ClassNode`] for tree
//! navigation, [`Action`] for the `fetch`/`list`/`create`/`clear` operations
//! and static methods, and [`ApiObject`] for the instances a fetch returns.
//!
//! [`StaticClass`] is a builder-assembled implementation used by
//! applications and tests; a real registry only needs to satisfy the traits.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Context;
use crate::error::{ApiError, ApiResult};
use crate::params::convert;
use crate::response::Response;

/// A shared instance returned by a fetch action and cached on the context.
pub type Object = Arc<dyn ApiObject>;

/// Future type returned by capability operations.
pub type OpFuture<'a> = Pin<Box<dyn Future<Output = ApiResult<()>> + Send + 'a>>;

/// Future type returned by registry actions.
pub type ActionFuture = Pin<Box<dyn Future<Output = ApiResult<Outcome>> + Send>>;

/// An instance living in the object tree.
///
/// `encode` produces the `data` payload for the envelope; the context is
/// passed through so implementations can honor its show-protected-fields
/// flag. The capability accessors drive `PATCH` and `DELETE` dispatch.
/// The `Any` supertrait enables typed retrieval from the context object
/// cache.
pub trait ApiObject: Any + Send + Sync {
    /// Encode this object as a response payload.
    fn encode(&self, ctx: &Context) -> Value;

    /// The update capability, if this object supports `PATCH`.
    fn as_updatable(&self) -> Option<&dyn Updatable> {
        None
    }

    /// The delete capability, if this object supports `DELETE`.
    fn as_deletable(&self) -> Option<&dyn Deletable> {
        None
    }
}

/// Capability implemented by objects that accept `PATCH`.
pub trait Updatable: Send + Sync {
    /// Apply the context's parameters to this object.
    fn api_update<'a>(&'a self, ctx: &'a Context) -> OpFuture<'a>;
}

/// Capability implemented by objects that accept `DELETE` on an instance.
pub trait Deletable: Send + Sync {
    /// Delete this object.
    fn api_delete<'a>(&'a self, ctx: &'a Context) -> OpFuture<'a>;
}

/// What an action hands back to the dispatcher.
pub enum Outcome {
    /// A plain value, encoded as the `data` field of a success envelope.
    Value(Value),
    /// A registry object; encoded through [`ApiObject::encode`].
    Object(Object),
    /// A fully formed response, passed through the pipeline untouched.
    Response(Response),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "Outcome::Value({v})"),
            Self::Object(_) => f.write_str("Outcome::Object"),
            Self::Response(_) => f.write_str("Outcome::Response"),
        }
    }
}

impl Outcome {
    /// Build a value outcome from anything serializable.
    pub fn value<T: serde::Serialize>(value: T) -> ApiResult<Self> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| ApiError::internal(format!("cannot encode action result: {e}")))
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Object> for Outcome {
    fn from(object: Object) -> Self {
        Self::Object(object)
    }
}

/// A plain value wrapped as an object without capabilities.
///
/// Lets fetch actions return bare data when no instance type exists.
pub struct ValueObject(pub Value);

impl ApiObject for ValueObject {
    fn encode(&self, _ctx: &Context) -> Value {
        self.0.clone()
    }
}

/// The four collection actions a class can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Load a single instance by id.
    Fetch,
    /// Enumerate the collection.
    List,
    /// Create a new instance.
    Create,
    /// Remove the whole collection.
    Clear,
}

/// A callable exposed by the registry: an action or a static method.
pub trait Action: Send + Sync {
    /// Invoke with the request context and the bound arguments.
    fn call(&self, ctx: Context, args: Value) -> ActionFuture;
}

/// A node in the class tree.
pub trait ClassNode: Send + Sync {
    /// The class name, used as the cache key for fetched instances.
    fn name(&self) -> &str;

    /// Look up a child class by name.
    fn child(&self, name: &str) -> Option<Arc<dyn ClassNode>>;

    /// Look up one of the collection actions.
    fn action(&self, kind: ActionKind) -> Option<Arc<dyn Action>>;

    /// Look up a static method by name.
    fn static_method(&self, name: &str) -> Option<Arc<dyn Action>>;
}

struct FnAction<F>(F);

impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Context, Value) -> Fut + Send + Sync,
    Fut: Future<Output = ApiResult<Outcome>> + Send + 'static,
{
    fn call(&self, ctx: Context, args: Value) -> ActionFuture {
        Box::pin((self.0)(ctx, args))
    }
}

/// Wrap an async closure as an [`Action`].
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Outcome>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// Wrap an async closure taking a declared argument shape.
///
/// Arguments are bound by name through the permissive conversion
/// primitive, so numeric widths widen and unambiguous strings coerce.
/// Absent parameters bind as an empty map.
pub fn typed_action<A, F, Fut>(f: F) -> Arc<dyn Action>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(Context, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Outcome>> + Send + 'static,
{
    action_fn(move |ctx, args| {
        let effective = if args.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            args
        };
        let bound = convert::<A>(&effective);
        let pending = bound.map(|a| f(ctx, a));
        async move {
            match pending {
                Some(fut) => fut.await,
                None => Err(ApiError::custom(
                    StatusCode::BAD_REQUEST,
                    "invalid_param",
                    "cannot bind request parameters to action arguments",
                )),
            }
        }
    })
}

/// A builder-assembled class tree node.
pub struct StaticClass {
    name: String,
    children: HashMap<String, Arc<StaticClass>>,
    actions: HashMap<ActionKind, Arc<dyn Action>>,
    statics: HashMap<String, Arc<dyn Action>>,
}

impl StaticClass {
    /// Start building a class with the given name. The registry root is
    /// conventionally built with an empty name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> StaticClassBuilder {
        StaticClassBuilder {
            name: name.into(),
            children: HashMap::new(),
            actions: HashMap::new(),
            statics: HashMap::new(),
        }
    }
}

impl ClassNode for StaticClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn child(&self, name: &str) -> Option<Arc<dyn ClassNode>> {
        self.children
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn ClassNode>)
    }

    fn action(&self, kind: ActionKind) -> Option<Arc<dyn Action>> {
        self.actions.get(&kind).map(Arc::clone)
    }

    fn static_method(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.statics.get(name).map(Arc::clone)
    }
}

/// Builder for [`StaticClass`].
pub struct StaticClassBuilder {
    name: String,
    children: HashMap<String, Arc<StaticClass>>,
    actions: HashMap<ActionKind, Arc<dyn Action>>,
    statics: HashMap<String, Arc<dyn Action>>,
}

impl StaticClassBuilder {
    /// Attach a child class.
    #[must_use]
    pub fn child(mut self, class: Arc<StaticClass>) -> Self {
        self.children.insert(class.name.clone(), class);
        self
    }

    /// Register a collection action.
    #[must_use]
    pub fn action(mut self, kind: ActionKind, action: Arc<dyn Action>) -> Self {
        self.actions.insert(kind, action);
        self
    }

    /// Register a static method.
    #[must_use]
    pub fn static_method(mut self, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        self.statics.insert(name.into(), action);
        self
    }

    /// Finish the class.
    #[must_use]
    pub fn build(self) -> Arc<StaticClass> {
        Arc::new(StaticClass {
            name: self.name,
            children: self.children,
            actions: self.actions,
            statics: self.statics,
        })
    }
}
