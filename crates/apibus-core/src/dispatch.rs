//! Path resolution and verb dispatch into the object tree.
//!
//! A path is `Segment[/Segment…][:method]`. Uppercase-initial segments
//! descend into child classes; anything else is an id resolved through the
//! current class's fetch action. A trailing `:method` invokes a static
//! method on the resolved class. Verbs then map onto the class actions:
//! `GET`/`HEAD` list or return, `POST` creates, `PATCH` updates through
//! the update capability, `DELETE` deletes an instance or clears a
//! collection.

use std::sync::Arc;

use http::Method;
use serde_json::{json, Value};

use crate::context::Context;
use crate::engine::Engine;
use crate::error::{ApiError, ApiResult};
use crate::registry::{ActionKind, Object, Outcome, ValueObject};
use crate::response::Response;

/// Verbs advertised for `OPTIONS` on a static-method endpoint.
const STATIC_METHODS: &[Method] = &[Method::GET, Method::POST, Method::HEAD, Method::OPTIONS];
/// Verbs advertised for `OPTIONS` on an instance endpoint.
const INSTANCE_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
    Method::DELETE,
];
/// Verbs advertised for `OPTIONS` on a collection endpoint.
const COLLECTION_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::POST,
    Method::DELETE,
];

/// Resolve the context's path and invoke the matching action.
pub async fn dispatch(engine: &Engine, ctx: &Context) -> ApiResult<Outcome> {
    let path = ctx.path();

    if let Some(special) = path.strip_prefix('@') {
        return call_special(engine, ctx, special).await;
    }

    let verb = ctx.verb();

    // The optional static-method suffix splits at the last colon, so a
    // trailing `:method` anchors cleanly even when ids contain colons.
    let (walk, method) = match path.rfind(':') {
        Some(pos) => (&path[..pos], Some(&path[pos + 1..])),
        None => (path.as_str(), None),
    };

    let mut node = engine.root();
    let mut instance: Option<Object> = None;
    // Under OPTIONS the id fetch is skipped so CORS preflight never hits
    // storage; the sentinel remembers that an instance position was named.
    let mut fetch_skipped = false;

    for segment in walk.split('/').filter(|s| !s.is_empty()) {
        if segment
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
        {
            if let Some(child) = node.child(segment) {
                node = child;
                instance = None;
                fetch_skipped = false;
                continue;
            }
        }

        // Not a known class: treat the segment as an id.
        let Some(fetch) = node.action(ActionKind::Fetch) else {
            return Err(ApiError::not_found());
        };
        if instance.is_some() || fetch_skipped {
            // `Class/id1/id2` has no meaning.
            return Err(ApiError::not_found());
        }
        if verb == Method::OPTIONS {
            fetch_skipped = true;
            continue;
        }

        let fetched = fetch.call(ctx.clone(), json!({ "id": segment })).await?;
        let object = match fetched {
            Outcome::Object(object) => object,
            Outcome::Value(value) => Arc::new(ValueObject(value)) as Object,
            Outcome::Response(_) => {
                return Err(ApiError::internal("fetch action returned a response"))
            }
        };
        ctx.attach_object(node.name(), Arc::clone(&object));
        instance = Some(object);
    }

    if let Some(name) = method {
        if verb == Method::OPTIONS {
            ctx.set_raw(true);
            return Ok(Outcome::Response(Response::options(ctx, STATIC_METHODS)));
        }
        let Some(action) = node.static_method(name) else {
            return Err(ApiError::not_found());
        };
        if !matches!(verb, Method::GET | Method::HEAD | Method::POST) {
            return Err(ApiError::method_not_allowed(verb.as_str()));
        }
        return action.call(ctx.clone(), ctx.params().unwrap_or(Value::Null)).await;
    }

    if instance.is_some() || fetch_skipped {
        if verb == Method::OPTIONS {
            return Ok(Outcome::Response(Response::options(ctx, INSTANCE_METHODS)));
        }
        let Some(object) = instance else {
            return Err(ApiError::internal("instance missing after path walk"));
        };
        return match verb {
            Method::GET | Method::HEAD => Ok(Outcome::Object(object)),
            Method::PATCH => match object.as_updatable() {
                Some(updatable) => {
                    updatable.api_update(ctx).await?;
                    Ok(Outcome::Object(Arc::clone(&object)))
                }
                None => Err(ApiError::method_not_allowed(verb.as_str())),
            },
            Method::DELETE => match object.as_deletable() {
                Some(deletable) => {
                    deletable.api_delete(ctx).await?;
                    Ok(Outcome::Object(Arc::clone(&object)))
                }
                None => Err(ApiError::method_not_allowed(verb.as_str())),
            },
            _ => Err(ApiError::method_not_allowed(verb.as_str())),
        };
    }

    // Collection endpoint.
    let kind = match verb {
        Method::OPTIONS => {
            return Ok(Outcome::Response(Response::options(ctx, COLLECTION_METHODS)))
        }
        Method::GET | Method::HEAD => ActionKind::List,
        Method::POST => ActionKind::Create,
        Method::DELETE => ActionKind::Clear,
        _ => return Err(ApiError::method_not_allowed(verb.as_str())),
    };
    let Some(action) = node.action(kind) else {
        return Err(ApiError::method_not_allowed(verb.as_str()));
    };
    action.call(ctx.clone(), ctx.params().unwrap_or(Value::Null)).await
}

/// Invoke a `@`-prefixed special handler.
async fn call_special(engine: &Engine, ctx: &Context, name: &str) -> ApiResult<Outcome> {
    let Some(action) = engine.special(name) else {
        return Err(ApiError::not_found());
    };
    action.call(ctx.clone(), ctx.params().unwrap_or(Value::Null)).await
}
