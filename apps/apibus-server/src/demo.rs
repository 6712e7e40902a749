//! The demo object tree served by this binary.
//!
//! An in-memory `User` collection with full fetch/list/create/clear
//! actions and update/delete capabilities, a `Ping` class with an `echo`
//! static method, and an `Events` class whose statics manage broadcast
//! subscriptions for long-lived peers.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use uuid::Uuid;

use apibus_core::context::Context;
use apibus_core::error::ApiError;
use apibus_core::registry::{
    action_fn, ActionKind, ApiObject, Deletable, Object, OpFuture, Outcome, StaticClass, Updatable,
};

/// In-memory user store shared by all actions.
#[derive(Default)]
pub struct UserStore {
    users: DashMap<String, Arc<DemoUser>>,
}

impl UserStore {
    fn seed(self: &Arc<Self>) {
        for (id, name) in [("42", "A"), ("7", "Lu")] {
            self.users.insert(
                id.to_owned(),
                Arc::new(DemoUser {
                    id: id.to_owned(),
                    name: RwLock::new(name.to_owned()),
                    store: Arc::downgrade(self),
                }),
            );
        }
    }
}

/// One user record.
pub struct DemoUser {
    id: String,
    name: RwLock<String>,
    store: Weak<UserStore>,
}

impl ApiObject for DemoUser {
    fn encode(&self, _ctx: &Context) -> Value {
        json!({"id": self.id, "name": *self.name.read()})
    }

    fn as_updatable(&self) -> Option<&dyn Updatable> {
        Some(self)
    }

    fn as_deletable(&self) -> Option<&dyn Deletable> {
        Some(self)
    }
}

impl Updatable for DemoUser {
    fn api_update<'a>(&'a self, ctx: &'a Context) -> OpFuture<'a> {
        Box::pin(async move {
            if let Some(name) = ctx.param::<String>("name") {
                *self.name.write() = name;
            }
            Ok(())
        })
    }
}

impl Deletable for DemoUser {
    fn api_delete<'a>(&'a self, _ctx: &'a Context) -> OpFuture<'a> {
        Box::pin(async move {
            if let Some(store) = self.store.upgrade() {
                store.users.remove(&self.id);
            }
            Ok(())
        })
    }
}

/// Build the demo registry root.
pub fn build_registry() -> Arc<StaticClass> {
    let store = Arc::new(UserStore::default());
    store.seed();

    let fetch_store = Arc::clone(&store);
    let fetch = action_fn(move |_ctx, args| {
        let store = Arc::clone(&fetch_store);
        async move {
            let id = args["id"].as_str().unwrap_or_default();
            match store.users.get(id) {
                Some(user) => Ok(Outcome::Object(Arc::clone(user.value()) as Object)),
                None => Err(ApiError::not_found()),
            }
        }
    });

    let list_store = Arc::clone(&store);
    let list = action_fn(move |ctx, _args| {
        let store = Arc::clone(&list_store);
        async move {
            let window = ctx.pagination(25);
            let mut users: Vec<Value> = store
                .users
                .iter()
                .map(|entry| entry.value().encode(&ctx))
                .collect();
            users.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
            let page: Vec<Value> = users
                .into_iter()
                .skip(window.offset as usize)
                .take(window.limit as usize)
                .collect();
            Ok(Outcome::Value(Value::Array(page)))
        }
    });

    let create_store = Arc::clone(&store);
    let create = action_fn(move |ctx, _args| {
        let store = Arc::clone(&create_store);
        async move {
            let name = ctx
                .param::<String>("name")
                .ok_or_else(|| ApiError::internal("name parameter is required"))?;
            let id = Uuid::new_v4().simple().to_string();
            let user = Arc::new(DemoUser {
                id: id.clone(),
                name: RwLock::new(name),
                store: Arc::downgrade(&store),
            });
            store.users.insert(id, Arc::clone(&user));
            Ok(Outcome::Object(user as Object))
        }
    });

    let clear_store = Arc::clone(&store);
    let clear = action_fn(move |_ctx, _args| {
        let store = Arc::clone(&clear_store);
        async move {
            let removed = store.users.len();
            store.users.clear();
            Ok(Outcome::Value(json!({"cleared": removed})))
        }
    });

    let echo = action_fn(|_ctx, args| async move { Ok(Outcome::Value(args)) });

    let subscribe = action_fn(|ctx, _args| async move {
        let channel = ctx
            .param::<String>("channel")
            .ok_or_else(|| ApiError::internal("channel parameter is required"))?;
        ctx.set_listen(&channel, true);
        Ok(Outcome::Value(json!({"subscribed": channel})))
    });
    let unsubscribe = action_fn(|ctx, _args| async move {
        let channel = ctx
            .param::<String>("channel")
            .ok_or_else(|| ApiError::internal("channel parameter is required"))?;
        ctx.set_listen(&channel, false);
        Ok(Outcome::Value(json!({"unsubscribed": channel})))
    });

    let user = StaticClass::builder("User")
        .action(ActionKind::Fetch, fetch)
        .action(ActionKind::List, list)
        .action(ActionKind::Create, create)
        .action(ActionKind::Clear, clear)
        .build();
    let ping = StaticClass::builder("Ping").static_method("echo", echo).build();
    let events = StaticClass::builder("Events")
        .static_method("subscribe", subscribe)
        .static_method("unsubscribe", unsubscribe)
        .build();

    StaticClass::builder("")
        .child(user)
        .child(ping)
        .child(events)
        .build()
}
