//! Shared test model: a small network topology with symmetric bindings.
//!
//! - `Bridge.port_ids` (list, Clear) <-> `Port.bridge_id` (single, Clear)
//! - `Router.port_ids` (list, Error) <-> `Port.router_id` (single, Clear)
//! - `Chain.rule_ids` (list, Cascade) <-> `Rule.chain_id` (single, Clear)
//! - `Switch.peer_ids` (list, Clear) <-> itself

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zoom_backend::MemoryBackend;
use zoom_store::{
    DeleteAction, FieldKind, KeyType, ObjId, RefValue, Storable, StoreConfig, ZoomBuilder,
    ZoomStore,
};

pub const TEST_NAMESPACE: &str = "test-host";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    pub id: ObjId,
    pub name: String,
    pub port_ids: Vec<ObjId>,
}

impl Bridge {
    pub fn new(id: impl Into<ObjId>, name: &str) -> Self {
        Self { id: id.into(), name: name.to_owned(), port_ids: Vec::new() }
    }
}

impl Storable for Bridge {
    fn class_name() -> &'static str {
        "Bridge"
    }

    fn ref_fields() -> &'static [(&'static str, FieldKind)] {
        &[("port_ids", FieldKind::List)]
    }

    fn object_id(&self) -> ObjId {
        self.id.clone()
    }

    fn ref_field(&self, field: &str) -> Option<RefValue> {
        match field {
            "port_ids" => Some(RefValue::List(self.port_ids.clone())),
            _ => None,
        }
    }

    fn set_ref_field(&mut self, field: &str, value: RefValue) {
        if field == "port_ids"
            && let RefValue::List(ids) = value
        {
            self.port_ids = ids;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: ObjId,
    pub name: String,
    pub bridge_id: Option<ObjId>,
    pub router_id: Option<ObjId>,
}

impl Port {
    pub fn new(id: impl Into<ObjId>, name: &str) -> Self {
        Self { id: id.into(), name: name.to_owned(), bridge_id: None, router_id: None }
    }

    pub fn on_bridge(mut self, bridge: impl Into<ObjId>) -> Self {
        self.bridge_id = Some(bridge.into());
        self
    }

    pub fn on_router(mut self, router: impl Into<ObjId>) -> Self {
        self.router_id = Some(router.into());
        self
    }
}

impl Storable for Port {
    fn class_name() -> &'static str {
        "Port"
    }

    fn ref_fields() -> &'static [(&'static str, FieldKind)] {
        &[("bridge_id", FieldKind::Single), ("router_id", FieldKind::Single)]
    }

    fn object_id(&self) -> ObjId {
        self.id.clone()
    }

    fn ref_field(&self, field: &str) -> Option<RefValue> {
        match field {
            "bridge_id" => Some(RefValue::Single(self.bridge_id.clone())),
            "router_id" => Some(RefValue::Single(self.router_id.clone())),
            _ => None,
        }
    }

    fn set_ref_field(&mut self, field: &str, value: RefValue) {
        match (field, value) {
            ("bridge_id", RefValue::Single(id)) => self.bridge_id = id,
            ("router_id", RefValue::Single(id)) => self.router_id = id,
            _ => {},
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub id: ObjId,
    pub name: String,
    pub port_ids: Vec<ObjId>,
}

impl Router {
    pub fn new(id: impl Into<ObjId>, name: &str) -> Self {
        Self { id: id.into(), name: name.to_owned(), port_ids: Vec::new() }
    }
}

impl Storable for Router {
    fn class_name() -> &'static str {
        "Router"
    }

    fn ref_fields() -> &'static [(&'static str, FieldKind)] {
        &[("port_ids", FieldKind::List)]
    }

    fn object_id(&self) -> ObjId {
        self.id.clone()
    }

    fn ref_field(&self, field: &str) -> Option<RefValue> {
        match field {
            "port_ids" => Some(RefValue::List(self.port_ids.clone())),
            _ => None,
        }
    }

    fn set_ref_field(&mut self, field: &str, value: RefValue) {
        if field == "port_ids"
            && let RefValue::List(ids) = value
        {
            self.port_ids = ids;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: ObjId,
    pub name: String,
    pub rule_ids: Vec<ObjId>,
}

impl Chain {
    pub fn new(id: impl Into<ObjId>, name: &str) -> Self {
        Self { id: id.into(), name: name.to_owned(), rule_ids: Vec::new() }
    }
}

impl Storable for Chain {
    fn class_name() -> &'static str {
        "Chain"
    }

    fn ref_fields() -> &'static [(&'static str, FieldKind)] {
        &[("rule_ids", FieldKind::List)]
    }

    fn object_id(&self) -> ObjId {
        self.id.clone()
    }

    fn ref_field(&self, field: &str) -> Option<RefValue> {
        match field {
            "rule_ids" => Some(RefValue::List(self.rule_ids.clone())),
            _ => None,
        }
    }

    fn set_ref_field(&mut self, field: &str, value: RefValue) {
        if field == "rule_ids"
            && let RefValue::List(ids) = value
        {
            self.rule_ids = ids;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: ObjId,
    pub chain_id: Option<ObjId>,
}

impl Rule {
    pub fn new(id: impl Into<ObjId>) -> Self {
        Self { id: id.into(), chain_id: None }
    }

    pub fn in_chain(mut self, chain: impl Into<ObjId>) -> Self {
        self.chain_id = Some(chain.into());
        self
    }
}

impl Storable for Rule {
    fn class_name() -> &'static str {
        "Rule"
    }

    fn ref_fields() -> &'static [(&'static str, FieldKind)] {
        &[("chain_id", FieldKind::Single)]
    }

    fn object_id(&self) -> ObjId {
        self.id.clone()
    }

    fn ref_field(&self, field: &str) -> Option<RefValue> {
        match field {
            "chain_id" => Some(RefValue::Single(self.chain_id.clone())),
            _ => None,
        }
    }

    fn set_ref_field(&mut self, field: &str, value: RefValue) {
        if field == "chain_id"
            && let RefValue::Single(id) = value
        {
            self.chain_id = id;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub id: ObjId,
    pub peer_ids: Vec<ObjId>,
}

impl Switch {
    pub fn new(id: impl Into<ObjId>) -> Self {
        Self { id: id.into(), peer_ids: Vec::new() }
    }
}

impl Storable for Switch {
    fn class_name() -> &'static str {
        "Switch"
    }

    fn ref_fields() -> &'static [(&'static str, FieldKind)] {
        &[("peer_ids", FieldKind::List)]
    }

    fn object_id(&self) -> ObjId {
        self.id.clone()
    }

    fn ref_field(&self, field: &str) -> Option<RefValue> {
        match field {
            "peer_ids" => Some(RefValue::List(self.peer_ids.clone())),
            _ => None,
        }
    }

    fn set_ref_field(&mut self, field: &str, value: RefValue) {
        if field == "peer_ids"
            && let RefValue::List(ids) = value
        {
            self.peer_ids = ids;
        }
    }
}

/// Builds a store over a fresh in-memory backend with the topology model
/// registered.
pub async fn new_store() -> (Arc<MemoryBackend>, ZoomStore) {
    new_store_with_attempts(3).await
}

pub async fn new_store_with_attempts(attempts: u32) -> (Arc<MemoryBackend>, ZoomStore) {
    let backend = Arc::new(MemoryBackend::new());
    let config = StoreConfig::builder()
        .transaction_attempts(attempts)
        .lock_timeout(Duration::from_secs(2))
        .namespace(TEST_NAMESPACE)
        .build()
        .expect("valid test config");

    let mut builder = ZoomBuilder::new(backend.clone(), config);
    builder.register_class::<Bridge>().expect("register Bridge");
    builder.register_class::<Port>().expect("register Port");
    builder.register_class::<Router>().expect("register Router");
    builder.register_class::<Chain>().expect("register Chain");
    builder.register_class::<Rule>().expect("register Rule");
    builder.register_class::<Switch>().expect("register Switch");
    builder
        .declare_binding::<Bridge, Port>(
            "port_ids",
            DeleteAction::Clear,
            "bridge_id",
            DeleteAction::Clear,
        )
        .expect("bridge/port binding");
    builder
        .declare_binding::<Router, Port>(
            "port_ids",
            DeleteAction::Error,
            "router_id",
            DeleteAction::Clear,
        )
        .expect("router/port binding");
    builder
        .declare_binding::<Chain, Rule>(
            "rule_ids",
            DeleteAction::Cascade,
            "chain_id",
            DeleteAction::Clear,
        )
        .expect("chain/rule binding");
    builder
        .declare_binding::<Switch, Switch>(
            "peer_ids",
            DeleteAction::Clear,
            "peer_ids",
            DeleteAction::Clear,
        )
        .expect("switch self binding");
    builder.register_key::<Bridge>("status", KeyType::SingleLastWriteWins).expect("status key");
    builder.register_key::<Bridge>("active_ports", KeyType::Multiple).expect("active_ports key");

    let store = builder.build().await.expect("build store");
    (backend, store)
}

/// Commits a single operation in its own transaction.
pub async fn commit_one(
    store: &ZoomStore,
    op: zoom_store::PersistenceOp,
) -> Result<(), zoom_store::ZoomError> {
    store.multi(vec![op]).await
}
