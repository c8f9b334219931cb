//! Backend path layout.
//!
//! All trees live under `<root>/zoom/<version>`:
//!
//! ```text
//! <root>/zoom/1/models/<Class>/<id>            object payload
//! <root>/zoom/1/objects/<Class>/<id>           provenance sibling
//! <root>/zoom/1/state/<ns>/<Class>/<id>/<key>  state subsystem
//! <root>/zoom/1/locks/zoom-topology            topology lock node
//! <root>/zoom/1/zoomlocks/lock...              transaction markers
//! ```

use zoom_types::ObjId;

/// Data-format version segment.
pub(crate) const DATA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub(crate) struct PathLayout {
    base: String,
}

impl PathLayout {
    pub fn new(root_key: &str) -> Self {
        let root = if root_key == "/" { "" } else { root_key };
        Self { base: format!("{root}/zoom/{DATA_VERSION}") }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn models_dir(&self) -> String {
        format!("{}/models", self.base)
    }

    pub fn class_dir(&self, class: &str) -> String {
        format!("{}/models/{class}", self.base)
    }

    pub fn object(&self, class: &str, id: &ObjId) -> String {
        format!("{}/models/{class}/{id}", self.base)
    }

    pub fn provenance_dir(&self) -> String {
        format!("{}/objects", self.base)
    }

    pub fn provenance_class_dir(&self, class: &str) -> String {
        format!("{}/objects/{class}", self.base)
    }

    pub fn provenance(&self, class: &str, id: &ObjId) -> String {
        format!("{}/objects/{class}/{id}", self.base)
    }

    pub fn state_dir(&self) -> String {
        format!("{}/state", self.base)
    }

    pub fn state_namespace(&self, namespace: &str) -> String {
        format!("{}/state/{namespace}", self.base)
    }

    pub fn state_class(&self, namespace: &str, class: &str) -> String {
        format!("{}/state/{namespace}/{class}", self.base)
    }

    pub fn state_object(&self, namespace: &str, class: &str, id: &ObjId) -> String {
        format!("{}/state/{namespace}/{class}/{id}", self.base)
    }

    pub fn state_key(&self, namespace: &str, class: &str, id: &ObjId, key: &str) -> String {
        format!("{}/state/{namespace}/{class}/{id}/{key}", self.base)
    }

    pub fn state_value(
        &self,
        namespace: &str,
        class: &str,
        id: &ObjId,
        key: &str,
        value: &str,
    ) -> String {
        format!("{}/state/{namespace}/{class}/{id}/{key}/{value}", self.base)
    }

    pub fn locks_dir(&self) -> String {
        format!("{}/locks", self.base)
    }

    pub fn topology_lock(&self) -> String {
        format!("{}/locks/zoom-topology", self.base)
    }

    pub fn tx_markers_dir(&self) -> String {
        format!("{}/zoomlocks", self.base)
    }

    pub fn tx_marker_prefix(&self) -> String {
        format!("{}/zoomlocks/lock", self.base)
    }
}
