//! Remote tree models.
//!
//! These types are what crosses the remote boundary: every provider
//! response is decoded into a [`Node`] before anything else sees it, and
//! the change log is decoded into [`ChangeSet`]s.

use crate::error::{Error, ErrorKind};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Opaque, immutable, globally unique node identifier.
pub type NodeId = String;

/// Lifecycle state of a remote node.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    #[display("AVAILABLE")]
    #[serde(rename = "AVAILABLE")]
    Available,
    #[display("TRASH")]
    #[serde(rename = "TRASH")]
    Trashed,
    #[display("PURGED")]
    #[serde(rename = "PURGED")]
    Purged,
}

impl NodeStatus {
    /// Provider (and database) spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Trashed => "TRASH",
            Self::Purged => "PURGED",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "TRASH" | "TRASHED" => Ok(Self::Trashed),
            "PURGED" => Ok(Self::Purged),
            other => Err(Error::from(ErrorKind::InvalidResponse(format!("unknown node status {other:?}")))),
        }
    }
}

/// One remote file or folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    /// Empty for the root folder.
    pub name: String,
    /// The provider allows a node to live in several folders at once.
    pub parent_ids: BTreeSet<NodeId>,
    pub is_folder: bool,
    pub status: NodeStatus,
    /// Files only.
    pub md5: Option<String>,
    /// Files only.
    pub size: Option<u64>,
}

impl Node {
    pub fn folder(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_ids: BTreeSet::new(),
            is_folder: true,
            status: NodeStatus::Available,
            md5: None,
            size: None,
        }
    }

    pub fn file(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self {
            is_folder: false,
            ..Self::folder(id, name)
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<NodeId>) -> Self {
        self.parent_ids.insert(parent_id.into());
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_content(mut self, md5: impl Into<String>, size: u64) -> Self {
        self.md5 = Some(md5.into());
        self.size = Some(size);
        self
    }

    /// The root is the one available folder without parents.
    pub fn is_root(&self) -> bool {
        self.is_folder && self.parent_ids.is_empty() && self.status == NodeStatus::Available
    }

    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Available
    }

    pub fn is_trashed(&self) -> bool {
        self.status == NodeStatus::Trashed
    }

    pub fn is_purged(&self) -> bool {
        self.status == NodeStatus::Purged
    }
}

/// Server-issued cursor into the change log.
///
/// Only the server can compare checkpoints; the client stores and replays
/// them verbatim.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(String);

impl Checkpoint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl AsRef<str> for Checkpoint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Checkpoint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One decoded unit of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub checkpoint: Checkpoint,
    /// Everything the client knew before this point is invalid.
    pub reset: bool,
    /// Snapshots of nodes changed since the previous checkpoint, in order.
    pub nodes: Vec<Node>,
    pub purged_nodes: Vec<NodeId>,
}

impl ChangeSet {
    pub fn new(checkpoint: impl Into<Checkpoint>) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            reset: false,
            nodes: Vec::new(),
            purged_nodes: Vec::new(),
        }
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn with_purged(mut self, ids: impl IntoIterator<Item = impl Into<NodeId>>) -> Self {
        self.purged_nodes.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Whether applying this change set would touch any node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.purged_nodes.is_empty()
    }
}

/// Node snapshot as the provider serializes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawNode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub content_properties: Option<RawContentProperties>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct RawContentProperties {
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TryFrom<RawNode> for Node {
    type Error = Error;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let is_folder = match raw.kind.as_str() {
            "FOLDER" => true,
            "FILE" | "ASSET" => false,
            other => exn::bail!(ErrorKind::InvalidResponse(format!("node {} has unknown kind {other:?}", raw.id))),
        };
        let status = raw.status.as_deref().map(str::parse::<NodeStatus>).transpose()?.unwrap_or_default();
        let (md5, size) = match raw.content_properties {
            Some(props) if !is_folder => (props.md5, props.size),
            _ => (None, None),
        };
        Ok(Self {
            id: raw.id,
            name: raw.name.unwrap_or_default(),
            parent_ids: raw.parents.into_iter().collect(),
            is_folder,
            status,
            md5,
            size,
        })
    }
}
