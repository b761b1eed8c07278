//! In-memory provider for testing.

use super::{ByteStream, ChangeStream, RemoteApi};
use crate::error::{Error, ErrorKind, Result};
use crate::models::{ChangeSet, Checkpoint, Node, NodeId, NodeStatus};
use async_trait::async_trait;
use bytes::Bytes;
use exn::{OptionExt, ResultExt};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use tokio::sync::RwLock;

const CHUNK_SIZE: usize = 4;

#[derive(Default)]
struct State {
    /// The full change log, oldest first.
    log: Vec<ChangeSet>,
    /// The remote tree as the log describes it.
    nodes: BTreeMap<NodeId, Node>,
    contents: HashMap<NodeId, Bytes>,
    failures: VecDeque<ErrorKind>,
    /// Break the next change log after this many change sets.
    break_log_after: Option<usize>,
    sequence: u64,
    calls: usize,
}

impl State {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn apply(&mut self, changeset: &ChangeSet) {
        if changeset.reset {
            self.nodes.clear();
        }
        for id in &changeset.purged_nodes {
            self.nodes.remove(id);
        }
        for node in &changeset.nodes {
            self.nodes.insert(node.id.clone(), node.clone());
        }
    }

    /// Record a mutation made through the API as a new change set.
    fn commit(&mut self, node: Node) -> Node {
        let checkpoint = format!("mock-{}", self.next_sequence());
        let changeset = ChangeSet::new(checkpoint).with_nodes([node.clone()]);
        self.apply(&changeset);
        self.log.push(changeset);
        node
    }

    fn folder(&self, id: &str) -> Result<&Node> {
        let node = self.nodes.get(id).ok_or_raise(|| ErrorKind::Request(format!("404: no such node {id}")))?;
        if !node.is_folder {
            exn::bail!(ErrorKind::Request(format!("400: {id} is not a folder")));
        }
        Ok(node)
    }

    fn ensure_free_name(&self, parent_id: &str, name: &str) -> Result<()> {
        let taken = self
            .nodes
            .values()
            .any(|n| n.is_available() && n.name == name && n.parent_ids.contains(parent_id));
        if taken {
            exn::bail!(ErrorKind::Request(format!("409: {name} already exists")));
        }
        Ok(())
    }
}

/// In-memory cloud drive for testing.
///
/// Holds a scriptable change log and the tree it describes. Mutations made
/// through [`RemoteApi`] append to the log exactly like a real provider
/// would, so a later sync observes them. Failures can be injected per call
/// or in the middle of a change log.
pub struct MockApi {
    name: String,
    state: RwLock<State>,
}

impl MockApi {
    /// A provider whose history starts with a reset announcing a single
    /// root folder.
    pub fn with_root(root_id: impl Into<NodeId>) -> Self {
        let mut state = State::default();
        let root = ChangeSet::new("mock-0").with_reset(true).with_nodes([Node::folder(root_id, "")]);
        state.apply(&root);
        state.log.push(root);
        Self {
            name: "mock".to_string(),
            state: RwLock::new(state),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a change set to the log and apply it to the remote tree.
    pub async fn push_changes(&self, changeset: ChangeSet) {
        let mut state = self.state.write().await;
        state.apply(&changeset);
        state.log.push(changeset);
    }

    /// Make the next API call fail with `kind`. Queued failures are
    /// consumed in order, one per call.
    pub async fn fail_next(&self, kind: ErrorKind) {
        self.state.write().await.failures.push_back(kind);
    }

    /// Make the next change log yield `count` change sets and then a
    /// request error, as if the connection dropped.
    pub async fn break_log_after(&self, count: usize) {
        self.state.write().await.break_log_after = Some(count);
    }

    /// Current snapshot of a node on the remote side.
    pub async fn node(&self, id: &str) -> Option<Node> {
        self.state.read().await.nodes.get(id).cloned()
    }

    /// Number of API calls served (including failed ones).
    pub async fn calls(&self) -> usize {
        self.state.read().await.calls
    }

    async fn begin(&self) -> Result<tokio::sync::RwLockWriteGuard<'_, State>> {
        let mut state = self.state.write().await;
        state.calls += 1;
        if let Some(kind) = state.failures.pop_front() {
            return Err(Error::from(kind));
        }
        Ok(state)
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_changes(&self, checkpoint: Option<&Checkpoint>, include_purged: bool) -> Result<ChangeStream> {
        let mut state = self.begin().await?;
        // Resume after the given checkpoint; an unknown checkpoint replays
        // the whole history.
        let start = checkpoint
            .and_then(|cp| state.log.iter().rposition(|cs| &cs.checkpoint == cp))
            .map_or(0, |position| position + 1);
        let mut items: Vec<Result<ChangeSet>> = state.log[start..]
            .iter()
            .cloned()
            .map(|mut changeset| {
                if !include_purged {
                    changeset.purged_nodes.clear();
                }
                Ok(changeset)
            })
            .collect();
        if let Some(count) = state.break_log_after.take() {
            items.truncate(count);
            items.push(Err(Error::from(ErrorKind::Request("connection reset mid-stream".into()))));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Node> {
        let mut state = self.begin().await?;
        state.folder(parent_id)?;
        state.ensure_free_name(parent_id, name)?;
        let id = format!("folder-{}", state.next_sequence());
        Ok(state.commit(Node::folder(id, name).with_parent(parent_id)))
    }

    async fn upload_file(&self, parent_id: &str, local_path: &Path) -> Result<Node> {
        let mut state = self.begin().await?;
        state.folder(parent_id)?;
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_raise(|| ErrorKind::LocalIo(local_path.to_path_buf()))?
            .to_string();
        state.ensure_free_name(parent_id, &name)?;
        let content = tokio::fs::read(local_path).await.or_raise(|| ErrorKind::LocalIo(local_path.to_path_buf()))?;
        let md5 = hex::encode(Md5::digest(&content));
        let id = format!("file-{}", state.next_sequence());
        let node = Node::file(id, name).with_parent(parent_id).with_content(md5, content.len() as u64);
        state.contents.insert(node.id.clone(), Bytes::from(content));
        Ok(state.commit(node))
    }

    async fn download(&self, node_id: &str) -> Result<ByteStream> {
        let state = self.begin().await?;
        let content = match state.nodes.get(node_id) {
            Some(node) if !node.is_folder => state.contents.get(node_id).cloned().unwrap_or_default(),
            Some(_) => exn::bail!(ErrorKind::Request(format!("400: {node_id} is a folder"))),
            None => exn::bail!(ErrorKind::Request(format!("404: no such node {node_id}"))),
        };
        let chunks: Vec<Result<Bytes>> =
            content.chunks(CHUNK_SIZE).map(|chunk| Ok(Bytes::copy_from_slice(chunk))).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn move_to_trash(&self, node_id: &str) -> Result<Node> {
        let mut state = self.begin().await?;
        let node = state
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_raise(|| ErrorKind::Request(format!("404: no such node {node_id}")))?;
        Ok(state.commit(node.with_status(NodeStatus::Trashed)))
    }
}
