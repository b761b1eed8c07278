use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use nimbus_remote::{Node, NodeStatus};

/// Separator used by the `parents` aggregate (ASCII unit separator).
const PARENT_SEPARATOR: char = '\u{1f}';

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NodeRow {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub status: String,
    pub md5: Option<String>,
    pub size: Option<i64>,
    pub parents: Option<String>,
}

impl TryFrom<NodeRow> for Node {
    type Error = Error;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<NodeStatus>().or_raise(|| ErrorKind::InvalidData("status"))?;
        let size = row.size.map(u64::try_from).transpose().or_raise(|| ErrorKind::InvalidData("size"))?;
        let parent_ids = row
            .parents
            .as_deref()
            .map(|parents| parents.split(PARENT_SEPARATOR).map(String::from).collect())
            .unwrap_or_default();
        Ok(Self {
            id: row.id,
            name: row.name,
            parent_ids,
            is_folder: row.is_folder,
            status,
            md5: row.md5,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(parents: Option<&str>, size: Option<i64>) -> NodeRow {
        NodeRow {
            id: "n1".into(),
            name: "a".into(),
            is_folder: false,
            status: "TRASH".into(),
            md5: Some("abc".into()),
            size,
            parents: parents.map(String::from),
        }
    }

    #[test]
    fn splits_parent_aggregate() {
        let node = Node::try_from(row(Some("p2\u{1f}p1"), Some(3))).unwrap();
        assert_eq!(node.parent_ids.iter().map(String::as_str).collect::<Vec<_>>(), ["p1", "p2"]);
        assert!(node.is_trashed());
        assert_eq!(node.size, Some(3));
    }

    #[test]
    fn no_parents_means_empty_set() {
        assert!(Node::try_from(row(None, None)).unwrap().parent_ids.is_empty());
    }

    #[test]
    fn negative_size_is_invalid() {
        let err = Node::try_from(row(None, Some(-1))).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("size"));
    }
}
