mod node;

pub(crate) use self::node::NodeRow;
