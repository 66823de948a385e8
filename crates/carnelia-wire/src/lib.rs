//! Wire format for Carnelia cluster nodes.
//!
//! Every message exchanged between nodes, clients and cluster services is a
//! single JSON object per line:
//!
//! ```text
//! {"src": "n1", "dest": "n2", "body": {"type": "broadcast", "msg_id": 7, "message": 42}}
//! ```
//!
//! - [`envelope`] - the `src`/`dest`/`body` envelope and node identifiers
//! - [`body`] - the typed-but-open message body
//! - [`error`] - Maelstrom error codes and the `error` reply body

pub mod body;
pub mod envelope;
pub mod error;

pub use body::Body;
pub use envelope::{Message, NodeId};
pub use error::{ErrorCode, Result, RpcError, WireError};
