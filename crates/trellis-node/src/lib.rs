//! Trellis overlay node.
//!
//! A node accepts and dials TCP links, secures each with the key-wrap
//! handshake, binds a peer id to the link with a signed HELLO and then
//! floods or unicasts signed envelopes across the mesh.
//!
//! ```no_run
//! # async fn run() -> trellis_common::Result<()> {
//! use trellis_common::NodeConfig;
//! use trellis_core::MessageType;
//! use trellis_node::Node;
//!
//! let node = Node::new(NodeConfig::for_peer("alice"))?;
//! node.on_message(|event| println!("{event:?}"));
//! node.start(7100).await?;
//! node.connect("bob", "10.0.0.2", 7100).await?;
//! node.send_message("bob", MessageType::Private, "hi").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod authorizer;
pub mod directory;
pub mod files;
pub mod lamport;
pub mod membership;
pub mod node;
pub mod router;
pub mod seen;
pub mod session;
pub mod sink;

pub use authorizer::{AllowAll, AllowList, Authorizer};
pub use directory::{PeerDirectory, StaticDirectory};
pub use node::{Node, NodeBuilder, NodeEvent};
pub use sink::{DirectorySink, FileSink, MemorySink};
