//! In-memory collaborators for exercising `linkpump` without a transport.
//!
//! Every fake records what the pipeline did to it (credits added, messages
//! settled, locks renewed, closes) and is driven from the test body.
//!
//! ```rust
//! use linkpump_testing::{ScriptedLink, link_source};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (links, feeder) = link_source();
//! let link = ScriptedLink::new("link-1");
//! feeder.push(link.clone());
//! # drop(links);
//! # }
//! ```

pub mod handler;
pub mod link;
pub mod macros;
pub mod management;
pub mod message;
pub mod metrics;
pub mod receiver;
pub mod session;

pub use handler::RecordingHandler;
pub use link::{LinkFeeder, ScriptedLink, link_source};
pub use management::StubManagementNode;
pub use message::{message, session_message};
pub use metrics::{counter_value, debugging_recorder_setup};
pub use receiver::ScriptedReceiver;
pub use session::{ScriptedAcceptor, ScriptedSession};
