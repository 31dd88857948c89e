//! Session and link lifecycle on top of the linkprims engine.
//!
//! A [`Connection`] owns an engine thread. Sessions and links are created by
//! injecting work onto that thread and waiting for the result, so their
//! tables are never touched from two threads at once. Peer-initiated
//! sessions and links arrive on [`Connection::incoming`] and only become
//! live once accepted.

pub mod connection;
pub mod error;
pub mod handler;
pub mod incoming;
pub mod link;
pub mod session;

pub use connection::{Connection, ConnectionConfig, PeerEvents};
pub use error::{Result, SessionError};
pub use handler::ConnectionHandler;
pub use incoming::{Accepted, Incoming, IncomingReceiver, IncomingSender, IncomingSession};
pub use link::{Link, LinkInfo, LinkOption, Receiver, Sender};
pub use session::{Session, SessionOption};
