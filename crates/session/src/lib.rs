// Collaborative editing session core: replicated text, presence and the
// connection lifecycle around a peer transport.

pub mod config;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod reconnect;
pub mod session;
pub mod transport;
pub mod undo;

pub use config::{ClientConfig, LocalUser, SessionConfig};
pub use error::SessionError;
pub use provider::{ConnectionStatus, ProviderEvent, TransportProvider, UserPatch};
pub use session::{ActiveUser, ConnectionSession, SessionEvent, SessionManager};
pub use tandem_common::presence::{CursorRange, PresenceState, PresenceUser};
