//! Event-driven, single-threaded L7 multiplexing bus core: a generational
//! arena replaces the shared/weak pointer graph of the original design, an
//! explicit `Result`/enum taxonomy replaces exceptions, and `Connector<M>`
//! is parameterized over the node role's framing direction instead of being
//! template-specialized per role.

pub mod arena;
pub mod connector;
pub mod envelope;
pub mod error;
pub mod interface;
pub mod marshaler;
pub mod metrics;
pub mod net;
pub mod resolver;
pub mod table;
pub mod timer;
pub mod trigger;
pub mod uuid;
pub mod xmsg;

pub use arena::{Arena, SlotId};
pub use connector::{BUFSIZE_CEILING, Connector, DuplexMode};
pub use envelope::{Header, MsgFlags, MsgOp};
pub use error::{HandlerOutcome, NodeError};
pub use interface::{Interface, Transport};
pub use marshaler::{Controller, Marshaler, Proxy, Segment};
pub use net::{RawListener, bind_listener};
pub use resolver::{Address, AddressResolver, ThreadedResolver};
pub use table::{ConnectionTable, Session, SessionState};
pub use uuid::Uuid;
