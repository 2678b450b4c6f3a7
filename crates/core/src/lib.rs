pub mod command;
pub mod commander;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod protocol;
pub mod transport;

pub use command::{Command, CommandKind};
pub use commander::{CommandReply, Commander, PendingCommand, ResultHandle};
pub use config::{ControllerConfig, ObservabilityConfig, SawConfig, TaskSpec, WorkerConfig};
pub use dispatcher::{CommandHandler, Dispatched, Dispatcher};
pub use errors::{SawError, SawResult};
pub use protocol::{
    from_data, to_data, CommandCode, CommandData, CommandState, Frame, Signal,
    ThreadKnowPayload, ThreadResultPayload, ThreadRunPayload, WireMessage,
};
pub use transport::{ConnectionId, Inbound, InboundEvent, MemoryPeer, Peer, TcpConnection};
