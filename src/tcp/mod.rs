pub mod defs;
pub mod input;
pub mod oos;
pub mod output;
pub mod packet;
pub mod pcb;
pub mod timer;
pub mod usrreq;

pub use defs::{TcpConfig, TcpStatus};
pub use usrreq::{ConnId, ConnectArgs, ConnectionHandler, ListenParams, ListenerHandler, ListenerId, TcpStack};
