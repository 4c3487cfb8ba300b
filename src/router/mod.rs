//! Event routing
//!
//! - `OutboundRouter`: on the controller, decides per captured event whether
//!   it stays local or goes to the owning node
//! - `InboundRouter`: on a node, applies forwarded events through the
//!   injector and hands control messages back to the session

mod inbound;
mod outbound;

pub use inbound::*;
pub use outbound::*;
