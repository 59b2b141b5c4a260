pub mod fsm;
pub mod transport;

pub use self::{fsm::FiniteStateMachine, transport::Transport};
