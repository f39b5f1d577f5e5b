pub mod local;
pub mod network;
pub mod remote;
pub mod state;
