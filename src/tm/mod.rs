pub mod build_info;
pub mod channel;
pub mod cli;
pub mod config;
pub mod ctl_cli;
pub mod daemon;
pub mod dispatch;
pub mod events;
pub mod launcher;
pub mod process;
pub mod program;
pub mod reaper;
pub mod registry;
pub mod rpc;
pub mod supervisor;
