//! Partitioned socket event dispatch for an eBPF network profiling agent.
//!
//! Kernel sources are read by an [`tracer::EventLoader`], decoded into
//! [`tracer::event::SocketEvent`]s and routed by connection id into a
//! [`queue::EventQueue`], whose per-partition workers feed one analyzer
//! each. The [`listener::Listener`] ties these together and broadcasts
//! control signals to every analyzer.

pub mod agent;
pub mod analyze;
pub mod config;
pub mod export;
pub mod listener;
pub mod queue;
pub mod tracer;
