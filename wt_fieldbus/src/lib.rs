//! WT-RTU Fieldbus Adapter
//!
//! IO-Device participant of the cyclic industrial fieldbus. The vendor
//! protocol stack is an external collaborator; this crate implements the
//! device side of its callback contract:
//!
//! - [`iodata`] - 4-byte cyclic IO-data codecs and the per-slot buffers
//! - [`im`] - Identification & Maintenance records (I&M0)
//! - [`stack`] - The callback contract and the loopback test stack
//! - [`adapter`] - The connection state machine joining the stack to
//!   the sensor table and actuator queue

pub mod adapter;
pub mod im;
pub mod iodata;
pub mod stack;
