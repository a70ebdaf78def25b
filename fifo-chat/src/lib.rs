//! Chat broker for processes on one machine, talking over named FIFOs.
//!
//! Every client writes fixed-size frames into one shared FIFO. The broker
//! reads them one at a time, tracks who is connected, and copies each chat
//! frame into the private FIFO of every other client.
//!
//! - [`frame`] is the fixed-width wire format shared by both sides.
//! - [`registry`] keeps the connected clients and their reply FIFOs.
//! - [`broker`] runs the read/dispatch loop and the best-effort fan-out.
//! - [`transport`] defines the inbox/outbox seams and their FIFO versions.
//! - [`client`] is the terminal participant: stdin in, private FIFO out.
//! - [`cli`] parses the command-line interface for both modes.
//!
//! Delivery is at most once. A recipient whose FIFO is missing, has no
//! reader, or is full simply misses that frame; the broker never waits on it.

pub mod broker;
pub mod cli;
pub mod client;
pub mod frame;
pub mod registry;
pub mod transport;
