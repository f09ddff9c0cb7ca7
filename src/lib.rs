//! Reliable delivery of application-level messages over a transport that only
//!  carries small, unordered, unreliable frames - the situation a BLE
//!  characteristic write gives you: a couple hundred bytes per write, frames
//!  that get lost or corrupted, and no ordering guarantees across writes.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data), not streams of bytes
//! * Messages are split into *parcels* that each fit into a single transport
//!   frame; the protocol takes care of chunking, buffering and re-assembly
//! * Delivery is confirmed end-to-end: the receiver reconstructs the message,
//!   verifies a payload checksum and sends a *receipt*
//! * Recovery is receiver-driven and selective - a receiver that is missing
//!   parcels asks for exactly those, and only a failed checksum forces a full
//!   resend
//! * Sending is paced for a shared half-duplex medium: a configurable delay
//!   between parcels and a periodic listen window so the peer gets channel
//!   time for receipts
//! * Messages to the same device are delivered one at a time, in the order
//!   they were queued; different devices are independent
//! * The protocol is symmetric - both sides can send and receive - and it is
//!   agnostic of the actual BLE plumbing, which is injected as a callback for
//!   sending and a method call for receiving
//!
//! ## Wire format
//!
//! Every frame starts with a kind discriminator so that header parcels, data
//!  parcels and receipts can never be confused, whatever their length. All
//!  numbers are in network byte order (BE).
//!
//! Header parcel (one per message, carries everything needed to judge
//!  completeness and integrity):
//! ```ascii
//!  0: frame kind (u8) = 1
//!  1: message id (16 bytes, UUID)
//! 17: total number of data parcels (u32)
//! 21: payload checksum (u32, CRC-32/ISO-HDLC over the complete payload)
//! 25: flags (u8) - bit 0: payload is compressed
//! 26: compression algorithm (u8) - present only if the compressed bit is set
//! ```
//!
//! Data parcel:
//! ```ascii
//!  0: frame kind (u8) = 2
//!  1: message id (16 bytes, UUID)
//! 17: parcel number (u32), zero-based
//! 21: payload chunk - the rest of the frame
//! ```
//!
//! Receipt:
//! ```ascii
//!  0: frame kind (u8) = 3
//!  1: message id (16 bytes, UUID)
//! 17: status (u8) - 0: complete, 1: missing parcels, 2: checksum failed
//! 18: for status 1: number of missing parcels (varint), followed by one
//!      parcel number (u32) each
//! ```
//!
//! ## Protocol flow
//!
//! The sender emits the header parcel followed by the data parcels as one
//!  paced burst, then waits for a receipt. `complete` finishes the message;
//!  `missing` triggers a selective resend of just the named parcels (without
//!  the header); `checksum failed` voids the attempt and triggers a full
//!  resend including the header. Silence is handled by timeouts on the sender
//!  side and, on the receiver side, by housekeeping that proactively requests
//!  missing parcels for stalled messages and eventually abandons messages
//!  that stopped making progress.
//!
//! Receipts themselves are not acknowledged. A lost `complete` receipt makes
//!  the sender re-send parcels the receiver no longer cares about; the
//!  receiver answers duplicate headers and data of an already-completed
//!  message with nothing, and the sender gives up after its retry budget.

pub mod config;
pub mod endpoint;
mod frame;
pub mod housekeeping;
pub mod ids;
pub mod message_dispatcher;
pub mod parcel;
pub mod parcel_sink;
pub mod reassembly;
pub mod receipt;
pub mod send_pipeline;

#[cfg(test)]
pub(crate) mod test_util;
