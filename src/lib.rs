//! Sender core of FMTP (File Multicast Transport Protocol, v3): a reliable
//! one-to-many bulk data transport layered over UDP multicast for the fan-out
//! path and TCP unicast for recovery.
//!
//! ## Design goals
//!
//! * One sender, many receivers: the sender multicasts a sequence of opaque
//!   byte *products* to the group and is open-loop on that path - no flow
//!   control is signalled back from receivers
//! * Reliability comes from recovery, not from the multicast path: each
//!   receiver keeps a dedicated TCP connection to the sender and requests
//!   whatever it missed
//! * Per-product state on the sender lives only as long as some receiver
//!   might still ask for it: a retention timer derived from the measured
//!   multicast duration (scaled by a configurable ratio) bounds every
//!   product's lifetime, and a receiver that confirms complete reception
//!   shrinks the product's unfinished set
//! * Products are independent of each other; there is no ordering guarantee
//!   across products beyond their multicast emission order
//!
//! ## Wire format
//!
//! Every frame on both wires starts with the same fixed 16-byte header, all
//! fields big-endian:
//!
//! ```ascii
//!  0: product index (u32)
//!  4: sequence number (u32) - byte offset into the product for data frames,
//!      0 for control frames
//!  8: payload length (u16) - bytes following the header
//! 10: flags (u16) - exactly one of the frame kinds below
//! 12: reserved (4 bytes, zero)
//! ```
//!
//! Multicast frames per product, in order:
//!
//! * *BOP* (0x0001) - beginning of product. Payload: product size (u32),
//!   metadata size (u16), then up to 1436 bytes of opaque application
//!   metadata.
//! * *MEM_DATA* (0x0002) - one data block of up to 1442 bytes; the sequence
//!   number is the block's byte offset into the product. Only the last block
//!   of a product may be short.
//! * *EOP* (0x0004) - end of product, no payload.
//!
//! Recovery frames (receiver to sender, header-only):
//!
//! * *RETX_REQ* (0x0008) - retransmit the blocks covering
//!   `[seq_num, seq_num + payload_len)`
//! * *BOP_REQ* (0x0040) / *EOP_REQ* (0x0100) - retransmit the BOP / EOP
//! * *RETX_END* (0x0400) - the receiver has the complete product
//!
//! Recovery frames (sender to receiver):
//!
//! * *RETX_DATA* (0x0020) - a retransmitted data block, same layout as
//!   MEM_DATA
//! * *RETX_BOP* (0x0080) / *RETX_EOP* (0x0200) - the retransmitted control
//!   frame
//! * *RETX_REJ* (0x0010) - the product has already been released; the
//!   receiver should give up on it
//!
//! ## Concurrency
//!
//! [`sender::FmtpSender`] runs one accept loop for the recovery listener, one
//! recovery worker task per connected receiver, and a single retention-timer
//! task consuming the [`delay_queue::ProductIndexDelayQueue`]. `send_product`
//! runs on the caller's task and is internally serialized. The first fatal
//! error of any task is recorded and triggers a supervised shutdown; `stop()`
//! joins everything and returns that first cause.

pub mod config;
pub mod delay_queue;
pub mod error;
pub mod notifier;
pub mod packet_header;
pub mod sender;

mod retx_listener;
mod retx_metadata;
mod retx_worker;
mod safe_converter;
mod send_pipeline;
