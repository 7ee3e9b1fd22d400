use bytes::{Buf, BufMut, Bytes};

use crate::error::FmtpError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Payload bytes carried by a full DATA datagram. Chosen so that a datagram
/// with its packet header fits a 1500-byte MTU under UDP/IPv4.
pub const FMTP_DATA_LEN: usize = 1442;

/// Metadata capacity of a BOP body: `prod_size` and `meta_size` take 6 of the
/// datagram's payload bytes.
pub const AVAIL_BOP_LEN: usize = FMTP_DATA_LEN - 6;

/// On-wire size of the fixed packet header.
pub const FMTP_HEADER_LEN: usize = 16;

/// Frame flags. Exactly one is set per packet.
pub mod flags {
    /// beginning-of-product control frame (multicast)
    pub const BOP: u16 = 0x0001;
    /// product data block (multicast)
    pub const MEM_DATA: u16 = 0x0002;
    /// end-of-product control frame (multicast)
    pub const EOP: u16 = 0x0004;
    /// receiver requests retransmission of a byte range
    pub const RETX_REQ: u16 = 0x0008;
    /// sender rejects a recovery request for an evicted product
    pub const RETX_REJ: u16 = 0x0010;
    /// retransmitted data block (recovery stream)
    pub const RETX_DATA: u16 = 0x0020;
    /// receiver requests retransmission of the BOP
    pub const BOP_REQ: u16 = 0x0040;
    /// retransmitted BOP (recovery stream)
    pub const RETX_BOP: u16 = 0x0080;
    /// receiver requests retransmission of the EOP
    pub const EOP_REQ: u16 = 0x0100;
    /// retransmitted EOP (recovery stream)
    pub const RETX_EOP: u16 = 0x0200;
    /// receiver confirms complete reception of a product
    pub const RETX_END: u16 = 0x0400;
}

/// The fixed packet header shared by the multicast and recovery wires.
///
/// 16 bytes on the wire, all fields big-endian: `prod_index`, `seq_num`,
/// `payload_len`, `flags`, then four reserved bytes (zero on send, ignored on
/// receive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FmtpHeader {
    pub prod_index: u32,
    /// byte offset into the product for DATA frames, 0 for control frames
    pub seq_num: u32,
    pub payload_len: u16,
    pub flags: u16,
}

impl FmtpHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.prod_index);
        buf.put_u32(self.seq_num);
        buf.put_u16(self.payload_len);
        buf.put_u16(self.flags);
        buf.put_u32(0);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FmtpHeader, FmtpError> {
        let prod_index = buf.try_get_u32().map_err(|_| truncated("packet header"))?;
        let seq_num = buf.try_get_u32().map_err(|_| truncated("packet header"))?;
        let payload_len = buf.try_get_u16().map_err(|_| truncated("packet header"))?;
        let flags = buf.try_get_u16().map_err(|_| truncated("packet header"))?;
        let _reserved = buf.try_get_u32().map_err(|_| truncated("packet header"))?;

        Ok(FmtpHeader {
            prod_index,
            seq_num,
            payload_len,
            flags,
        })
    }
}

/// Beginning-of-product body: the product's total size, the metadata size and
/// the opaque application metadata itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BopMessage {
    pub prod_size: u32,
    pub metadata: Bytes,
}

impl BopMessage {
    /// On-wire length of a BOP body carrying `meta_size` metadata bytes. This
    /// is the `payload_len` of the enclosing BOP / RETX_BOP frame.
    pub fn wire_len(meta_size: u16) -> u16 {
        meta_size + 6
    }

    pub fn meta_size(&self) -> u16 {
        self.metadata.len().prechecked_cast()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.prod_size);
        buf.put_u16(self.meta_size());
        buf.put_slice(&self.metadata);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<BopMessage, FmtpError> {
        let prod_size = buf.try_get_u32().map_err(|_| truncated("BOP body"))?;
        let meta_size = buf.try_get_u16().map_err(|_| truncated("BOP body"))?;

        if meta_size.safe_cast() > AVAIL_BOP_LEN {
            return Err(FmtpError::MalformedHeader(format!(
                "BOP declares {meta_size} metadata bytes, exceeding the capacity of {AVAIL_BOP_LEN}"
            )));
        }
        if buf.remaining() < meta_size.safe_cast() {
            return Err(truncated("BOP metadata"));
        }
        let metadata = buf.copy_to_bytes(meta_size.safe_cast());

        Ok(BopMessage {
            prod_size,
            metadata,
        })
    }
}

fn truncated(what: &str) -> FmtpError {
    FmtpError::MalformedHeader(format!("truncated {what}"))
}
