use std::net::Ipv4Addr;

use crate::error::FmtpError;

/// Default scaling of the measured multicast period into a product's
/// retention window.
pub const DEFAULT_RETX_TIMEOUT_RATIO: f32 = 20.0;

/// Configuration of an FMTP sender.
///
/// The addresses are what the sender *uses*, not what it assumes about the
/// network: the recovery listener binds `tcp_addr:tcp_port`, and every
/// multicast datagram is sent to `mcast_addr:mcast_port`. Receivers are
/// expected to join that group and to connect back to the listener for
/// recovery.
#[derive(Clone, Debug)]
pub struct FmtpSenderConfig {
    /// Interface address the TCP recovery listener binds to.
    pub tcp_addr: Ipv4Addr,
    /// Recovery listener port. 0 lets the operating system choose; the
    /// effective port is available through `local_port()` after `start()`.
    pub tcp_port: u16,
    /// Multicast group address.
    pub mcast_addr: Ipv4Addr,
    /// Multicast group port.
    pub mcast_port: u16,
    /// First product index handed out by `send_product`. Receiving
    /// applications may seed this to resume an index sequence.
    pub init_prod_index: u32,
    /// Scales the measured multicast period of a product into its retention
    /// window. Trades recovery robustness (large values) against memory held
    /// per product (small values). 0 evicts immediately after the EOP.
    pub retx_timeout_ratio: f32,
    /// Multicast time-to-live. The default of 1 keeps traffic on the local
    /// subnet.
    pub ttl: u32,
}

impl FmtpSenderConfig {
    pub fn new(
        tcp_addr: Ipv4Addr,
        tcp_port: u16,
        mcast_addr: Ipv4Addr,
        mcast_port: u16,
    ) -> FmtpSenderConfig {
        FmtpSenderConfig {
            tcp_addr,
            tcp_port,
            mcast_addr,
            mcast_port,
            init_prod_index: 0,
            retx_timeout_ratio: DEFAULT_RETX_TIMEOUT_RATIO,
            ttl: 1,
        }
    }

    pub fn init_prod_index(mut self, init_prod_index: u32) -> FmtpSenderConfig {
        self.init_prod_index = init_prod_index;
        self
    }

    pub fn retx_timeout_ratio(mut self, retx_timeout_ratio: f32) -> FmtpSenderConfig {
        self.retx_timeout_ratio = retx_timeout_ratio;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> FmtpSenderConfig {
        self.ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), FmtpError> {
        if !self.retx_timeout_ratio.is_finite() || self.retx_timeout_ratio < 0.0 {
            return Err(FmtpError::ConfigFailed(format!(
                "retransmission timeout ratio must be finite and non-negative, was {}",
                self.retx_timeout_ratio
            )));
        }
        Ok(())
    }
}
