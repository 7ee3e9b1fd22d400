use std::io::ErrorKind;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::error::FmtpError;
use crate::notifier::SendEventNotifier;
use crate::packet_header::{flags, BopMessage, FmtpHeader, FMTP_DATA_LEN, FMTP_HEADER_LEN};
use crate::retx_listener::ReceiverId;
use crate::retx_metadata::{RetxMetadata, RetxMetadataMap};
use crate::safe_converter::PrecheckedCast;

const BLOCK_LEN: u32 = FMTP_DATA_LEN as u32;

/// Services the recovery requests of one receiver on its TCP stream.
///
/// The loop reads a 16-byte request header, looks the product up in the
/// registry and answers on the same stream: requested data blocks, a
/// retransmitted BOP/EOP, or a rejection once the product has been evicted.
/// `RETX_END` shrinks the product's unfinished set and may drain it.
///
/// Generic over the stream so tests can drive it with an in-process duplex
/// pipe.
pub struct RetxWorker<S> {
    receiver_id: ReceiverId,
    stream: S,
    metadata: Arc<RetxMetadataMap>,
    notifier: Option<Arc<dyn SendEventNotifier>>,
    send_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RetxWorker<S> {
    pub fn new(
        receiver_id: ReceiverId,
        stream: S,
        metadata: Arc<RetxMetadataMap>,
        notifier: Option<Arc<dyn SendEventNotifier>>,
    ) -> RetxWorker<S> {
        RetxWorker {
            receiver_id,
            stream,
            metadata,
            notifier,
            send_buf: BytesMut::with_capacity(FMTP_HEADER_LEN + FMTP_DATA_LEN),
        }
    }

    /// Runs the request loop. `Ok(())` means the peer closed the connection;
    /// an error is fatal and is routed into the supervisor's funnel by the
    /// caller.
    pub async fn run(mut self) -> Result<(), FmtpError> {
        let mut header_buf = [0u8; FMTP_HEADER_LEN];
        loop {
            match self.stream.read_exact(&mut header_buf).await {
                Ok(_) => {}
                Err(e) if is_peer_close(&e) => {
                    debug!("receiver {} closed the recovery connection", self.receiver_id);
                    return Ok(());
                }
                Err(e) => {
                    return Err(FmtpError::EgressFailed(format!(
                        "reading recovery request of receiver {}: {e}",
                        self.receiver_id
                    )));
                }
            }
            let header = FmtpHeader::deser(&mut header_buf.as_slice())?;

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::DEBUG, "retx_request", receiver = %self.receiver_id, ?correlation_id);
            self.dispatch(header).instrument(span).await?;
        }
    }

    async fn dispatch(&mut self, header: FmtpHeader) -> Result<(), FmtpError> {
        trace!("request {header:?}");
        let meta = self.metadata.lookup(header.prod_index).await;

        match header.flags {
            flags::RETX_REQ => match meta {
                Some(meta) => self.retransmit(&header, &meta).await,
                None => self.send_reject(header.prod_index).await,
            },
            flags::BOP_REQ => match meta {
                Some(meta) => self.retransmit_bop(&meta).await,
                None => self.send_reject(header.prod_index).await,
            },
            flags::EOP_REQ => match meta {
                Some(meta) => self.retransmit_eop(meta.prod_index).await,
                None => self.send_reject(header.prod_index).await,
            },
            flags::RETX_END => {
                if meta.is_some() {
                    let drained = self
                        .metadata
                        .clear_receiver(header.prod_index, self.receiver_id)
                        .await;
                    if drained {
                        if let Some(notifier) = &self.notifier {
                            notifier.notify_of_eop(header.prod_index).await;
                        }
                    }
                }
                Ok(())
            }
            other => Err(FmtpError::MalformedHeader(format!(
                "receiver {} sent a request with unexpected flags {other:#06x}",
                self.receiver_id
            ))),
        }
    }

    /// Retransmits the data blocks covering the requested byte range. The
    /// range is widened to whole blocks (requests start on block boundaries
    /// anyway) and clamped to the product; only the product's last block may
    /// be short.
    async fn retransmit(&mut self, request: &FmtpHeader, meta: &RetxMetadata) -> Result<(), FmtpError> {
        if request.payload_len == 0 {
            return Ok(());
        }

        let start = (request.seq_num / BLOCK_LEN) * BLOCK_LEN;
        let requested_end = u64::from(request.seq_num) + u64::from(request.payload_len);
        let block_end = requested_end.div_ceil(u64::from(BLOCK_LEN)) * u64::from(BLOCK_LEN);
        let out: u32 = u64::from(meta.prod_length).min(block_end).prechecked_cast();

        if start >= out {
            debug!(
                "retransmission request at offset {} is beyond product #{} of {} bytes",
                request.seq_num, meta.prod_index, meta.prod_length
            );
            return Ok(());
        }

        let mut offset = start;
        while offset < out {
            let block_len = (out - offset).min(BLOCK_LEN);
            let header = FmtpHeader {
                prod_index: meta.prod_index,
                seq_num: offset,
                payload_len: block_len.prechecked_cast(),
                flags: flags::RETX_DATA,
            };
            let block = &meta.data[offset as usize..(offset + block_len) as usize];
            self.send_frame(&header, block).await?;
            trace!("retransmitted block at offset {offset} of product #{}", meta.prod_index);
            offset += block_len;
        }
        Ok(())
    }

    async fn retransmit_bop(&mut self, meta: &RetxMetadata) -> Result<(), FmtpError> {
        let header = FmtpHeader {
            prod_index: meta.prod_index,
            seq_num: 0,
            payload_len: BopMessage::wire_len(meta.meta_size()),
            flags: flags::RETX_BOP,
        };
        let bop = BopMessage {
            prod_size: meta.prod_length,
            metadata: meta.metadata.clone(),
        };

        self.send_buf.clear();
        header.ser(&mut self.send_buf);
        bop.ser(&mut self.send_buf);
        self.flush().await?;

        debug!("retransmitted BOP of product #{}", meta.prod_index);
        Ok(())
    }

    async fn retransmit_eop(&mut self, prod_index: u32) -> Result<(), FmtpError> {
        let header = FmtpHeader {
            prod_index,
            seq_num: 0,
            payload_len: 0,
            flags: flags::RETX_EOP,
        };
        self.send_frame(&header, b"").await?;

        debug!("retransmitted EOP of product #{prod_index}");
        Ok(())
    }

    /// The product was evicted (retention timeout or fully drained); reject
    /// the request so the receiver can give up on it.
    async fn send_reject(&mut self, prod_index: u32) -> Result<(), FmtpError> {
        let header = FmtpHeader {
            prod_index,
            seq_num: 0,
            payload_len: 0,
            flags: flags::RETX_REJ,
        };
        self.send_frame(&header, b"").await?;

        debug!("rejected recovery request for evicted product #{prod_index}");
        Ok(())
    }

    async fn send_frame(&mut self, header: &FmtpHeader, payload: &[u8]) -> Result<(), FmtpError> {
        self.send_buf.clear();
        header.ser(&mut self.send_buf);
        self.send_buf.put_slice(payload);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), FmtpError> {
        self.stream.write_all(&self.send_buf).await.map_err(|e| {
            FmtpError::EgressFailed(format!(
                "retransmission write to receiver {}: {e}",
                self.receiver_id
            ))
        })
    }
}

fn is_peer_close(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}
