use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::FmtpSenderConfig;
use crate::delay_queue::ProductIndexDelayQueue;
use crate::error::FmtpError;
use crate::notifier::SendEventNotifier;
use crate::packet_header::{flags, BopMessage, FmtpHeader, AVAIL_BOP_LEN, FMTP_DATA_LEN};
use crate::retx_listener::{ReceiverId, RetxListener};
use crate::retx_metadata::{RetxMetadata, RetxMetadataMap};
use crate::retx_worker::RetxWorker;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::send_pipeline::{open_mcast_socket, set_outbound_interface, McastPipeline, McastSocket};

type WorkerRoster = Arc<Mutex<FxHashMap<ReceiverId, JoinHandle<()>>>>;

/// The FMTP sender: multicasts products to the group and services
/// per-receiver recovery over unicast TCP. See the crate documentation for
/// the protocol description.
///
/// Lifecycle: `new` -> `start` -> `send_product`* -> `stop`. `start` binds
/// the sockets and spawns the retention timer and the accept loop; `stop`
/// tears everything down and surfaces the first fatal error any background
/// task recorded.
///
/// `FmtpSender` is a cheap handle; clones share the same sender.
#[derive(Clone)]
pub struct FmtpSender {
    shared: Arc<SenderShared>,
}

struct SenderShared {
    config: FmtpSenderConfig,
    notifier: Option<Arc<dyn SendEventNotifier>>,
    metadata: Arc<RetxMetadataMap>,
    delay_queue: Arc<ProductIndexDelayQueue>,
    /// advisory link rate in bits per second; 0 = unknown
    link_speed: AtomicU64,
    /// outbound multicast interface, applied at `start()` (and immediately
    /// when already running)
    default_interface: Mutex<Option<Ipv4Addr>>,
    /// serializes `send_product` callers; `None` until `start()`
    pipeline: Mutex<Option<PipelineState>>,
    lifecycle: Mutex<Lifecycle>,
    first_error: Mutex<Option<FmtpError>>,
    shutdown: watch::Sender<bool>,
}

struct PipelineState {
    prod_index: u32,
    mcast: McastPipeline,
    listener: Arc<RetxListener>,
}

enum Lifecycle {
    New,
    Running(RunningState),
    Stopped,
}

struct RunningState {
    listener: Arc<RetxListener>,
    /// the concrete socket behind the pipeline's `McastSocket`, for late
    /// interface changes; absent when tests inject a mock
    udp_socket: Option<Arc<UdpSocket>>,
    timer_handle: JoinHandle<()>,
    accept_handle: JoinHandle<()>,
    workers: WorkerRoster,
}

impl FmtpSender {
    pub fn new(
        config: FmtpSenderConfig,
        notifier: Option<Arc<dyn SendEventNotifier>>,
    ) -> Result<FmtpSender, FmtpError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);

        Ok(FmtpSender {
            shared: Arc::new(SenderShared {
                config,
                notifier,
                metadata: Arc::new(RetxMetadataMap::new()),
                delay_queue: Arc::new(ProductIndexDelayQueue::new()),
                link_speed: AtomicU64::new(0),
                default_interface: Mutex::new(None),
                pipeline: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::New),
                first_error: Mutex::new(None),
                shutdown,
            }),
        })
    }

    /// Binds the recovery listener and the multicast socket, then spawns the
    /// retention timer and the accept loop. Returns immediately. If this
    /// succeeds, `stop()` must be called before the sender is dropped.
    pub async fn start(&self) -> Result<(), FmtpError> {
        let interface = *self.shared.default_interface.lock().await;
        let udp_socket = Arc::new(open_mcast_socket(&self.shared.config, interface)?);
        self.start_with(udp_socket.clone(), Some(udp_socket)).await
    }

    async fn start_with(
        &self,
        mcast_socket: Arc<dyn McastSocket>,
        udp_socket: Option<Arc<UdpSocket>>,
    ) -> Result<(), FmtpError> {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::New) {
            return Err(FmtpError::ConfigFailed(
                "start() called on a sender that was already started".to_string(),
            ));
        }

        let listener =
            Arc::new(RetxListener::bind(shared.config.tcp_addr, shared.config.tcp_port).await?);

        *shared.pipeline.lock().await = Some(PipelineState {
            prod_index: shared.config.init_prod_index,
            mcast: McastPipeline::new(mcast_socket),
            listener: listener.clone(),
        });

        let timer_handle = tokio::spawn(shared.clone().timer_loop());
        let workers: WorkerRoster = Arc::new(Mutex::new(FxHashMap::default()));
        let accept_handle = tokio::spawn(shared.clone().accept_loop(listener.clone(), workers.clone()));

        info!("sender started, recovery port {}", listener.local_port());
        *lifecycle = Lifecycle::Running(RunningState {
            listener,
            udp_socket,
            timer_handle,
            accept_handle,
            workers,
        });
        Ok(())
    }

    /// Stops the sender: disables the retention timer, cancels the accept
    /// loop and all recovery workers, waits for every task, and surfaces the
    /// first fatal error recorded by any of them. A second call is a no-op.
    pub async fn stop(&self) -> Result<(), FmtpError> {
        let shared = &self.shared;
        let state = {
            let mut lifecycle = shared.lifecycle.lock().await;
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(state) => state,
                Lifecycle::New => {
                    *lifecycle = Lifecycle::New;
                    return Ok(());
                }
                Lifecycle::Stopped => return Ok(()),
            }
        };

        shared.begin_shutdown();

        let _ = state.timer_handle.await;
        let _ = state.accept_handle.await;
        let worker_handles: Vec<JoinHandle<()>> = {
            let mut workers = state.workers.lock().await;
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in worker_handles {
            let _ = handle.await;
        }

        *shared.pipeline.lock().await = None;
        info!("sender stopped");

        match shared.first_error.lock().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The local port of the recovery listener, available once `start()`
    /// succeeded. Useful when the configuration requested an OS-chosen port.
    pub async fn local_port(&self) -> Result<u16, FmtpError> {
        match &*self.shared.lifecycle.lock().await {
            Lifecycle::Running(state) => Ok(state.listener.local_port()),
            _ => Err(FmtpError::ConfigFailed(
                "local_port() requires a started sender".to_string(),
            )),
        }
    }

    /// Routes multicast through the interface with the given address.
    pub async fn set_default_interface(&self, interface: Ipv4Addr) -> Result<(), FmtpError> {
        *self.shared.default_interface.lock().await = Some(interface);
        if let Lifecycle::Running(state) = &*self.shared.lifecycle.lock().await {
            if let Some(udp_socket) = &state.udp_socket {
                set_outbound_interface(udp_socket, interface)?;
            }
        }
        Ok(())
    }

    /// Advisory fixed link rate in bits per second, used to floor the
    /// retention window of subsequent products. Zero means unknown.
    pub fn set_link_speed(&self, bits_per_second: u64) {
        self.shared.link_speed.store(bits_per_second, Ordering::Relaxed);
    }

    /// Multicasts one product: BOP, the DATA blocks, then EOP; registers the
    /// retransmission entry and arms its retention timer. Returns the
    /// product's index. Concurrent callers are serialized; products appear on
    /// the wire in call order.
    ///
    /// The sender keeps a handle on `data` until the retention timer fires or
    /// the last receiver confirms reception (`notify_of_eop`).
    pub async fn send_product(&self, data: Bytes, metadata: Option<Bytes>) -> Result<u32, FmtpError> {
        let shared = &self.shared;
        if data.len() > u32::MAX.safe_cast() {
            return Err(FmtpError::InvalidArgument(format!(
                "product of {} bytes exceeds the 32-bit size limit",
                data.len()
            )));
        }
        let metadata = metadata.unwrap_or_else(Bytes::new);
        if metadata.len() > AVAIL_BOP_LEN {
            return Err(FmtpError::InvalidArgument(format!(
                "metadata of {} bytes exceeds the BOP capacity of {AVAIL_BOP_LEN}",
                metadata.len()
            )));
        }

        let mut pipeline = shared.pipeline.lock().await;
        let state = pipeline.as_mut().ok_or_else(|| {
            FmtpError::ConfigFailed("send_product() requires a started sender".to_string())
        })?;

        let prod_index = state.prod_index;
        match shared.multicast_product(state, prod_index, data, metadata).await {
            Ok(()) => {
                let link_speed = shared.link_speed.load(Ordering::Relaxed);
                if let Some(period) = shared.metadata.set_timer_parameters(prod_index, link_speed).await
                {
                    shared.delay_queue.push(prod_index, period);
                }
                state.prod_index = prod_index.wrapping_add(1);
                debug!("product #{prod_index} has been sent");
                Ok(prod_index)
            }
            Err(e) => {
                // the partially published entry stays in the registry until
                // stop(); receivers saw only a partial product and will close
                shared.record_fatal(e.clone()).await;
                Err(e)
            }
        }
    }
}

impl SenderShared {
    async fn multicast_product(
        &self,
        state: &mut PipelineState,
        prod_index: u32,
        data: Bytes,
        metadata: Bytes,
    ) -> Result<(), FmtpError> {
        let prod_length: u32 = data.len().prechecked_cast();
        let meta_size: u16 = metadata.len().prechecked_cast();

        let unfinished = state.listener.connected_receivers().await;
        debug!(
            "product #{prod_index}: {prod_length} bytes, {meta_size} metadata bytes, {} connected receivers",
            unfinished.len()
        );

        self.metadata
            .insert(RetxMetadata {
                prod_index,
                prod_length,
                metadata: metadata.clone(),
                data: data.clone(),
                mcast_start: Instant::now(),
                mcast_end: None,
                retx_timeout_ratio: self.config.retx_timeout_ratio,
                retx_timeout_period: None,
                unfinished,
            })
            .await;

        let bop_header = FmtpHeader {
            prod_index,
            seq_num: 0,
            payload_len: BopMessage::wire_len(meta_size),
            flags: flags::BOP,
        };
        let bop = BopMessage {
            prod_size: prod_length,
            metadata,
        };
        state.mcast.send_bop(&bop_header, &bop).await?;

        let mut seq_num = 0usize;
        while seq_num < data.len() {
            let block_len = (data.len() - seq_num).min(FMTP_DATA_LEN);
            let data_header = FmtpHeader {
                prod_index,
                seq_num: seq_num.prechecked_cast(),
                payload_len: block_len.prechecked_cast(),
                flags: flags::MEM_DATA,
            };
            state.mcast.send_frame(&data_header, &data[seq_num..seq_num + block_len]).await?;
            seq_num += block_len;
        }

        let eop_header = FmtpHeader {
            prod_index,
            seq_num: 0,
            payload_len: 0,
            flags: flags::EOP,
        };
        state.mcast.send_frame(&eop_header, b"").await
    }

    /// Retention timer: evicts each product when its window elapses and lets
    /// the application know. Exits when `stop()` disables the queue.
    async fn timer_loop(self: Arc<Self>) {
        loop {
            let prod_index = match self.delay_queue.pop().await {
                Ok(prod_index) => prod_index,
                Err(_) => return,
            };

            let removed = self.metadata.remove(prod_index).await;
            debug!("retention timer fired for product #{prod_index} (evicted: {removed})");
            if removed {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_of_eop(prod_index).await;
                }
            }
        }
    }

    /// Accepts recovery connections and spawns a worker per receiver. Exits
    /// on shutdown or on an accept failure (which is fatal).
    async fn accept_loop(self: Arc<Self>, listener: Arc<RetxListener>, workers: WorkerRoster) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stopping| *stopping).await; } => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((receiver_id, stream)) => {
                            let handle = tokio::spawn(self.clone().worker_task(
                                listener.clone(),
                                workers.clone(),
                                receiver_id,
                                stream,
                            ));
                            workers.lock().await.insert(receiver_id, handle);
                        }
                        Err(e) => {
                            self.record_fatal(e).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn worker_task(
        self: Arc<Self>,
        listener: Arc<RetxListener>,
        workers: WorkerRoster,
        receiver_id: ReceiverId,
        stream: TcpStream,
    ) {
        let worker = RetxWorker::new(receiver_id, stream, self.metadata.clone(), self.notifier.clone());
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stopping| *stopping).await; } => {
                debug!("recovery worker of receiver {receiver_id} cancelled");
            }
            result = worker.run() => {
                if let Err(e) = result {
                    self.record_fatal(e).await;
                }
            }
        }

        listener.remove(receiver_id).await;
        workers.lock().await.remove(&receiver_id);
    }

    /// Records the first fatal error and signals shutdown. Joining and
    /// surfacing happen in `stop()`; a task never joins itself.
    async fn record_fatal(&self, e: FmtpError) {
        {
            let mut first_error = self.first_error.lock().await;
            if first_error.is_none() {
                error!("fatal error, shutting down: {e}");
                *first_error = Some(e);
            } else {
                debug!("subsequent error suppressed: {e}");
            }
        }
        self.begin_shutdown();
    }

    fn begin_shutdown(&self) {
        self.delay_queue.disable();
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MockSendEventNotifier;
    use crate::send_pipeline::MockMcastSocket;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_config() -> FmtpSenderConfig {
        FmtpSenderConfig::new(Ipv4Addr::LOCALHOST, 0, Ipv4Addr::new(224, 0, 0, 1), 5000)
    }

    async fn started_sender(
        config: FmtpSenderConfig,
        socket: MockMcastSocket,
        notifier: Option<Arc<dyn SendEventNotifier>>,
    ) -> FmtpSender {
        let sender = FmtpSender::new(config, notifier).unwrap();
        sender.start_with(Arc::new(socket), None).await.unwrap();
        sender
    }

    /// decodes `(header, payload)` pairs out of captured datagrams
    fn decode_packets(packets: &[Vec<u8>]) -> Vec<(FmtpHeader, Vec<u8>)> {
        packets
            .iter()
            .map(|packet| {
                let mut buf = packet.as_slice();
                let header = FmtpHeader::deser(&mut buf).unwrap();
                (header, buf.to_vec())
            })
            .collect()
    }

    /// a mock that records every datagram for later inspection
    fn capturing_socket() -> (MockMcastSocket, Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
        let packets: Arc<std::sync::Mutex<Vec<Vec<u8>>>> = Arc::default();
        let mut socket = MockMcastSocket::new();
        let sink = packets.clone();
        socket.expect_send_packet().returning(move |buf| {
            sink.lock().unwrap().push(buf.to_vec());
            Ok(())
        });
        (socket, packets)
    }

    #[tokio::test]
    async fn test_tiny_product_emits_bop_data_eop() {
        let mut socket = MockMcastSocket::new();
        let mut seq = Sequence::new();
        socket
            .expect_send_packet()
            .with(eq(vec![
                0, 0, 0, 0, 0, 0, 0, 0, 0, 6, 0, 1, 0, 0, 0, 0, // BOP header
                0, 0, 0, 5, 0, 0, // prod_size=5, meta_size=0
            ]))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        socket
            .expect_send_packet()
            .with(eq(vec![
                0, 0, 0, 0, 0, 0, 0, 0, 0, 5, 0, 2, 0, 0, 0, 0, // DATA header
                b'h', b'e', b'l', b'l', b'o',
            ]))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        socket
            .expect_send_packet()
            .with(eq(vec![
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 0, // EOP header
            ]))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let sender = started_sender(test_config(), socket, None).await;
        // keep the entry alive while asserting on it
        sender.set_link_speed(1);

        let prod_index = sender.send_product(Bytes::from_static(b"hello"), None).await.unwrap();
        assert_eq!(prod_index, 0);

        let entry = sender.shared.metadata.lookup(0).await.unwrap();
        assert_eq!(entry.prod_length, 5);
        assert!(entry.retx_timeout_period.is_some());

        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_product_indexes_increment_per_call() {
        let (socket, _packets) = capturing_socket();
        let sender = started_sender(test_config().init_prod_index(41), socket, None).await;
        sender.set_link_speed(1);

        assert_eq!(sender.send_product(Bytes::from_static(b"a"), None).await.unwrap(), 41);
        assert_eq!(sender.send_product(Bytes::from_static(b"b"), None).await.unwrap(), 42);

        sender.stop().await.unwrap();
    }

    #[rstest::rstest]
    #[case::empty_product(0, 0)]
    #[case::one_byte(1, 1)]
    #[case::one_full_block(FMTP_DATA_LEN, 1)]
    #[case::one_byte_overspill(FMTP_DATA_LEN + 1, 2)]
    #[case::two_full_blocks(2 * FMTP_DATA_LEN, 2)]
    #[tokio::test]
    async fn test_data_block_boundaries(#[case] data_size: usize, #[case] expected_blocks: usize) {
        let (socket, packets) = capturing_socket();
        let sender = started_sender(test_config(), socket, None).await;
        sender.set_link_speed(1);

        sender.send_product(Bytes::from(vec![b'A'; data_size]), None).await.unwrap();
        sender.stop().await.unwrap();

        let decoded = decode_packets(&packets.lock().unwrap());
        assert_eq!(decoded.len(), 2 + expected_blocks);

        let (bop, _) = &decoded[0];
        assert_eq!(bop.flags, flags::BOP);

        let mut expected_seq = 0usize;
        for (header, payload) in &decoded[1..1 + expected_blocks] {
            assert_eq!(header.flags, flags::MEM_DATA);
            assert_eq!(header.seq_num as usize, expected_seq);
            assert!(payload.len() <= FMTP_DATA_LEN);
            assert_eq!(header.payload_len as usize, payload.len());
            expected_seq += payload.len();
        }
        assert_eq!(expected_seq, data_size);

        let (eop, eop_payload) = &decoded[2 + expected_blocks - 1];
        assert_eq!(eop.flags, flags::EOP);
        assert!(eop_payload.is_empty());
    }

    #[rstest::rstest]
    #[case::no_metadata(0)]
    #[case::max_metadata(AVAIL_BOP_LEN)]
    #[tokio::test]
    async fn test_bop_metadata_boundaries(#[case] meta_size: usize) {
        let (socket, packets) = capturing_socket();
        let sender = started_sender(test_config(), socket, None).await;
        sender.set_link_speed(1);

        let metadata = (meta_size > 0).then(|| Bytes::from(vec![b'm'; meta_size]));
        sender.send_product(Bytes::from_static(b"x"), metadata).await.unwrap();
        sender.stop().await.unwrap();

        let decoded = decode_packets(&packets.lock().unwrap());
        let (bop_header, bop_payload) = &decoded[0];
        assert_eq!(bop_header.payload_len as usize, meta_size + 6);
        assert_eq!(bop_payload.len(), meta_size + 6);

        let bop = BopMessage::deser(&mut bop_payload.as_slice()).unwrap();
        assert_eq!(bop.prod_size, 1);
        assert_eq!(bop.metadata.len(), meta_size);
    }

    #[tokio::test]
    async fn test_oversize_metadata_is_rejected_without_side_effects() {
        let (socket, packets) = capturing_socket();
        let sender = started_sender(test_config(), socket, None).await;

        let result = sender
            .send_product(
                Bytes::from_static(b"x"),
                Some(Bytes::from(vec![0u8; AVAIL_BOP_LEN + 1])),
            )
            .await;
        assert!(matches!(result, Err(FmtpError::InvalidArgument(_))));
        assert!(packets.lock().unwrap().is_empty());
        assert!(sender.shared.metadata.lookup(0).await.is_none());

        // the sender is undisturbed and can still send
        sender.send_product(Bytes::from_static(b"x"), None).await.unwrap();
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_product_before_start_fails() {
        let sender = FmtpSender::new(test_config(), None).unwrap();
        let result = sender.send_product(Bytes::from_static(b"x"), None).await;
        assert!(matches!(result, Err(FmtpError::ConfigFailed(_))));
    }

    #[tokio::test]
    async fn test_timer_evicts_and_notifies_once() {
        let (socket, _packets) = capturing_socket();

        let mut notifier = MockSendEventNotifier::new();
        notifier
            .expect_notify_of_eop()
            .with(eq(0u32))
            .times(1)
            .returning(|_| ());

        let sender = started_sender(
            test_config().retx_timeout_ratio(0.0),
            socket,
            Some(Arc::new(notifier)),
        )
        .await;

        sender.send_product(Bytes::from_static(b"hello"), None).await.unwrap();

        // ratio 0 arms an immediately-due timer; wait for the eviction
        let mut evicted = false;
        for _ in 0..100 {
            if sender.shared.metadata.lookup(0).await.is_none() {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(evicted);

        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_egress_failure_fails_send_and_stop_with_same_kind() {
        let mut socket = MockMcastSocket::new();
        let mut seq = Sequence::new();
        // BOP succeeds, the first DATA block fails
        socket
            .expect_send_packet()
            .withf(|buf| buf[10..12] == [0, 1])
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        socket
            .expect_send_packet()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Err(std::io::Error::other("ENETDOWN")));

        let sender = started_sender(test_config(), socket, None).await;

        let result = sender.send_product(Bytes::from_static(b"hello"), None).await;
        assert!(matches!(result, Err(FmtpError::EgressFailed(_))));

        // the partially published entry stays until stop()
        assert!(sender.shared.metadata.lookup(0).await.is_some());

        let stopped = sender.stop().await;
        assert!(matches!(stopped, Err(FmtpError::EgressFailed(_))));

        // idempotence: the second stop is a clean no-op
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_twice_is_a_noop() {
        let (socket, _packets) = capturing_socket();
        let sender = started_sender(test_config(), socket, None).await;

        sender.stop().await.unwrap();
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_noop() {
        let sender = FmtpSender::new(test_config(), None).unwrap();
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (socket, _packets) = capturing_socket();
        let sender = started_sender(test_config(), socket, None).await;

        let again = sender.start_with(Arc::new(MockMcastSocket::new()), None).await;
        assert!(matches!(again, Err(FmtpError::ConfigFailed(_))));

        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_port_lifecycle() {
        let (socket, _packets) = capturing_socket();
        let sender = FmtpSender::new(test_config(), None).unwrap();

        assert!(matches!(sender.local_port().await, Err(FmtpError::ConfigFailed(_))));

        sender.start_with(Arc::new(socket), None).await.unwrap();
        assert_ne!(sender.local_port().await.unwrap(), 0);

        sender.stop().await.unwrap();
        assert!(matches!(sender.local_port().await, Err(FmtpError::ConfigFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = FmtpSender::new(test_config().retx_timeout_ratio(-2.0), None);
        assert!(matches!(result, Err(FmtpError::ConfigFailed(_))));
    }
}
