use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Callback into the sending application.
///
/// `notify_of_eop` is invoked at most once per product, from whichever task
/// evicts the product's retransmission entry: the retention timer, or the
/// recovery worker that drained the last unfinished receiver. Once it fires
/// (or `stop()` returns), the application is free to release the product's
/// buffer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendEventNotifier: Send + Sync + 'static {
    async fn notify_of_eop(&self, prod_index: u32);
}
