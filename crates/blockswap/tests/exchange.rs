//! Single-node exchange behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blockswap::core::{Block, BlockId, PeerId, WantEntry};
use blockswap::ledger::{EnvelopeSlot, Ledger, LedgerReceipt, Outbox};
use blockswap::net::{
    BlockMessage, MemoryAdapter, MemoryNetwork, MemoryNetworkConfig, Network, NetworkEvent,
    Result as NetResult,
};
use blockswap::store::{BlockStore, MemoryBlockStore, PutResult, StoreError};
use blockswap::{with_timeout, Exchange, ExchangeConfig, ExchangeError};

const WAIT: Duration = Duration::from_secs(2);

fn block(label: &str) -> Block {
    Block::new(label.as_bytes().to_vec())
}

fn config() -> ExchangeConfig {
    ExchangeConfig::default()
        .with_provider_search_delay(Duration::from_millis(20))
        .with_provider_request_timeout(Duration::from_millis(500))
        .with_task_workers(2)
}

async fn node(
    net: &Arc<MemoryNetwork>,
    config: ExchangeConfig,
) -> (Exchange, Arc<MemoryBlockStore>) {
    let adapter = net.adapter(PeerId::random()).await;
    let store = Arc::new(MemoryBlockStore::new());
    let exchange = Exchange::with_engine(config, Arc::new(adapter), store.clone());
    (exchange, store)
}

async fn single() -> (Exchange, Arc<MemoryBlockStore>) {
    node(&MemoryNetwork::new(), config()).await
}

/// Poll `check` until it holds or `WAIT` elapses.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_empty_request_yields_closed_stream() {
    let (exchange, _) = single().await;
    let mut rx = exchange
        .get_blocks(&CancellationToken::new(), Vec::new())
        .await
        .unwrap();
    assert!(rx.recv().await.is_none());
    assert!(exchange.get_wantlist().is_empty());
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_requests_after_close_fail() {
    let (exchange, _) = single().await;
    exchange.close().await.unwrap();
    assert!(exchange.is_closed());

    let err = exchange
        .get_blocks(&CancellationToken::new(), vec![block("x").id()])
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Closed));
    assert!(matches!(
        exchange.has_block(block("x")).await,
        Err(ExchangeError::Closed)
    ));
    // Closing twice is harmless.
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_local_block_skips_search_delay() {
    let net = MemoryNetwork::new();
    let config = config().with_provider_search_delay(Duration::from_secs(60));
    let (exchange, _) = node(&net, config).await;
    let x = block("local");
    exchange.has_block(x.clone()).await.unwrap();

    let got = tokio::time::timeout(
        Duration::from_millis(500),
        exchange.get_block(&CancellationToken::new(), x.id()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(got, x);
    assert!(exchange.get_wantlist().is_empty());
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_has_block_wakes_pending_fetch() {
    let (exchange, store) = single().await;
    let x = block("later");
    let y = block("also later");
    let mut rx = exchange
        .get_blocks(&CancellationToken::new(), vec![x.id(), y.id()])
        .await
        .unwrap();

    let mut wanted = exchange.get_wantlist();
    wanted.sort();
    let mut expected = vec![x.id(), y.id()];
    expected.sort();
    assert_eq!(wanted, expected);

    exchange.has_block(y.clone()).await.unwrap();
    exchange.has_block(x.clone()).await.unwrap();

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, y);
    assert_eq!(second, x);
    assert!(rx.recv().await.is_none());

    assert!(store.has(&x.id()).await.unwrap());
    assert!(eventually(|| exchange.get_wantlist().is_empty()).await);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_ids_delivered_once() {
    let (exchange, _) = single().await;
    let x = block("dup id");
    let mut rx = exchange
        .get_blocks(&CancellationToken::new(), vec![x.id(), x.id()])
        .await
        .unwrap();
    exchange.has_block(x.clone()).await.unwrap();

    assert_eq!(rx.recv().await, Some(x));
    assert!(rx.recv().await.is_none());
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_retracts_wants() {
    let (exchange, _) = single().await;
    let x = block("never arrives").id();
    let cancel = CancellationToken::new();
    let mut rx = exchange.get_blocks(&cancel, vec![x]).await.unwrap();
    assert_eq!(exchange.get_wantlist(), vec![x]);

    cancel.cancel();
    assert!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert!(eventually(|| exchange.get_wantlist().is_empty()).await);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_want_survives_until_last_session_cancels() {
    let (exchange, _) = single().await;
    let x = block("shared want").id();
    let first = CancellationToken::new();
    let second = CancellationToken::new();
    let mut rx1 = exchange.get_blocks(&first, vec![x]).await.unwrap();
    let mut rx2 = exchange.get_blocks(&second, vec![x]).await.unwrap();

    first.cancel();
    assert!(rx1.recv().await.is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exchange.get_wantlist(), vec![x]);

    second.cancel();
    assert!(rx2.recv().await.is_none());
    assert!(eventually(|| exchange.get_wantlist().is_empty()).await);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_get_block_deadline_returns_cancelled() {
    let (exchange, _) = single().await;
    let cancel = with_timeout(&CancellationToken::new(), Duration::from_millis(50));
    let err = exchange
        .get_block(&cancel, block("missing").id())
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::Cancelled));
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_receipt_counters() {
    let (exchange, store) = single().await;
    let peer = PeerId::random();
    let x = block("twice");

    exchange
        .receive_message(peer, BlockMessage::with_blocks([x.clone()]))
        .await
        .unwrap();
    exchange
        .receive_message(peer, BlockMessage::with_blocks([x.clone()]))
        .await
        .unwrap();

    let counters = exchange.stat().counters;
    assert_eq!(counters.messages_received, 2);
    assert_eq!(counters.blocks_received, 2);
    assert_eq!(counters.dup_blocks_received, 1);
    assert_eq!(counters.dup_data_received, x.len() as u64);
    assert_eq!(counters.unique_blocks_received(), 1);
    assert_eq!(store.count().await.unwrap(), 1);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_message_without_blocks_reaches_ledger() {
    let (exchange, _) = single().await;
    let peer = PeerId::random();
    let x = block("wanted by peer").id();

    let mut message = BlockMessage::new();
    message.add_entry(x, 1);
    exchange.receive_message(peer, message).await.unwrap();

    assert_eq!(exchange.wantlist_for_peer(&peer), vec![x]);
    assert_eq!(exchange.stat().counters.blocks_received, 0);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_session_records_delivering_peer() {
    let (exchange, _) = single().await;
    let session = exchange.new_session(&CancellationToken::new());
    let peer = PeerId::random();
    let x = block("session block");

    let mut rx = session
        .get_blocks(&CancellationToken::new(), vec![x.id()])
        .await
        .unwrap();
    assert!(session.interested_in(&x.id()));

    exchange
        .receive_message(peer, BlockMessage::with_blocks([x.clone()]))
        .await
        .unwrap();
    assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some(x.clone()));

    assert_eq!(session.peers(), vec![peer]);
    assert_eq!(session.blocks_received(), 1);
    assert!(!session.interested_in(&x.id()));
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_session_ends_its_fetches() {
    let (exchange, _) = single().await;
    let session = exchange.new_session(&CancellationToken::new());
    let x = block("session want").id();
    let mut rx = session
        .get_blocks(&CancellationToken::new(), vec![x])
        .await
        .unwrap();

    session.cancel();
    assert!(session.is_cancelled());
    assert!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert!(eventually(|| exchange.get_wantlist().is_empty()).await);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_search() {
    let net = MemoryNetwork::with_config(MemoryNetworkConfig {
        search_latency: Duration::from_millis(200),
        ..MemoryNetworkConfig::default()
    });
    let config = config().with_provider_search_delay(Duration::from_millis(10));
    let (exchange, _) = node(&net, config).await;
    let x = block("popular").id();

    let cancel = CancellationToken::new();
    let mut streams = Vec::new();
    for _ in 0..5 {
        streams.push(exchange.get_blocks(&cancel, vec![x]).await.unwrap());
    }

    assert!(eventually(|| exchange.active_provider_queries() == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = net.search_stats(&x);
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.peak_in_flight, 1);
    assert!(eventually(|| exchange.active_provider_queries() == 0).await);

    cancel.cancel();
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_first_key_search_only_looks_for_first_missing() {
    let net = MemoryNetwork::new();
    let (exchange, _) = node(&net, config()).await;
    let x = block("first").id();
    let y = block("second").id();

    let cancel = CancellationToken::new();
    let _rx = exchange.get_blocks(&cancel, vec![x, y]).await.unwrap();

    assert!(eventually(|| net.search_stats(&x).calls == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(net.search_stats(&y).calls, 0);

    cancel.cancel();
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_every_key_search_covers_all_missing() {
    let net = MemoryNetwork::new();
    let config = config().with_provider_search(blockswap::ProviderSearch::EveryKey);
    let (exchange, _) = node(&net, config).await;
    let x = block("first").id();
    let y = block("second").id();

    let cancel = CancellationToken::new();
    let _rx = exchange.get_blocks(&cancel, vec![x, y]).await.unwrap();

    assert!(
        eventually(|| net.search_stats(&x).calls == 1 && net.search_stats(&y).calls == 1).await
    );
    cancel.cancel();
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_new_block_is_announced() {
    let net = MemoryNetwork::new();
    let (exchange, _) = node(&net, config()).await;
    let x = block("announce me");
    exchange.has_block(x.clone()).await.unwrap();

    let me = exchange.local_peer();
    let mut announced = false;
    for _ in 0..200 {
        if net.providers_of(&x.id()).await.contains(&me) {
            announced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(announced);
    exchange.close().await.unwrap();
}

#[tokio::test]
async fn test_rebroadcast_searches_for_outstanding_want() {
    let net = MemoryNetwork::new();
    // The first search is far away; only the rebroadcast can trigger one.
    let config = config()
        .with_provider_search_delay(Duration::from_secs(60))
        .with_rebroadcast_delay(Duration::from_millis(50));
    let (exchange, _) = node(&net, config).await;
    let x = block("stubborn").id();

    let cancel = CancellationToken::new();
    let _rx = exchange.get_blocks(&cancel, vec![x]).await.unwrap();

    assert!(eventually(|| net.search_stats(&x).calls >= 2).await);
    cancel.cancel();
    exchange.close().await.unwrap();
}

/// A network whose announcements take a while, recording how many overlap.
struct SlowProvide {
    inner: MemoryAdapter,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl Network for SlowProvide {
    fn local_peer(&self) -> PeerId {
        self.inner.local_peer()
    }

    async fn send_message(&self, peer: &PeerId, message: BlockMessage) -> NetResult<()> {
        self.inner.send_message(peer, message).await
    }

    async fn recv(&self) -> NetResult<NetworkEvent> {
        self.inner.recv().await
    }

    async fn connect_to(&self, peer: &PeerId) -> NetResult<()> {
        self.inner.connect_to(peer).await
    }

    fn find_providers(
        &self,
        id: BlockId,
        max: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<PeerId> {
        self.inner.find_providers(id, max, cancel)
    }

    async fn provide(&self, id: &BlockId) -> NetResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        self.inner.provide(id).await
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.connected_peers().await
    }
}

#[tokio::test]
async fn test_announcements_respect_concurrency_limit() {
    let net = MemoryNetwork::new();
    let network = Arc::new(SlowProvide {
        inner: net.adapter(PeerId::random()).await,
        delay: Duration::from_millis(50),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        done: AtomicUsize::new(0),
    });
    let exchange = Exchange::with_engine(
        config().with_provide_workers(2),
        network.clone(),
        Arc::new(MemoryBlockStore::new()),
    );

    for n in 0..8 {
        exchange.has_block(block(&format!("burst {n}"))).await.unwrap();
    }

    assert!(eventually(|| network.done.load(Ordering::SeqCst) == 8).await);
    assert_eq!(network.peak.load(Ordering::SeqCst), 2);
    exchange.close().await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Failure handling
// ─────────────────────────────────────────────────────────────────────────────

/// A store whose every operation fails.
struct BrokenStore;

fn broken() -> StoreError {
    StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
}

#[async_trait]
impl BlockStore for BrokenStore {
    async fn put(&self, _block: &Block) -> blockswap::store::Result<PutResult> {
        Err(broken())
    }

    async fn get(&self, _id: &BlockId) -> blockswap::store::Result<Block> {
        Err(broken())
    }

    async fn has(&self, _id: &BlockId) -> blockswap::store::Result<bool> {
        Err(broken())
    }

    async fn delete(&self, _id: &BlockId) -> blockswap::store::Result<bool> {
        Err(broken())
    }

    async fn all_ids(&self) -> blockswap::store::Result<Vec<BlockId>> {
        Err(broken())
    }

    async fn count(&self) -> blockswap::store::Result<usize> {
        Err(broken())
    }
}

#[tokio::test]
async fn test_store_failure_propagates() {
    let net = MemoryNetwork::new();
    let adapter = net.adapter(PeerId::random()).await;
    let exchange = Exchange::with_engine(config(), Arc::new(adapter), Arc::new(BrokenStore));
    let x = block("doomed");

    assert!(matches!(
        exchange.has_block(x.clone()).await,
        Err(ExchangeError::Store(_))
    ));
    assert!(matches!(
        exchange.get_blocks(&CancellationToken::new(), vec![x.id()]).await,
        Err(ExchangeError::Store(_))
    ));
    assert!(matches!(
        exchange
            .receive_message(PeerId::random(), BlockMessage::with_blocks([x.clone()]))
            .await,
        Err(ExchangeError::Store(_))
    ));
    assert!(exchange.get_wantlist().is_empty());
    // Store failures do not take the exchange down.
    assert!(!exchange.is_closed());
    exchange.close().await.unwrap();
}

/// A ledger that blows up as soon as a peer talks to it.
struct PanickingLedger {
    _slots: tokio::sync::mpsc::Sender<EnvelopeSlot>,
    outbox: Outbox,
}

impl PanickingLedger {
    fn new() -> Self {
        let (slots, outbox) = Outbox::channel(1);
        Self {
            _slots: slots,
            outbox,
        }
    }
}

#[async_trait]
impl Ledger for PanickingLedger {
    fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    async fn message_received(&self, _peer: &PeerId, _message: &BlockMessage) {
        panic!("ledger corrupted");
    }

    fn message_sent(&self, _peer: &PeerId, _message: &BlockMessage) {}

    async fn add_block(&self, _block: &Block) {}

    fn wantlist_for_peer(&self, _peer: &PeerId) -> Vec<WantEntry> {
        Vec::new()
    }

    fn ledger_for_peer(&self, _peer: &PeerId) -> Option<LedgerReceipt> {
        None
    }

    fn peer_connected(&self, _peer: &PeerId) {}

    fn peer_disconnected(&self, _peer: &PeerId) {}
}

#[tokio::test]
async fn test_worker_panic_surfaces_on_close() {
    let net = MemoryNetwork::new();
    let adapter = net.adapter(PeerId::random()).await;
    let local = adapter.local_peer();
    let exchange = Exchange::new(
        config(),
        Arc::new(adapter),
        Arc::new(MemoryBlockStore::new()),
        Arc::new(PanickingLedger::new()),
    );

    let remote: MemoryAdapter = net.adapter(PeerId::random()).await;
    remote
        .send_message(&local, BlockMessage::with_blocks([block("trigger")]))
        .await
        .unwrap();

    assert!(eventually(|| exchange.is_closed()).await);
    match exchange.close().await {
        Err(ExchangeError::WorkerPanicked(message)) => {
            assert!(message.contains("ledger corrupted"))
        }
        other => panic!("expected worker panic, got {other:?}"),
    }
}
