//! Exchange configuration.

use std::time::Duration;

/// Which identifiers of a request are handed to provider discovery once the
/// search delay expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSearch {
    /// Search for the first identifier still missing and assume its providers
    /// hold the rest. Cheap, but not guaranteed to find every block.
    #[default]
    FirstKey,
    /// Search for every missing identifier.
    EveryKey,
}

/// Configuration for an [`Exchange`](crate::Exchange).
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Workers draining the ledger's outbox.
    pub task_worker_count: usize,
    /// How long a request waits for connected peers before searching for providers.
    pub provider_search_delay: Duration,
    /// Upper bound on one provider search.
    pub provider_request_timeout: Duration,
    /// Upper bound on one provide announcement.
    pub provide_timeout: Duration,
    /// Providers to connect to per search.
    pub max_providers_per_request: usize,
    /// Capacity of the provider request queue.
    pub find_keys_buffer: usize,
    /// Capacity of the queue of newly stored blocks awaiting announcement.
    pub has_block_buffer: usize,
    /// Capacity of the announcement queue.
    pub provide_keys_buffer: usize,
    /// Concurrent announcements.
    pub provide_worker_max: usize,
    /// Period of the want rebroadcast.
    pub rebroadcast_delay: Duration,
    /// Period of the want-list size debug log.
    pub wantlist_log_interval: Duration,
    pub provider_search: ProviderSearch,
    /// Announce newly stored blocks to the network.
    pub provide_enabled: bool,
    /// Fetch every block other peers announce, if the network offers an
    /// announcement feed.
    pub replicate_announced: bool,
    /// Upper bound on fetching one announced block.
    pub replication_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            task_worker_count: 8,
            provider_search_delay: Duration::from_secs(1),
            provider_request_timeout: Duration::from_secs(10),
            provide_timeout: Duration::from_secs(15),
            max_providers_per_request: 3,
            find_keys_buffer: 32,
            has_block_buffer: 256,
            provide_keys_buffer: 2048,
            provide_worker_max: 512,
            rebroadcast_delay: Duration::from_secs(60),
            wantlist_log_interval: Duration::from_secs(10),
            provider_search: ProviderSearch::FirstKey,
            provide_enabled: true,
            replicate_announced: false,
            replication_timeout: Duration::from_secs(60),
        }
    }
}

impl ExchangeConfig {
    /// Smaller queues and fewer concurrent announcements.
    pub fn low_memory() -> Self {
        Self {
            has_block_buffer: 64,
            provide_keys_buffer: 512,
            provide_worker_max: 16,
            ..Self::default()
        }
    }

    pub fn with_provider_search_delay(mut self, delay: Duration) -> Self {
        self.provider_search_delay = delay;
        self
    }

    pub fn with_rebroadcast_delay(mut self, delay: Duration) -> Self {
        self.rebroadcast_delay = delay;
        self
    }

    pub fn with_provider_request_timeout(mut self, timeout: Duration) -> Self {
        self.provider_request_timeout = timeout;
        self
    }

    pub fn with_provider_search(mut self, strategy: ProviderSearch) -> Self {
        self.provider_search = strategy;
        self
    }

    pub fn with_task_workers(mut self, count: usize) -> Self {
        self.task_worker_count = count;
        self
    }

    pub fn with_provide(mut self, enabled: bool) -> Self {
        self.provide_enabled = enabled;
        self
    }

    pub fn with_replication(mut self, enabled: bool) -> Self {
        self.replicate_announced = enabled;
        self
    }

    pub fn with_provide_workers(mut self, max: usize) -> Self {
        self.provide_worker_max = max;
        self
    }
}
