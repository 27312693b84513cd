use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credentials;
use crate::rate_limit::RateLimiter;

const DEFAULT_MAX_SOCKET_CONNECTIONS: usize = 8;
const DEFAULT_COMBINE_TARGET: usize = 10;
const DEFAULT_NO_DATA_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/**
 * Client-wide configuration for a Socket API Client and the pool of
 * connections it owns.
 */
#[derive(Clone)]
pub struct ClientOptions {
    pub base_address: String,
    pub max_socket_connections: usize,
    pub max_connections_per_address: Option<usize>,
    pub socket_subscriptions_combine_target: usize,
    pub socket_no_data_timeout: Duration,
    pub reconnect_interval: Duration,
    pub auto_reconnect: bool,
    pub delay_after_connect: Duration,
    pub keep_alive_interval: Duration,
    pub proxy: Option<String>,
    pub output_original_data: bool,
    pub unhandled_expected: bool,
    pub api_credentials: Option<Credentials>,
    pub rate_limiters: Vec<Arc<dyn RateLimiter>>,
}

#[derive(Clone)]
pub struct ClientOptionsBuilder {
    base_address: String,
    max_socket_connections: usize,
    max_connections_per_address: Option<usize>,
    socket_subscriptions_combine_target: usize,
    socket_no_data_timeout: Duration,
    reconnect_interval: Duration,
    auto_reconnect: bool,
    delay_after_connect: Duration,
    keep_alive_interval: Duration,
    proxy: Option<String>,
    output_original_data: bool,
    unhandled_expected: bool,
    api_credentials: Option<Credentials>,
    rate_limiters: Vec<Arc<dyn RateLimiter>>,
}

impl ClientOptions {
    pub fn builder(base_address: impl Into<String>) -> ClientOptionsBuilder {
        ClientOptionsBuilder::new(base_address)
    }
}

impl ClientOptionsBuilder {
    fn new(base_address: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            max_socket_connections: DEFAULT_MAX_SOCKET_CONNECTIONS,
            max_connections_per_address: None,
            socket_subscriptions_combine_target: DEFAULT_COMBINE_TARGET,
            socket_no_data_timeout: DEFAULT_NO_DATA_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            auto_reconnect: true,
            delay_after_connect: Duration::ZERO,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            proxy: None,
            output_original_data: false,
            unhandled_expected: false,
            api_credentials: None,
            rate_limiters: Vec::new(),
        }
    }

    pub fn with_max_socket_connections(mut self, max: usize) -> Self {
        self.max_socket_connections = max;
        self
    }

    /// Per-address override of `max_socket_connections`, for pools that share
    /// one client but talk to more than one host.
    pub fn with_max_connections_per_address(mut self, max: usize) -> Self {
        self.max_connections_per_address = Some(max);
        self
    }

    pub fn with_combine_target(mut self, target: usize) -> Self {
        self.socket_subscriptions_combine_target = target;
        self
    }

    pub fn with_no_data_timeout(mut self, timeout: Duration) -> Self {
        self.socket_no_data_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_delay_after_connect(mut self, delay: Duration) -> Self {
        self.delay_after_connect = delay;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_output_original_data(mut self, enabled: bool) -> Self {
        self.output_original_data = enabled;
        self
    }

    /// Suppresses the warning-level log on `UnhandledMessage` for this client's connections.
    pub fn with_unhandled_expected(mut self, expected: bool) -> Self {
        self.unhandled_expected = expected;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.api_credentials = Some(credentials);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiters.push(limiter);
        self
    }

    pub fn build(self) -> ClientOptions {
        ClientOptions {
            base_address: self.base_address,
            max_socket_connections: self.max_socket_connections,
            max_connections_per_address: self.max_connections_per_address,
            socket_subscriptions_combine_target: self.socket_subscriptions_combine_target,
            socket_no_data_timeout: self.socket_no_data_timeout,
            reconnect_interval: self.reconnect_interval,
            auto_reconnect: self.auto_reconnect,
            delay_after_connect: self.delay_after_connect,
            keep_alive_interval: self.keep_alive_interval,
            proxy: self.proxy,
            output_original_data: self.output_original_data,
            unhandled_expected: self.unhandled_expected,
            api_credentials: self.api_credentials,
            rate_limiters: self.rate_limiters,
        }
    }
}
