use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serialize::SerializationProtocol;
use crate::thread_pool::ThreadingModel;
use crate::RUNTIME_VERSION;

/// default limit for a single message
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

/// Server tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// frames announcing more bytes are rejected
    pub max_message_length: usize,
    /// highest runtime version the server speaks
    pub runtime_version: i32,
    /// dispatch worker threads
    pub threading: ThreadingModel,
    /// idle time after which a surplus dynamic worker retires
    pub worker_idle_timeout: Duration,
    /// capacity of the object token pool
    pub token_count: usize,
    /// idle time after which an unreferenced leased object is reclaimed
    pub object_timeout: Duration,
    /// period of the idle sweep
    pub sweep_interval: Duration,
    /// pool utilization that triggers an early sweep
    pub sweep_threshold: f32,
    /// time spent draining a connection after rejecting an oversized frame
    pub linger: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            runtime_version: RUNTIME_VERSION,
            threading: ThreadingModel::default(),
            worker_idle_timeout: Duration::from_secs(30),
            token_count: 2000,
            object_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            sweep_threshold: 0.5,
            linger: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// set `max_message_length`
    pub fn max_message_length(mut self, len: usize) -> Self {
        self.max_message_length = len;
        self
    }

    /// set `runtime_version`
    pub fn runtime_version(mut self, version: i32) -> Self {
        self.runtime_version = version;
        self
    }

    /// set `threading`
    pub fn threading(mut self, model: ThreadingModel) -> Self {
        self.threading = model;
        self
    }

    /// set `token_count`
    pub fn token_count(mut self, count: usize) -> Self {
        self.token_count = count;
        self
    }

    /// set `object_timeout`
    pub fn object_timeout(mut self, timeout: Duration) -> Self {
        self.object_timeout = timeout;
        self
    }

    /// set `sweep_interval`
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// set `sweep_threshold`, clamped to `0.0..=1.0`
    pub fn sweep_threshold(mut self, threshold: f32) -> Self {
        self.sweep_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// set `linger`
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

/// Client tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// bound on establishing a connection
    pub connect_timeout: Duration,
    /// bound on a whole call, connect included
    pub call_timeout: Duration,
    /// serialization of arguments and results
    pub protocol: SerializationProtocol,
    /// runtime version announced to the server
    pub runtime_version: i32,
    /// downgrade and retry once when the server is older
    pub auto_versioning: bool,
    /// reconnect transparently when the connection was lost
    pub auto_reconnect: bool,
    /// responses announcing more bytes are rejected
    pub max_message_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(10),
            protocol: SerializationProtocol::default(),
            runtime_version: RUNTIME_VERSION,
            auto_versioning: true,
            auto_reconnect: true,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}
