//! In-memory broker for unit tests, also exported under the `test-utils`
//! feature for crates that host a supervisor.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;

use crate::broker::{BoxFuture, Broker, BrokerSession, Subscription, SubscriptionHandle};
use crate::config::{
    BindingOptions, BridgeConfig, ConnectionConfig, ExchangeOptions, OffsetPolicy,
    RECONNECT_DELAY, StreamDescriptor, Topology,
};
use crate::error::BrokerError;
use crate::framer::FlattenOptions;
use crate::sink::OverflowPolicy;

type Sender = fmpsc::UnboundedSender<Result<Vec<u8>, BrokerError>>;

#[derive(Default)]
struct State {
    fail_opens: AtomicUsize,
    fail_exchanges: AtomicBool,
    stall_exchanges: AtomicBool,
    stall_subscribe: AtomicBool,
    /// `open` against this host never completes.
    stalled_host: Mutex<Option<String>>,
    opens: AtomicUsize,
    subscriptions: AtomicUsize,
    next_id: AtomicU64,
    /// (subscription id, sender) of the live subscription.
    live: Mutex<Option<(u64, Sender)>>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    log: Mutex<Vec<String>>,
}

impl State {
    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.state.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_exchanges(&self, fail: bool) {
        self.state.fail_exchanges.store(fail, Ordering::SeqCst);
    }

    /// Exchange declarations hang forever, leaving the session half
    /// provisioned.
    pub fn stall_exchanges(&self, stall: bool) {
        self.state.stall_exchanges.store(stall, Ordering::SeqCst);
    }

    /// `subscribe` hangs forever.
    pub fn stall_subscribe(&self, stall: bool) {
        self.state.stall_subscribe.store(stall, Ordering::SeqCst);
    }

    pub fn stall_host(&self, host: &str) {
        *self.state.stalled_host.lock().unwrap() = Some(host.to_string());
    }

    /// Successful and failed `open` calls.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    pub fn has_subscriber(&self) -> bool {
        self.state.live.lock().unwrap().is_some()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Push a payload to the live subscription. `false` if nobody listens.
    pub fn deliver(&self, payload: &str) -> bool {
        match &*self.state.live.lock().unwrap() {
            Some((_, tx)) => tx.unbounded_send(Ok(payload.as_bytes().to_vec())).is_ok(),
            None => false,
        }
    }

    /// Push a delivery error to the live subscription.
    pub fn deliver_error(&self, message: &str) -> bool {
        match &*self.state.live.lock().unwrap() {
            Some((_, tx)) => tx.unbounded_send(Err(BrokerError::new("delivery", message))).is_ok(),
            None => false,
        }
    }

    /// Broker-side close of the live subscription; its delivery stream ends.
    pub fn close_subscription(&self) -> bool {
        self.state.live.lock().unwrap().take().is_some()
    }

    /// Connection loss: every session reports closed, subscription ends.
    pub fn drop_connection(&self) {
        for session in self.state.sessions.lock().unwrap().iter() {
            session.open.store(false, Ordering::SeqCst);
        }
        self.close_subscription();
    }
}

impl Broker for MemoryBroker {
    fn open<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn BrokerSession>, BrokerError>> {
        Box::pin(async move {
            let stalled = self.state.stalled_host.lock().unwrap().as_deref() == Some(config.host.as_str());
            if stalled {
                self.state.record(format!("open pending {}", config.host));
                return futures::future::pending().await;
            }
            self.state.opens.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .state
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                self.state.record("open failed");
                return Err(BrokerError::new("open", format!("{} unreachable", config.host)));
            }
            self.state.record("open");
            let session = Arc::new(MemorySession {
                open: AtomicBool::new(true),
                state: self.state.clone(),
            });
            self.state.sessions.lock().unwrap().push(session.clone());
            Ok(session as Arc<dyn BrokerSession>)
        })
    }
}

struct MemorySession {
    open: AtomicBool,
    state: Arc<State>,
}

impl MemorySession {
    fn op<'a>(&'a self, entry: String) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            if !self.open.load(Ordering::SeqCst) {
                return Err(BrokerError::new(entry, "session closed"));
            }
            self.state.record(entry);
            Ok(())
        })
    }
}

impl BrokerSession for MemorySession {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn declare_stream<'a>(&'a self, stream: &'a StreamDescriptor) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.op(format!("declare_stream {}", stream.name))
    }

    fn delete_stream<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.op(format!("delete_stream {name}"))
    }

    fn declare_exchange<'a>(&'a self, exchange: &'a ExchangeOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        if self.state.stall_exchanges.load(Ordering::SeqCst) {
            return Box::pin(futures::future::pending());
        }
        if self.state.fail_exchanges.load(Ordering::SeqCst) {
            let name = exchange.name.clone();
            return Box::pin(async move { Err(BrokerError::new(format!("declare exchange {name}"), "access refused")) });
        }
        self.op(format!("declare_exchange {}", exchange.name))
    }

    fn delete_exchange<'a>(&'a self, exchange: &'a ExchangeOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.op(format!("delete_exchange {}", exchange.name))
    }

    fn bind<'a>(&'a self, binding: &'a BindingOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.op(format!("bind {}->{}", binding.sender_name, binding.receiver_name))
    }

    fn unbind<'a>(&'a self, binding: &'a BindingOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        self.op(format!("unbind {}->{}", binding.sender_name, binding.receiver_name))
    }

    fn subscribe<'a>(&'a self, stream: &'a StreamDescriptor) -> BoxFuture<'a, Result<Subscription, BrokerError>> {
        Box::pin(async move {
            if !self.open.load(Ordering::SeqCst) {
                return Err(BrokerError::new("subscribe", "session closed"));
            }
            if self.state.stall_subscribe.load(Ordering::SeqCst) {
                self.state.record(format!("subscribe pending {}", stream.name));
                return futures::future::pending().await;
            }
            let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = fmpsc::unbounded();
            *self.state.live.lock().unwrap() = Some((id, tx));
            self.state.subscriptions.fetch_add(1, Ordering::SeqCst);
            self.state.record(format!("subscribe {}", stream.name));
            Ok(Subscription {
                deliveries: Box::pin(rx),
                handle: Box::new(MemoryHandle {
                    id,
                    state: self.state.clone(),
                }),
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            self.state.record("close");
            Ok(())
        })
    }
}

struct MemoryHandle {
    id: u64,
    state: Arc<State>,
}

impl SubscriptionHandle for MemoryHandle {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            let mut live = self.state.live.lock().unwrap();
            if matches!(&*live, Some((id, _)) if *id == self.id) {
                *live = None;
            }
            drop(live);
            self.state.record("unsubscribe");
            Ok(())
        })
    }
}

/// Config with one exchange and one queue binding, both flagged for disposal,
/// plus one exchange that is kept.
pub fn bridge_config() -> BridgeConfig {
    let mut stream = StreamDescriptor::named("metrics");
    stream.dispose_on_close = true;
    stream.offset = OffsetPolicy::FromLatest;

    BridgeConfig {
        connection: ConnectionConfig {
            host: "rabbit".into(),
            stream_port: 5552,
            amqp_port: 5672,
            vhost: "/".into(),
            username: "guest".into(),
            password: "guest".into(),
            tls: false,
            heartbeat: Duration::from_secs(60),
            max_frame_size: 0,
            write_buffer: 0,
            read_buffer: 0,
            no_delay: false,
            load_balancer_mode: false,
        },
        stream,
        topology: Topology {
            exchanges: vec![
                ExchangeOptions {
                    name: "ingest".into(),
                    kind: "topic".into(),
                    should_dispose_exchange: true,
                    ..Default::default()
                },
                ExchangeOptions {
                    name: "shared".into(),
                    kind: "fanout".into(),
                    ..Default::default()
                },
            ],
            bindings: vec![BindingOptions {
                sender_name: "ingest".into(),
                routing_key: "#".into(),
                receiver_name: "metrics".into(),
                is_queue_binding: true,
                should_dispose_binding: true,
                ..Default::default()
            }],
        },
        flatten: FlattenOptions::default(),
        reconnect_delay: RECONNECT_DELAY,
        delivery_buffer: 16,
        overflow: OverflowPolicy::BackPressure,
    }
}

/// Poll `cond` under the (usually paused) tokio clock.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
