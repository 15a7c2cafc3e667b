use std::collections::HashMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::configs::{Broker, BrokerTls};
use crate::errors::{ObserverError, TransportError};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Receiver of every message the broker delivers.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    /// Name of the observer (for logging)
    fn name(&self) -> &'static str;

    /// Process one message; `payload` is already decoded as UTF-8
    async fn on_message(&self, topic: &str, payload: &str) -> Result<(), ObserverError>;

    /// Called after every successful (re)connect
    async fn on_connect(&self) {}

    /// Called once each time an established session is lost
    async fn on_disconnect(&self) {}
}

/// Adapts a plain closure to [`MessageObserver`].
pub struct FnObserver<F> {
    name: &'static str,
    callback: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&str, &str) -> Result<(), ObserverError> + Send + Sync,
{
    pub fn new(name: &'static str, callback: F) -> Self {
        Self { name, callback }
    }
}

#[async_trait]
impl<F> MessageObserver for FnObserver<F>
where
    F: Fn(&str, &str) -> Result<(), ObserverError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn on_message(&self, topic: &str, payload: &str) -> Result<(), ObserverError> {
        (self.callback)(topic, payload)
    }
}

/// Change of the broker session, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

#[derive(Debug)]
enum Inbound {
    Message { topic: String, payload: Vec<u8> },
    Session(SessionEvent),
}

/// Fans inbound messages out to observers and remembers the last payload per topic.
#[derive(Clone, Default)]
pub struct MessageDispatcher {
    observers: Arc<RwLock<Vec<Arc<dyn MessageObserver>>>>,
    latest_messages: Arc<RwLock<HashMap<String, String>>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, observer: Arc<dyn MessageObserver>) {
        tracing::debug!("register observer {}", observer.name());

        self.observers.write().await.push(observer);
    }

    /// Delivers one message to every observer in registration order.
    ///
    /// Returns how many observers handled it without error. A failing or
    /// panicking observer is logged and skipped.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let Ok(text) = std::str::from_utf8(payload) else {
            tracing::warn!("dropping non UTF-8 payload on {topic}");
            return 0;
        };

        tracing::debug!("received message on {topic}: {text}");

        self.latest_messages
            .write()
            .await
            .insert(topic.to_string(), text.to_string());

        let observers = self.observers.read().await.clone();
        let mut delivered = 0;

        for observer in observers {
            let outcome = AssertUnwindSafe(observer.on_message(topic, text))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ObserverError::Panicked(observer.name())));

            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => tracing::error!("Error in observer {}: {}", observer.name(), e),
            }
        }

        delivered
    }

    /// Tells every observer about a session change. Returns how many ran to completion.
    pub async fn notify(&self, event: SessionEvent) -> usize {
        let observers = self.observers.read().await.clone();
        let mut notified = 0;

        for observer in observers {
            let hook = match event {
                SessionEvent::Connected => observer.on_connect(),
                SessionEvent::Disconnected => observer.on_disconnect(),
            };

            match AssertUnwindSafe(hook).catch_unwind().await {
                Ok(()) => notified += 1,
                Err(_) => tracing::error!("{}", ObserverError::Panicked(observer.name())),
            }
        }

        notified
    }

    pub async fn latest_message(&self, topic: &str) -> Option<String> {
        self.latest_messages.read().await.get(topic).cloned()
    }

    pub async fn latest_messages(&self) -> HashMap<String, String> {
        self.latest_messages.read().await.clone()
    }
}

/// MQTT client adapter.
///
/// Network I/O runs on one background task; observers run on a second task
/// fed through a channel, never inside the polling loop.
pub struct MqttService {
    broker: Broker,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    subscriptions: Arc<RwLock<Vec<String>>>,
    dispatcher: MessageDispatcher,
    connected: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MqttService {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            client: None,
            event_loop: None,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            dispatcher: MessageDispatcher::new(),
            connected: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Opens the session and waits for the broker's CONNACK.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let mut options = MqttOptions::new(&self.broker.client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(self.broker.keep_alive());
        options.set_clean_session(true);

        if let Some(tls) = &self.broker.tls {
            options.set_transport(tls_transport(tls)?);
        }

        let (client, mut event_loop) = AsyncClient::new(options, self.broker.channel_capacity);

        tracing::info!("connecting to MQTT broker at {}:{}", self.broker.host, self.broker.port);

        let timeout = self.broker.connect_timeout();
        let ack = tokio::time::timeout(timeout, wait_for_connack(&mut event_loop))
            .await
            .map_err(|_| TransportError::ConnectTimeout(timeout))??;

        if ack.code != ConnectReturnCode::Success {
            return Err(TransportError::Refused(ack.code));
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("successfully connected to MQTT broker");

        resubscribe(&client, &self.subscriptions).await;

        self.client = Some(client);
        self.event_loop = Some(event_loop);

        Ok(())
    }

    /// Adds `target` to the subscriptions that are issued on every (re)connect.
    pub async fn subscribe(&self, target: &str) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.subscriptions.write().await;
            if subscriptions.iter().any(|topic| topic == target) {
                return Ok(());
            }
            subscriptions.push(target.to_string());
        }

        if let Some(client) = &self.client {
            client.subscribe(target, QoS::AtLeastOnce).await?;
            tracing::info!("subscribed to {target}");
        }

        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.clone()
    }

    pub async fn register_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.dispatcher.register(observer).await;
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub async fn latest_message(&self, topic: &str) -> Option<String> {
        self.dispatcher.latest_message(topic).await
    }

    pub async fn latest_messages(&self) -> HashMap<String, String> {
        self.dispatcher.latest_messages().await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Spawns the network loop and the observer dispatch task.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.stop_tx.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let (Some(client), Some(event_loop)) = (self.client.clone(), self.event_loop.take()) else {
            return Err(TransportError::NotConnected);
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(self.broker.channel_capacity);

        if self.is_connected() {
            forward(&inbound_tx, Inbound::Session(SessionEvent::Connected));
        }

        let network = tokio::spawn(drive_event_loop(
            event_loop,
            client,
            self.subscriptions.clone(),
            self.connected.clone(),
            inbound_tx,
            stop_rx,
        ));

        let dispatcher = self.dispatcher.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                match inbound {
                    Inbound::Message { topic, payload } => {
                        dispatcher.dispatch(&topic, &payload).await;
                    }
                    Inbound::Session(event) => {
                        dispatcher.notify(event).await;
                    }
                }
            }
        });

        self.stop_tx = Some(stop_tx);
        self.tasks = vec![network, dispatch];

        Ok(())
    }

    /// Disconnects and waits for the background tasks to finish.
    pub async fn stop(&mut self) {
        if let Some(client) = &self.client {
            if let Err(e) = client.try_disconnect() {
                tracing::warn!("failed to queue disconnect: {e}");
            }
        }

        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!("MQTT task ended abnormally: {e}");
            }
        }

        self.client = None;
        self.event_loop = None;
        self.connected.store(false, Ordering::SeqCst);

        tracing::info!("disconnected from MQTT broker");
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<ConnAck, TransportError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = event_loop.poll().await? {
            return Ok(ack);
        }
    }
}

async fn resubscribe(client: &AsyncClient, subscriptions: &RwLock<Vec<String>>) {
    for target in subscriptions.read().await.iter() {
        match client.try_subscribe(target, QoS::AtLeastOnce) {
            Ok(()) => tracing::info!("subscribed to {target}"),
            Err(e) => tracing::error!("failed to subscribe to {target}: {e}"),
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<RwLock<Vec<String>>>,
    connected: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<Inbound>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            notification = event_loop.poll() => match notification {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = Inbound::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if !forward(&inbound_tx, message) {
                        tracing::warn!("message dispatcher is gone, stopping MQTT loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    tracing::info!("reconnected to MQTT broker");
                    resubscribe(&client, &subscriptions).await;
                    forward(&inbound_tx, Inbound::Session(SessionEvent::Connected));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::warn!("broker closed the session");
                    mark_disconnected(&connected, &inbound_tx);
                }
                Ok(_) => {}
                Err(e) => {
                    mark_disconnected(&connected, &inbound_tx);
                    tracing::error!("unexpected disconnection: {e}, attempting to reconnect");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
        }
    }

    // let the queued DISCONNECT reach the broker
    let _ = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    mark_disconnected(&connected, &inbound_tx);
}

/// Hands an inbound item to the dispatch task without waiting.
///
/// A full queue drops the item so the poll loop keeps answering pings.
/// Returns `false` once the dispatch task is gone.
fn forward(inbound_tx: &mpsc::Sender<Inbound>, inbound: Inbound) -> bool {
    match inbound_tx.try_send(inbound) {
        Ok(()) => true,
        Err(TrySendError::Full(Inbound::Message { topic, .. })) => {
            tracing::warn!("dispatch queue full, dropping message on {topic}");
            true
        }
        Err(TrySendError::Full(Inbound::Session(event))) => {
            tracing::warn!("dispatch queue full, dropping {event:?} notification");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

fn mark_disconnected(connected: &AtomicBool, inbound_tx: &mpsc::Sender<Inbound>) {
    if connected.swap(false, Ordering::SeqCst) {
        forward(inbound_tx, Inbound::Session(SessionEvent::Disconnected));
    }
}

fn tls_transport(tls: &BrokerTls) -> Result<Transport, TransportError> {
    let ca = fs::read(&tls.ca_path)?;

    let client_auth = match (&tls.cert_path, &tls.key_path) {
        (Some(cert_path), Some(key_path)) => Some((fs::read(cert_path)?, fs::read(key_path)?)),
        _ => None,
    };

    Ok(Transport::tls(ca, client_auth, None))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn broker(port: u16) -> Broker {
        Broker {
            host: String::from("127.0.0.1"),
            port,
            client_id: String::from("biosync-test"),
            keep_alive_secs: 5,
            connect_timeout_secs: 2,
            namespace: String::from("Emotibit"),
            subscription: None,
            channel_capacity: 10,
            tls: None,
        }
    }

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn MessageObserver> {
        Arc::new(FnObserver::new(name, move |topic: &str, payload: &str| {
            log.lock().unwrap().push(format!("{name}:{topic}:{payload}"));
            Ok(())
        }))
    }

    struct PanickingObserver;

    #[async_trait]
    impl MessageObserver for PanickingObserver {
        fn name(&self) -> &'static str {
            "PanickingObserver"
        }

        async fn on_message(&self, _topic: &str, _payload: &str) -> Result<(), ObserverError> {
            panic!("observer bug");
        }

        async fn on_connect(&self) {
            panic!("observer bug");
        }
    }

    #[derive(Default)]
    struct SessionRecorder {
        events: Mutex<Vec<SessionEvent>>,
    }

    #[async_trait]
    impl MessageObserver for SessionRecorder {
        fn name(&self) -> &'static str {
            "SessionRecorder"
        }

        async fn on_message(&self, _topic: &str, _payload: &str) -> Result<(), ObserverError> {
            Ok(())
        }

        async fn on_connect(&self) {
            self.events.lock().unwrap().push(SessionEvent::Connected);
        }

        async fn on_disconnect(&self) {
            self.events.lock().unwrap().push(SessionEvent::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let dispatcher = MessageDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.register(recorder("first", log.clone())).await;
        dispatcher.register(recorder("second", log.clone())).await;

        assert_eq!(dispatcher.dispatch("Emotibit/D1", b"{}").await, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:Emotibit/D1:{}", "second:Emotibit/D1:{}"]
        );
    }

    #[tokio::test]
    async fn test_failing_observers_are_isolated() {
        let dispatcher = MessageDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher
            .register(Arc::new(FnObserver::new("failing", |_: &str, _: &str| {
                Err(ObserverError::failed("failing", "boom"))
            })))
            .await;
        dispatcher.register(Arc::new(PanickingObserver)).await;
        dispatcher.register(recorder("last", log.clone())).await;

        assert_eq!(dispatcher.dispatch("Emotibit/D1", b"hello").await, 1);
        assert_eq!(*log.lock().unwrap(), vec!["last:Emotibit/D1:hello"]);

        // the dispatcher keeps working afterwards
        assert_eq!(dispatcher.dispatch("Emotibit/D1", b"again").await, 1);
    }

    #[tokio::test]
    async fn test_latest_message_cache_overwrites() {
        let dispatcher = MessageDispatcher::new();

        dispatcher.dispatch("Emotibit/D1", b"one").await;
        dispatcher.dispatch("Emotibit/D1", b"two").await;
        dispatcher.dispatch("Emotibit/D2", b"three").await;

        assert_eq!(dispatcher.latest_message("Emotibit/D1").await.as_deref(), Some("two"));
        assert_eq!(dispatcher.latest_messages().await.len(), 2);
        assert!(dispatcher.latest_message("Emotibit/D3").await.is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_payload_is_dropped() {
        let dispatcher = MessageDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(recorder("only", log.clone())).await;

        assert_eq!(dispatcher.dispatch("Emotibit/D1", &[0xff, 0xfe]).await, 0);
        assert!(log.lock().unwrap().is_empty());
        assert!(dispatcher.latest_message("Emotibit/D1").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let service = MqttService::new(broker(1883));

        service.subscribe("Emotibit/#").await.unwrap();
        service.subscribe("Emotibit/#").await.unwrap();

        assert_eq!(service.subscriptions().await, vec!["Emotibit/#"]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // nothing listens on port 1
        let mut service = MqttService::new(broker(1));

        assert!(service.connect().await.is_err());
        assert!(!service.is_connected());
        assert!(matches!(service.start(), Err(TransportError::NotConnected)));

        service.stop().await;
    }

    #[tokio::test]
    async fn test_session_events_reach_observers() {
        let dispatcher = MessageDispatcher::new();
        let sessions = Arc::new(SessionRecorder::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.register(Arc::new(PanickingObserver)).await;
        dispatcher.register(sessions.clone()).await;
        dispatcher.register(recorder("plain", log.clone())).await;

        // the panicking hook is skipped, the closure observer uses the no-op defaults
        assert_eq!(dispatcher.notify(SessionEvent::Connected).await, 2);
        assert_eq!(dispatcher.notify(SessionEvent::Disconnected).await, 3);

        assert_eq!(
            *sessions.events.lock().unwrap(),
            vec![SessionEvent::Connected, SessionEvent::Disconnected]
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_waiting() {
        let (tx, mut rx) = mpsc::channel(1);
        let message = |topic: &str| Inbound::Message {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
        };

        assert!(forward(&tx, message("Emotibit/D1")));
        assert!(forward(&tx, message("Emotibit/D2")));

        match rx.recv().await {
            Some(Inbound::Message { topic, .. }) => assert_eq!(topic, "Emotibit/D1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forward(&tx, message("Emotibit/D3")));
    }

    #[tokio::test]
    async fn test_disconnect_is_reported_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let connected = AtomicBool::new(true);

        mark_disconnected(&connected, &tx);
        mark_disconnected(&connected, &tx);

        assert!(!connected.load(Ordering::SeqCst));
        assert!(matches!(
            rx.try_recv(),
            Ok(Inbound::Session(SessionEvent::Disconnected))
        ));
        assert!(rx.try_recv().is_err());
    }
}
